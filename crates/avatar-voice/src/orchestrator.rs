//! Conversation orchestrator - session lifecycle, turn taking and reply sequencing.
//!
//! One tokio task owns every piece of conversation state. The presentation layer talks
//! to it through an [`OrchestratorHandle`]; recognition, transport, speech queue,
//! completion and timer events all arrive in the same task and are handled one at a
//! time, so the transcript is never shared.
//!
//! Work that may take long (media establishment, completions, delays) runs in spawned
//! tasks that report back tagged with the session epoch. Results for an older epoch
//! belong to a stopped session and are dropped.

use crate::completion::{CompletionClient, CompletionService};
use crate::config::{AvatarConfig, ConfigHandle, TurnMode};
use crate::error::{AvatarError, AvatarResult, ErrorKind};
use crate::media::{
    AvatarBackend, MediaSessionClient, MediaSignal, MediaSinks, RelayCredentialSource, SessionEngines,
    TransportEvent,
};
use crate::recognition::{RecognitionEvent, SpeechTranscriptionEngine, StartOutcome, TranscriptionController};
use crate::speech_queue::{SpeechEvent, SpeechOutputQueue, SpeechSynthesisEngine};
use crate::ssml::VoiceProfile;
use crate::transcript::{Message, Role, Transcript};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Active,
    Ending,
    Ended,
}

impl SessionStatus {
    /// Connecting or Active.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Active)
    }
}

/// One avatar session. A new one is created by every successful `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub status: SessionStatus,
    pub turn_mode: TurnMode,
    /// Whether the user wants the microphone on (it may still be warming up).
    pub microphone_enabled: bool,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TranscriptAppended { role: Role, text: String, at: DateTime<Utc> },
    TranscriptCleared,
    /// Interim recognition text; empty clears the subtitle.
    Subtitle(String),
    Error { kind: ErrorKind, message: String },
    StatusChanged(SessionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneToggle {
    Started,
    /// Requested; starts once the recognizer is ready.
    Deferred,
    Stopped,
}

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct OrchestratorServices {
    pub backend: Arc<dyn AvatarBackend>,
    pub relay: Arc<dyn RelayCredentialSource>,
    pub completion: Arc<dyn CompletionService>,
    pub sinks: MediaSinks,
}

enum Command {
    Start(oneshot::Sender<AvatarResult<Uuid>>),
    Stop(oneshot::Sender<()>),
    ToggleMicrophone(oneshot::Sender<AvatarResult<MicrophoneToggle>>),
    CheckMicrophone(oneshot::Sender<AvatarResult<Option<String>>>),
    SendTypedMessage(String, oneshot::Sender<AvatarResult<()>>),
    StopSpeaking(oneshot::Sender<()>),
    ResetConversation(oneshot::Sender<()>),
    Transcript(oneshot::Sender<Vec<Message>>),
    Session(oneshot::Sender<Option<Session>>),
}

/// A connected media session plus the engines the orchestrator drives directly.
struct Established {
    media: MediaSessionClient,
    synthesizer: Arc<dyn SpeechSynthesisEngine>,
    recognizer: Box<dyn SpeechTranscriptionEngine>,
}

enum Internal {
    Connected { epoch: u64, result: AvatarResult<Established> },
    CompletionDone { epoch: u64, turn: u64, result: AvatarResult<String> },
    MicrophoneGrace { epoch: u64 },
    MicrophoneRetry { epoch: u64, attempt: u32 },
}

enum Input {
    Command(Option<Command>),
    Internal(Internal),
    Recognition(RecognitionEvent),
    Transport(TransportEvent),
    Speech(SpeechEvent),
    ConfigChanged,
}

/// Resources that exist only while a session is Connecting or Active.
struct LiveSession {
    media: Option<MediaSessionClient>,
    queue: Option<SpeechOutputQueue>,
    completion: CompletionClient,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    speech_rx: Option<mpsc::UnboundedReceiver<SpeechEvent>>,
    timers: Vec<JoinHandle<()>>,
    /// Auto-start of the microphone; dropped once the user decides themselves.
    grace_timer: Option<JoinHandle<()>>,
    pending_starts: Vec<oneshot::Sender<AvatarResult<Uuid>>>,
    track_playing: bool,
}

enum LiveInput {
    Transport(TransportEvent),
    Speech(SpeechEvent),
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_live(live: &mut Option<LiveSession>) -> LiveInput {
    let Some(live) = live.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        Some(event) = live.transport_rx.recv() => LiveInput::Transport(event),
        Some(event) = recv_opt(&mut live.speech_rx) => LiveInput::Speech(event),
        else => std::future::pending().await,
    }
}

fn voice_profile(config: &AvatarConfig) -> VoiceProfile {
    VoiceProfile::new(config.speech.tts_voice.trim()).with_ending_silence(config.timing.ending_silence_ms)
}

/// Actor driving the avatar conversation. Create with [`ConversationOrchestrator::spawn`].
pub struct ConversationOrchestrator {
    config: ConfigHandle,
    config_rx: watch::Receiver<AvatarConfig>,
    services: OrchestratorServices,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    controller: TranscriptionController,
    transcript: Transcript,
    session: Option<Session>,
    live: Option<LiveSession>,
    epoch: u64,
    turn: u64,
    status_tx: watch::Sender<SessionStatus>,
    speaking_tx: watch::Sender<bool>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl ConversationOrchestrator {
    /// Start the orchestrator task and return a handle to it.
    pub fn spawn(config: ConfigHandle, services: OrchestratorServices) -> OrchestratorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (speaking_tx, speaking_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let controller = TranscriptionController::new();
        let microphone_rx = controller.listening();
        let seed = config.current().system_seed();

        let orchestrator = Self {
            config_rx: config.subscribe(),
            config,
            services,
            commands: command_rx,
            internal_tx,
            internal_rx,
            controller,
            transcript: Transcript::new(seed.as_deref()),
            session: None,
            live: None,
            epoch: 0,
            turn: 0,
            status_tx,
            speaking_tx,
            events: events.clone(),
        };
        tokio::spawn(orchestrator.run());

        OrchestratorHandle {
            commands: command_tx,
            status: status_rx,
            microphone: microphone_rx,
            speaking: speaking_rx,
            events,
        }
    }

    async fn run(mut self) {
        info!("🎭 Conversation orchestrator running");
        loop {
            let input = tokio::select! {
                cmd = self.commands.recv() => Input::Command(cmd),
                Some(msg) = self.internal_rx.recv() => Input::Internal(msg),
                event = self.controller.next_event() => Input::Recognition(event),
                live = next_live(&mut self.live) => match live {
                    LiveInput::Transport(event) => Input::Transport(event),
                    LiveInput::Speech(event) => Input::Speech(event),
                },
                Ok(()) = self.config_rx.changed() => Input::ConfigChanged,
            };

            match input {
                Input::Command(Some(cmd)) => self.on_command(cmd).await,
                Input::Command(None) => break,
                Input::Internal(msg) => self.on_internal(msg).await,
                Input::Recognition(event) => self.on_recognition(event).await,
                Input::Transport(event) => self.on_transport(event),
                Input::Speech(event) => self.on_speech(event),
                Input::ConfigChanged => self.on_config_changed(),
            }
        }

        self.stop().await;
        info!("Conversation orchestrator stopped");
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, err: &AvatarError) {
        self.emit(OrchestratorEvent::Error { kind: err.kind(), message: err.to_string() });
    }

    fn status(&self) -> SessionStatus {
        self.session.as_ref().map_or(SessionStatus::Idle, |s| s.status)
    }

    fn set_status(&mut self, status: SessionStatus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.status == status {
            return;
        }
        session.status = status;
        info!(session_id = %session.id, ?status, "session status");
        self.status_tx.send_replace(status);
        self.emit(OrchestratorEvent::StatusChanged(status));
    }

    fn timer(&self, delay: Duration, msg: Internal) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        })
    }

    fn schedule(&mut self, delay: Duration, msg: Internal) {
        if self.live.is_none() {
            return;
        }
        let timer = self.timer(delay, msg);
        if let Some(live) = self.live.as_mut() {
            live.timers.push(timer);
        }
    }

    fn cancel_grace_timer(&mut self) {
        if let Some(timer) = self.live.as_mut().and_then(|l| l.grace_timer.take()) {
            debug!("microphone auto-start cancelled");
            timer.abort();
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(reply) => self.start(reply),
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::ToggleMicrophone(reply) => {
                let _ = reply.send(self.toggle_microphone().await);
            }
            Command::CheckMicrophone(reply) => self.check_microphone(reply),
            Command::SendTypedMessage(text, reply) => {
                let _ = reply.send(self.send_typed_message(&text).await);
            }
            Command::StopSpeaking(reply) => {
                if let Some(queue) = self.live.as_ref().and_then(|l| l.queue.as_ref()) {
                    queue.cancel_all();
                }
                let _ = reply.send(());
            }
            Command::ResetConversation(reply) => {
                self.reset_conversation();
                let _ = reply.send(());
            }
            Command::Transcript(reply) => {
                let _ = reply.send(self.transcript.snapshot());
            }
            Command::Session(reply) => {
                let _ = reply.send(self.session.clone());
            }
        }
    }

    fn start(&mut self, reply: oneshot::Sender<AvatarResult<Uuid>>) {
        match self.session.as_ref() {
            Some(session) if session.status == SessionStatus::Active => {
                let _ = reply.send(Ok(session.id));
                return;
            }
            Some(session) if session.status == SessionStatus::Connecting => {
                debug!(session_id = %session.id, "already connecting");
                if let Some(live) = self.live.as_mut() {
                    live.pending_starts.push(reply);
                }
                return;
            }
            _ => {}
        }

        let config = self.config.current();
        let errors = config.validate();
        if !errors.is_empty() {
            warn!(fields = errors.len(), "refusing to start with invalid configuration");
            let _ = reply.send(Err(AvatarError::ConfigurationInvalid(errors)));
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let session = Session {
            id: Uuid::new_v4(),
            status: SessionStatus::Idle,
            turn_mode: config.turn_mode(),
            microphone_enabled: false,
        };
        info!(session_id = %session.id, "🚀 Starting avatar session");
        self.session = Some(session);

        self.transcript.reset(config.system_seed().as_deref());
        self.turn += 1;
        self.emit(OrchestratorEvent::TranscriptCleared);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        self.live = Some(LiveSession {
            media: None,
            queue: None,
            completion: CompletionClient::new(self.services.completion.clone(), config.data_source()),
            transport_rx,
            speech_rx: None,
            timers: Vec::new(),
            grace_timer: None,
            pending_starts: vec![reply],
            track_playing: false,
        });
        self.set_status(SessionStatus::Connecting);

        let descriptor = config.connection();
        let backend = self.services.backend.clone();
        let relay = self.services.relay.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result: AvatarResult<Established> = async {
                let SessionEngines { transport, synthesizer, recognizer } = backend
                    .create(&descriptor, &config)
                    .await
                    .map_err(|e| AvatarError::SessionEstablishmentFailed(e.to_string()))?;
                let connected = MediaSessionClient::connect(
                    relay.as_ref(),
                    &descriptor,
                    transport,
                    synthesizer.clone(),
                    transport_tx,
                )
                .await;
                match connected {
                    Ok(media) => Ok(Established { media, synthesizer, recognizer }),
                    Err(e) => {
                        if let Err(close_err) = recognizer.close().await {
                            warn!("recognizer close failed: {}", close_err);
                        }
                        Err(e)
                    }
                }
            }
            .await;
            let _ = tx.send(Internal::Connected { epoch, result });
        });
    }

    async fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected { epoch, result } => self.on_connected(epoch, result).await,
            Internal::CompletionDone { epoch, turn, result } => self.on_completion(epoch, turn, result),
            Internal::MicrophoneGrace { epoch } => {
                let armed = self.live.as_mut().and_then(|l| l.grace_timer.take()).is_some();
                if armed && epoch == self.epoch && self.status() == SessionStatus::Active {
                    debug!("grace period over, starting microphone");
                    let _ = self.request_microphone(1).await;
                }
            }
            Internal::MicrophoneRetry { epoch, attempt } => {
                let wanted = self.session.as_ref().is_some_and(|s| s.microphone_enabled);
                if epoch == self.epoch && self.status().is_live() && wanted {
                    debug!(attempt, "retrying microphone start");
                    let _ = self.request_microphone(attempt).await;
                }
            }
        }
    }

    async fn on_connected(&mut self, epoch: u64, result: AvatarResult<Established>) {
        if epoch != self.epoch || self.status() != SessionStatus::Connecting {
            if let Ok(Established { mut media, recognizer, .. }) = result {
                debug!("releasing media for a session that was stopped while connecting");
                media.close().await;
                if let Err(e) = recognizer.close().await {
                    warn!("recognizer close failed: {}", e);
                }
            }
            return;
        }

        let session_id = self.session.as_ref().map(|s| s.id).unwrap_or_default();
        match result {
            Ok(Established { media, synthesizer, recognizer }) => {
                self.controller.provision(recognizer);

                let voice = voice_profile(&self.config.current());
                let (speech_tx, speech_rx) = mpsc::unbounded_channel();
                let queue = SpeechOutputQueue::spawn(synthesizer, voice, speech_tx);

                if let Some(live) = self.live.as_mut() {
                    live.media = Some(media);
                    live.queue = Some(queue);
                    live.speech_rx = Some(speech_rx);
                    for reply in live.pending_starts.drain(..) {
                        let _ = reply.send(Ok(session_id));
                    }
                }
                self.activate_if_ready();
            }
            Err(e) => {
                let message = match e {
                    AvatarError::SessionEstablishmentFailed(m) => m,
                    other => other.to_string(),
                };
                self.fail_establishment(message).await;
            }
        }
    }

    async fn fail_establishment(&mut self, message: String) {
        error!("❌ Avatar session failed to start: {}", message);
        let pending = match self.live.take() {
            Some(mut live) => {
                for timer in live.timers.drain(..).chain(live.grace_timer.take()) {
                    timer.abort();
                }
                if let Some(mut media) = live.media.take() {
                    media.close().await;
                }
                live.pending_starts
            }
            None => Vec::new(),
        };
        self.emit_error(&AvatarError::SessionEstablishmentFailed(message.clone()));
        self.set_status(SessionStatus::Ended);
        for reply in pending {
            let _ = reply.send(Err(AvatarError::SessionEstablishmentFailed(message.clone())));
        }
    }

    /// Connecting → Active once media is in place and a track is playing.
    fn activate_if_ready(&mut self) {
        let ready = self
            .live
            .as_ref()
            .is_some_and(|l| l.track_playing && l.queue.is_some());
        if !ready || self.status() != SessionStatus::Connecting {
            return;
        }
        self.set_status(SessionStatus::Active);

        let config = self.config.current();
        if config.options.auto_start_microphone {
            let epoch = self.epoch;
            let timer = self.timer(config.timing.microphone_grace(), Internal::MicrophoneGrace { epoch });
            if let Some(live) = self.live.as_mut() {
                live.grace_timer = Some(timer);
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match self.services.sinks.route(&event) {
            MediaSignal::Playing(kind) => {
                let first = match self.live.as_mut() {
                    Some(live) if !live.track_playing => {
                        live.track_playing = true;
                        true
                    }
                    _ => false,
                };
                if first {
                    info!(?kind, "🎬 Avatar media playing");
                    self.activate_if_ready();
                }
            }
            MediaSignal::Disconnected(state) => {
                if self.status().is_live() {
                    warn!(%state, "avatar transport lost");
                }
            }
            MediaSignal::Nothing => {}
        }
    }

    fn on_speech(&mut self, event: SpeechEvent) {
        match event {
            SpeechEvent::SpeakingChanged(speaking) => {
                self.speaking_tx.send_replace(speaking);
            }
            SpeechEvent::RenderFailed { sequence, message } => {
                warn!(sequence, "utterance dropped: {}", message);
                self.emit_error(&AvatarError::SynthesisRenderFailed(message));
            }
            SpeechEvent::Cancelled { discarded } => debug!(discarded, "speech cancelled"),
            SpeechEvent::RenderStarted { sequence } | SpeechEvent::RenderFinished { sequence } => {
                debug!(sequence, "speech progress");
            }
        }
    }

    /// Turn mode, grounding and voice apply to the live session. Connection
    /// settings wait for the next `start`.
    fn on_config_changed(&mut self) {
        let config = self.config_rx.borrow_and_update().clone();
        let turn_mode = config.turn_mode();
        if let Some(session) = self.session.as_mut() {
            if session.turn_mode != turn_mode {
                info!(?turn_mode, "turn mode changed");
                session.turn_mode = turn_mode;
            }
        }

        let Some(live) = self.live.as_mut() else {
            return;
        };
        let data_source = config.data_source();
        if live.completion.data_source() != data_source.as_ref() {
            info!(grounded = data_source.is_some(), "completion data source changed");
            live.completion = CompletionClient::new(self.services.completion.clone(), data_source);
        }
        if let Some(queue) = live.queue.as_mut() {
            queue.set_voice(voice_profile(&config));
        }
    }

    async fn on_recognition(&mut self, event: RecognitionEvent) {
        if self.status() != SessionStatus::Active {
            debug!(?event, "ignoring recognition outside an active session");
            return;
        }
        match event {
            RecognitionEvent::Partial(text) => self.emit(OrchestratorEvent::Subtitle(text)),
            RecognitionEvent::Final(text) => {
                self.emit(OrchestratorEvent::Subtitle(String::new()));
                self.begin_turn(&text, true).await;
            }
            RecognitionEvent::NoMatch => debug!("speech not recognized"),
            RecognitionEvent::Canceled(_) | RecognitionEvent::Stopped => {
                if let Some(session) = self.session.as_mut() {
                    session.microphone_enabled = false;
                }
            }
        }
    }

    /// Run one turn: record the user text, interrupt the avatar, ask for a reply.
    async fn begin_turn(&mut self, text: &str, spoken: bool) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.transcript.push_user(text);
        self.emit(OrchestratorEvent::TranscriptAppended {
            role: Role::User,
            text: text.to_string(),
            at: Utc::now(),
        });

        if let Some(queue) = self.live.as_ref().and_then(|l| l.queue.as_ref()) {
            if queue.is_speaking() {
                info!("⚡ Barge-in: interrupting avatar");
            }
            queue.cancel_all();
        }

        let single_shot = self
            .session
            .as_ref()
            .is_some_and(|s| !s.turn_mode.keeps_listening());
        if spoken && single_shot {
            self.controller.stop().await;
            if let Some(session) = self.session.as_mut() {
                session.microphone_enabled = false;
            }
        }

        let Some(client) = self.live.as_ref().map(|l| l.completion.clone()) else {
            return;
        };
        self.turn += 1;
        let (epoch, turn) = (self.epoch, self.turn);
        let snapshot = self.transcript.snapshot();
        let tx = self.internal_tx.clone();
        debug!(turn, messages = snapshot.len(), "requesting completion");
        tokio::spawn(async move {
            let result = client.complete(snapshot).await;
            let _ = tx.send(Internal::CompletionDone { epoch, turn, result });
        });
    }

    fn on_completion(&mut self, epoch: u64, turn: u64, result: AvatarResult<String>) {
        if epoch != self.epoch || self.status() != SessionStatus::Active {
            debug!(turn, "discarding completion for an ended session");
            return;
        }
        if turn != self.turn {
            info!(turn, latest = self.turn, "discarding superseded completion");
            return;
        }

        match result {
            Ok(reply) if reply.is_empty() => {
                warn!(turn, "completion returned an empty reply");
                self.emit_error(&AvatarError::CompletionRequestFailed("empty reply".to_string()));
            }
            Ok(reply) => {
                self.transcript.push_assistant(reply.clone());
                self.emit(OrchestratorEvent::TranscriptAppended {
                    role: Role::Assistant,
                    text: reply.clone(),
                    at: Utc::now(),
                });
                if let Some(queue) = self.live.as_mut().and_then(|l| l.queue.as_mut()) {
                    queue.submit(reply);
                }
            }
            Err(e) => {
                warn!(turn, "turn abandoned: {}", e);
                self.emit_error(&e);
            }
        }
    }

    async fn request_microphone(&mut self, attempt: u32) -> AvatarResult<MicrophoneToggle> {
        if let Some(session) = self.session.as_mut() {
            session.microphone_enabled = true;
        }
        let outcome = match self.controller.try_start().await {
            Ok(StartOutcome::Started) | Ok(StartOutcome::AlreadyListening) => Ok(MicrophoneToggle::Started),
            Ok(StartOutcome::Deferred) => {
                let timing = self.config.current().timing;
                if attempt < timing.recognizer_max_attempts {
                    let epoch = self.epoch;
                    self.schedule(
                        timing.recognizer_retry(),
                        Internal::MicrophoneRetry { epoch, attempt: attempt + 1 },
                    );
                    Ok(MicrophoneToggle::Deferred)
                } else {
                    Err(AvatarError::RecognitionEngineUnavailable(format!(
                        "recognizer not ready after {} attempts",
                        attempt
                    )))
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!("microphone start failed: {}", e);
            if let Some(session) = self.session.as_mut() {
                session.microphone_enabled = false;
            }
            self.emit_error(e);
        }
        outcome
    }

    async fn toggle_microphone(&mut self) -> AvatarResult<MicrophoneToggle> {
        if !self.status().is_live() {
            return Err(AvatarError::SessionInactive);
        }
        self.cancel_grace_timer();
        let Some(session) = self.session.as_mut() else {
            return Err(AvatarError::SessionInactive);
        };
        if self.controller.is_listening() || session.microphone_enabled {
            session.microphone_enabled = false;
            self.controller.stop().await;
            return Ok(MicrophoneToggle::Stopped);
        }
        self.request_microphone(1).await
    }

    /// Runs beside the actor; the reply is sent from the spawned task.
    fn check_microphone(&mut self, reply: oneshot::Sender<AvatarResult<Option<String>>>) {
        if !self.status().is_live() {
            let _ = reply.send(Err(AvatarError::SessionInactive));
            return;
        }
        if self.controller.is_listening() {
            let _ = reply.send(Err(AvatarError::RecognitionEngineUnavailable(
                "microphone is already listening".to_string(),
            )));
            return;
        }

        let check = self.controller.recognize_once();
        let mut status = self.status_tx.subscribe();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = check => result,
                _ = async {
                    let _ = status.wait_for(|s| !s.is_live()).await;
                } => Err(AvatarError::SessionInactive),
            };
            let _ = reply.send(result);
        });
    }

    async fn send_typed_message(&mut self, text: &str) -> AvatarResult<()> {
        if self.status() != SessionStatus::Active {
            return Err(AvatarError::SessionInactive);
        }
        self.begin_turn(text, false).await;
        Ok(())
    }

    fn reset_conversation(&mut self) {
        let seed = self.config.current().system_seed();
        self.transcript.reset(seed.as_deref());
        // In-flight replies belong to the old conversation.
        self.turn += 1;
        info!("🧹 Conversation reset");
        self.emit(OrchestratorEvent::TranscriptCleared);
    }

    /// Tear down the live session. Errors are logged, never returned.
    async fn stop(&mut self) {
        if !self.status().is_live() {
            return;
        }
        self.epoch += 1;
        self.set_status(SessionStatus::Ending);

        let mut pending = Vec::new();
        if let Some(mut live) = self.live.take() {
            for timer in live.timers.drain(..).chain(live.grace_timer.take()) {
                timer.abort();
            }
            if let Some(queue) = live.queue.take() {
                queue.shutdown().await;
            }
            self.controller.release().await;
            if let Some(mut media) = live.media.take() {
                media.close().await;
            }
            pending = live.pending_starts;
        }
        if let Some(session) = self.session.as_mut() {
            session.microphone_enabled = false;
        }
        self.speaking_tx.send_replace(false);
        self.set_status(SessionStatus::Ended);
        info!("👋 Avatar session ended");

        for reply in pending {
            let _ = reply.send(Err(AvatarError::SessionEstablishmentFailed(
                "session stopped before it was established".to_string(),
            )));
        }
    }
}

/// Cloneable handle to a running [`ConversationOrchestrator`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    microphone: watch::Receiver<bool>,
    speaking: watch::Receiver<bool>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> AvatarResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| AvatarError::OrchestratorClosed)?;
        rx.await.map_err(|_| AvatarError::OrchestratorClosed)
    }

    /// Start a session, or return the current one. Resolves once media is established.
    pub async fn start(&self) -> AvatarResult<Uuid> {
        self.request(Command::Start).await?
    }

    /// End the session. Teardown problems are logged, not reported.
    pub async fn stop(&self) {
        if self.request(Command::Stop).await.is_err() {
            debug!("stop requested after orchestrator exit");
        }
    }

    pub async fn toggle_microphone(&self) -> AvatarResult<MicrophoneToggle> {
        self.request(Command::ToggleMicrophone).await?
    }

    /// Recognize one utterance outside the conversation, to check the microphone.
    pub async fn check_microphone(&self) -> AvatarResult<Option<String>> {
        self.request(Command::CheckMicrophone).await?
    }

    pub async fn send_typed_message(&self, text: impl Into<String>) -> AvatarResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendTypedMessage(text, reply)).await?
    }

    pub async fn stop_speaking(&self) -> AvatarResult<()> {
        self.request(Command::StopSpeaking).await
    }

    pub async fn reset_conversation(&self) -> AvatarResult<()> {
        self.request(Command::ResetConversation).await
    }

    pub async fn transcript(&self) -> AvatarResult<Vec<Message>> {
        self.request(Command::Transcript).await
    }

    pub async fn session(&self) -> AvatarResult<Option<Session>> {
        self.request(Command::Session).await
    }

    pub fn session_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn microphone_active(&self) -> watch::Receiver<bool> {
        self.microphone.clone()
    }

    pub fn speaking(&self) -> watch::Receiver<bool> {
        self.speaking.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }
}
