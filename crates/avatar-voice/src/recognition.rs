//! Speech recognition: the engine seam and the controller that drives it.
//!
//! A [`TranscriptionController`] is created once and provisioned with a fresh engine
//! per session. The engine is handed the controller's event sender at provisioning
//! and keeps it for its whole life; nothing re-registers handlers per turn.

use crate::error::{AvatarError, AvatarResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What the recognizer heard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Interim hypothesis for the utterance in progress.
    Partial(String),
    /// Completed utterance. Exactly one per utterance.
    Final(String),
    NoMatch,
    Canceled(String),
    Stopped,
}

/// Continuous speech-to-text engine bound to the local microphone.
#[async_trait]
pub trait SpeechTranscriptionEngine: Send + Sync {
    /// Called once, before any other method, with the sender events must go to.
    fn attach_events(&mut self, events: mpsc::UnboundedSender<RecognitionEvent>);

    /// Fails with `RecognitionEngineUnavailable` while the engine is still warming up.
    async fn start_continuous(&self) -> AvatarResult<()>;

    async fn stop_continuous(&self) -> AvatarResult<()>;

    /// Recognize a single utterance. `None` when nothing was matched.
    async fn recognize_once(&self) -> AvatarResult<Option<String>>;

    /// Fails with `MicrophonePermissionDenied` when the microphone can't be used.
    async fn check_permission(&self) -> AvatarResult<()>;

    async fn close(&self) -> AvatarResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningState {
    Stopped,
    Starting,
    Listening,
}

/// Result of asking the controller to listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyListening,
    Started,
    /// The engine isn't ready yet; the caller should retry later.
    Deferred,
}

pub struct TranscriptionController {
    engine: Option<Arc<dyn SpeechTranscriptionEngine>>,
    state: ListeningState,
    events_tx: mpsc::UnboundedSender<RecognitionEvent>,
    events_rx: mpsc::UnboundedReceiver<RecognitionEvent>,
    listening: watch::Sender<bool>,
}

impl Default for TranscriptionController {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptionController {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (listening, _) = watch::channel(false);
        Self {
            engine: None,
            state: ListeningState::Stopped,
            events_tx,
            events_rx,
            listening,
        }
    }

    /// Install the engine for a new session.
    pub fn provision(&mut self, mut engine: Box<dyn SpeechTranscriptionEngine>) {
        // Events from a previous engine must not leak into this session.
        while self.events_rx.try_recv().is_ok() {}
        engine.attach_events(self.events_tx.clone());
        self.engine = Some(Arc::from(engine));
        self.set_state(ListeningState::Stopped);
        debug!("recognizer provisioned");
    }

    pub fn is_provisioned(&self) -> bool {
        self.engine.is_some()
    }

    pub fn state(&self) -> ListeningState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state != ListeningState::Stopped
    }

    /// Observable listening signal, true only while `Listening`.
    pub fn listening(&self) -> watch::Receiver<bool> {
        self.listening.subscribe()
    }

    fn set_state(&mut self, state: ListeningState) {
        self.state = state;
        let listening = state == ListeningState::Listening;
        self.listening.send_if_modified(|current| {
            let changed = *current != listening;
            *current = listening;
            changed
        });
    }

    /// Begin continuous recognition. Idempotent while starting or listening.
    pub async fn try_start(&mut self) -> AvatarResult<StartOutcome> {
        if self.state != ListeningState::Stopped {
            return Ok(StartOutcome::AlreadyListening);
        }
        let Some(engine) = self.engine.as_ref() else {
            debug!("recognizer not provisioned yet, deferring start");
            return Ok(StartOutcome::Deferred);
        };

        engine.check_permission().await?;

        self.state = ListeningState::Starting;
        let result = engine.start_continuous().await;
        match result {
            Ok(()) => {
                self.set_state(ListeningState::Listening);
                info!("🎤 Listening");
                Ok(StartOutcome::Started)
            }
            Err(e) if e.is_transient() => {
                debug!("recognizer not ready: {}", e);
                self.set_state(ListeningState::Stopped);
                Ok(StartOutcome::Deferred)
            }
            Err(e) => {
                self.set_state(ListeningState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop recognition. Safe to call in any state.
    pub async fn stop(&mut self) {
        if self.state == ListeningState::Stopped {
            return;
        }
        if let Some(engine) = self.engine.as_ref() {
            if let Err(e) = engine.stop_continuous().await {
                warn!("recognizer stop failed: {}", e);
            }
        }
        self.set_state(ListeningState::Stopped);
        info!("🔇 Microphone stopped");
    }

    /// Stop, close and drop the engine.
    pub async fn release(&mut self) {
        self.stop().await;
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.close().await {
                warn!("recognizer close failed: {}", e);
            }
        }
        while self.events_rx.try_recv().is_ok() {}
    }

    /// Single-utterance recognition for a microphone check. The returned future owns
    /// its engine handle, so it can run outside the task that owns the controller.
    pub fn recognize_once(&self) -> impl Future<Output = AvatarResult<Option<String>>> + Send + 'static {
        let engine = self.engine.clone();
        async move {
            let engine = engine.ok_or_else(|| {
                AvatarError::RecognitionEngineUnavailable("recognizer not provisioned".to_string())
            })?;
            engine.check_permission().await?;
            engine.recognize_once().await
        }
    }

    /// Next engine event, with state transitions already applied.
    pub async fn next_event(&mut self) -> RecognitionEvent {
        // The controller holds a sender itself, so the channel never closes.
        let event = match self.events_rx.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        };
        match &event {
            RecognitionEvent::Canceled(reason) => {
                warn!("recognition canceled: {}", reason);
                self.set_state(ListeningState::Stopped);
            }
            RecognitionEvent::Stopped => self.set_state(ListeningState::Stopped),
            _ => {}
        }
        event
    }
}
