//! Shared fakes and helpers for the orchestrator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use avatar_voice::{
    AvatarBackend, AvatarConfig, AvatarError, AvatarResult, CompletionService, ConfigHandle,
    ConnectionDescriptor, ConversationOrchestrator, DataSource, LoggingSink, MediaSinks, Message,
    OrchestratorEvent, OrchestratorHandle, OrchestratorServices, PlaceholderRecognizer, PlaceholderRelay,
    PlaceholderTransport, RealtimeTransport, RecognitionEvent, RecognizerFeed, RelayCredentialSource,
    RelayCredentials, Role, SessionEngines, SessionStatus, SpeechRequest, SpeechSynthesisEngine,
    SpeechTranscriptionEngine, TransportEvent,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Complete config with the microphone starting right after the avatar appears.
pub fn test_config() -> AvatarConfig {
    let mut c = AvatarConfig::default();
    c.speech_service.api_key = "speech-key".into();
    c.open_ai.endpoint = "https://example.openai.azure.com".into();
    c.open_ai.api_key = "openai-key".into();
    c.timing.microphone_grace_ms = 0;
    c
}

/// Synthesizer that records renders. When gated, each render waits for a permit.
pub struct TestSynth {
    gated: bool,
    gate: Semaphore,
    pub started: Mutex<Vec<String>>,
    pub ssml: Mutex<Vec<String>>,
    pub finished: Mutex<Vec<String>>,
    pub cancels: AtomicUsize,
    pub fail_on: Mutex<Option<String>>,
}

impl TestSynth {
    fn build(gated: bool) -> Arc<Self> {
        Arc::new(Self {
            gated,
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            ssml: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            fail_on: Mutex::new(None),
        })
    }

    pub fn instant() -> Arc<Self> {
        Self::build(false)
    }

    pub fn gated() -> Arc<Self> {
        Self::build(true)
    }

    pub fn release(&self, renders: usize) {
        self.gate.add_permits(renders);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn ssml(&self) -> Vec<String> {
        self.ssml.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesisEngine for TestSynth {
    async fn start_stream(&self) -> AvatarResult<()> {
        Ok(())
    }

    async fn render(&self, request: &SpeechRequest) -> AvatarResult<()> {
        self.started.lock().unwrap().push(request.text.clone());
        self.ssml.lock().unwrap().push(request.ssml.clone());
        if self.fail_on.lock().unwrap().as_deref() == Some(request.text.as_str()) {
            return Err(AvatarError::SynthesisRenderFailed("voice unavailable".into()));
        }
        if self.gated {
            self.gate.acquire().await.expect("gate").forget();
        }
        self.finished.lock().unwrap().push(request.text.clone());
        Ok(())
    }

    async fn cancel_current(&self) -> AvatarResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> AvatarResult<()> {
        Ok(())
    }
}

/// Completion fake. Scripted replies are used first, then it echoes the last user message.
pub struct ScriptedCompletion {
    gated: bool,
    gate: Semaphore,
    replies: Mutex<VecDeque<Result<String, String>>>,
    pub requests: Mutex<Vec<Vec<Message>>>,
    /// Index name of the data source sent with each request.
    pub indexes: Mutex<Vec<Option<String>>>,
}

impl ScriptedCompletion {
    fn build(gated: bool) -> Arc<Self> {
        Arc::new(Self {
            gated,
            gate: Semaphore::new(0),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            indexes: Mutex::new(Vec::new()),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn gated() -> Arc<Self> {
        Self::build(true)
    }

    pub fn reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn fail(&self, message: &str) {
        self.replies.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn indexes(&self) -> Vec<Option<String>> {
        self.indexes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, messages: &[Message], source: Option<&DataSource>) -> AvatarResult<String> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.indexes.lock().unwrap().push(source.map(|s| s.index_name.clone()));
        let scripted = self.replies.lock().unwrap().pop_front();
        if self.gated {
            self.gate.acquire().await.expect("gate").forget();
        }
        match scripted {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(AvatarError::Transport(message)),
            None => {
                let last = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                Ok(format!("You said: {}", last))
            }
        }
    }
}

/// Recognizer that reports itself unavailable for the first few start attempts.
pub struct WarmingRecognizer {
    inner: PlaceholderRecognizer,
    remaining: Arc<AtomicUsize>,
    /// How long a single-utterance check listens before reporting no match.
    check_delay: Duration,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl SpeechTranscriptionEngine for WarmingRecognizer {
    fn attach_events(&mut self, events: mpsc::UnboundedSender<RecognitionEvent>) {
        self.inner.attach_events(events);
    }

    async fn start_continuous(&self) -> AvatarResult<()> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(AvatarError::RecognitionEngineUnavailable("warming up".into()));
        }
        self.inner.start_continuous().await
    }

    async fn stop_continuous(&self) -> AvatarResult<()> {
        self.inner.stop_continuous().await
    }

    async fn recognize_once(&self) -> AvatarResult<Option<String>> {
        tokio::time::sleep(self.check_delay).await;
        self.inner.recognize_once().await
    }

    async fn check_permission(&self) -> AvatarResult<()> {
        self.inner.check_permission().await
    }

    async fn close(&self) -> AvatarResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

/// Placeholder transport that counts how often it is closed.
pub struct CountingTransport {
    inner: PlaceholderTransport,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl RealtimeTransport for CountingTransport {
    async fn negotiate(
        &mut self,
        credentials: &RelayCredentials,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> AvatarResult<()> {
        self.inner.negotiate(credentials, events).await
    }

    async fn close(&mut self) -> AvatarResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

pub struct TestBackend {
    pub feed: RecognizerFeed,
    pub synth: Arc<TestSynth>,
    pub created: AtomicUsize,
    pub warmup_failures: Arc<AtomicUsize>,
    pub check_delay: Duration,
    pub recognizers_closed: Arc<AtomicUsize>,
    pub transports_closed: Arc<AtomicUsize>,
}

#[async_trait]
impl AvatarBackend for TestBackend {
    async fn create(&self, _: &ConnectionDescriptor, _: &AvatarConfig) -> AvatarResult<SessionEngines> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionEngines {
            transport: Box::new(CountingTransport {
                inner: PlaceholderTransport::default(),
                closed: self.transports_closed.clone(),
            }),
            synthesizer: self.synth.clone(),
            recognizer: Box::new(WarmingRecognizer {
                inner: PlaceholderRecognizer::new(self.feed.clone()),
                remaining: self.warmup_failures.clone(),
                check_delay: self.check_delay,
                closed: self.recognizers_closed.clone(),
            }),
        })
    }
}

pub struct RefusingRelay;

#[async_trait]
impl RelayCredentialSource for RefusingRelay {
    async fn fetch(&self, _: &ConnectionDescriptor) -> AvatarResult<RelayCredentials> {
        Err(AvatarError::SessionEstablishmentFailed("relay token error 401".into()))
    }
}

/// Relay that holds every fetch until the test opens the gate.
pub struct GatedRelay {
    gate: Semaphore,
    pub fetches: AtomicUsize,
}

impl GatedRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { gate: Semaphore::new(0), fetches: AtomicUsize::new(0) })
    }

    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl RelayCredentialSource for GatedRelay {
    async fn fetch(&self, descriptor: &ConnectionDescriptor) -> AvatarResult<RelayCredentials> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.expect("gate").forget();
        PlaceholderRelay.fetch(descriptor).await
    }
}

pub struct Harness {
    pub handle: OrchestratorHandle,
    pub config: ConfigHandle,
    pub backend: Arc<TestBackend>,
    pub synth: Arc<TestSynth>,
    pub completion: Arc<ScriptedCompletion>,
    pub feed: RecognizerFeed,
    pub events: broadcast::Receiver<OrchestratorEvent>,
}

pub struct HarnessBuilder {
    config: AvatarConfig,
    synth: Arc<TestSynth>,
    completion: Arc<ScriptedCompletion>,
    relay: Arc<dyn RelayCredentialSource>,
    warmup_failures: usize,
    check_delay: Duration,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            synth: TestSynth::instant(),
            completion: ScriptedCompletion::new(),
            relay: Arc::new(PlaceholderRelay),
            warmup_failures: 0,
            check_delay: Duration::ZERO,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut AvatarConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn synth(mut self, synth: Arc<TestSynth>) -> Self {
        self.synth = synth;
        self
    }

    pub fn completion(mut self, completion: Arc<ScriptedCompletion>) -> Self {
        self.completion = completion;
        self
    }

    pub fn relay(mut self, relay: Arc<dyn RelayCredentialSource>) -> Self {
        self.relay = relay;
        self
    }

    pub fn warmup_failures(mut self, attempts: usize) -> Self {
        self.warmup_failures = attempts;
        self
    }

    pub fn check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = delay;
        self
    }

    pub fn spawn(self) -> Harness {
        init_logging();
        let feed = RecognizerFeed::new();
        let backend = Arc::new(TestBackend {
            feed: feed.clone(),
            synth: self.synth.clone(),
            created: AtomicUsize::new(0),
            warmup_failures: Arc::new(AtomicUsize::new(self.warmup_failures)),
            check_delay: self.check_delay,
            recognizers_closed: Arc::new(AtomicUsize::new(0)),
            transports_closed: Arc::new(AtomicUsize::new(0)),
        });
        let config = ConfigHandle::new(self.config);
        let services = OrchestratorServices {
            backend: backend.clone(),
            relay: self.relay,
            completion: self.completion.clone(),
            sinks: MediaSinks::new(Arc::new(LoggingSink::new("video")), Arc::new(LoggingSink::new("audio"))),
        };
        let handle = ConversationOrchestrator::spawn(config.clone(), services);
        let events = handle.subscribe();
        Harness {
            handle,
            config,
            backend,
            synth: self.synth,
            completion: self.completion,
            feed,
            events,
        }
    }

    /// Spawn, start, and wait until the session is Active with the microphone on.
    pub async fn active(self) -> Harness {
        let auto_mic = self.config.options.auto_start_microphone;
        let h = self.spawn();
        h.handle.start().await.expect("session starts");
        wait_until(&mut h.handle.session_status(), |s| *s == SessionStatus::Active).await;
        if auto_mic {
            wait_until(&mut h.handle.microphone_active(), |on| *on).await;
        }
        h
    }
}

impl Harness {
    /// Deliver a final utterance straight to the orchestrator.
    pub fn hear(&self, text: &str) {
        assert!(self.feed.send(RecognitionEvent::Final(text.to_string())), "recognizer attached");
    }

    pub async fn transcript(&self) -> Vec<Message> {
        self.handle.transcript().await.expect("transcript")
    }

    /// Next error event, skipping everything else.
    pub async fn next_error(&mut self) -> (avatar_voice::ErrorKind, String) {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(OrchestratorEvent::Error { kind, message }) => return (kind, message),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("error event")
    }
}

pub async fn wait_until<T>(rx: &mut watch::Receiver<T>, pred: impl Fn(&T) -> bool) {
    tokio::time::timeout(WAIT, rx.wait_for(|v| pred(v)))
        .await
        .expect("condition within timeout")
        .expect("orchestrator alive");
}

/// Poll `cond` until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition within timeout");
}
