//! Placeholder engines for running the conversation loop without vendor SDKs.
//!
//! Recognition is driven by a [`RecognizerFeed`]: whatever text is fed in while the
//! microphone is listening comes out as a `Final` utterance.

use crate::config::{AvatarConfig, ConnectionDescriptor, DataSource};
use crate::completion::CompletionService;
use crate::error::{AvatarError, AvatarResult};
use crate::media::{
    AvatarBackend, MediaSink, MediaTrack, RealtimeTransport, RelayCredentialSource, RelayCredentials,
    SessionEngines, TrackKind, TransportEvent,
};
use crate::recognition::{RecognitionEvent, SpeechTranscriptionEngine};
use crate::speech_queue::{SpeechRequest, SpeechSynthesisEngine};
use crate::transcript::{Message, Role};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Default)]
struct FeedState {
    events: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
    listening: AtomicBool,
}

/// Injects utterances into the placeholder recognizer of the current session.
#[derive(Clone, Default)]
pub struct RecognizerFeed {
    state: Arc<FeedState>,
}

impl RecognizerFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_listening(&self) -> bool {
        self.state.listening.load(Ordering::SeqCst)
    }

    /// Deliver a completed utterance. Returns false when the microphone is off.
    pub fn say(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if !self.is_listening() {
            debug!("microphone off, dropping {:?}", text);
            return false;
        }
        self.send(RecognitionEvent::Partial(text.clone())) && self.send(RecognitionEvent::Final(text))
    }

    pub fn send(&self, event: RecognitionEvent) -> bool {
        match self.state.events.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|tx| tx.send(event).is_ok()),
            Err(_) => false,
        }
    }
}

/// Recognizer that only hears what its [`RecognizerFeed`] says.
pub struct PlaceholderRecognizer {
    feed: RecognizerFeed,
}

impl PlaceholderRecognizer {
    pub fn new(feed: RecognizerFeed) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl SpeechTranscriptionEngine for PlaceholderRecognizer {
    fn attach_events(&mut self, events: mpsc::UnboundedSender<RecognitionEvent>) {
        if let Ok(mut guard) = self.feed.state.events.lock() {
            *guard = Some(events);
        }
    }

    async fn start_continuous(&self) -> AvatarResult<()> {
        self.feed.state.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_continuous(&self) -> AvatarResult<()> {
        self.feed.state.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn recognize_once(&self) -> AvatarResult<Option<String>> {
        Ok(None)
    }

    async fn check_permission(&self) -> AvatarResult<()> {
        Ok(())
    }

    async fn close(&self) -> AvatarResult<()> {
        self.feed.state.listening.store(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.feed.state.events.lock() {
            guard.take();
        }
        Ok(())
    }
}

/// Logs each utterance and takes roughly as long as speaking it would.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    pub per_word: Duration,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self { per_word: Duration::from_millis(60) }
    }
}

#[async_trait]
impl SpeechSynthesisEngine for PlaceholderSynthesizer {
    async fn start_stream(&self) -> AvatarResult<()> {
        info!("🎬 Placeholder avatar stream started");
        Ok(())
    }

    async fn render(&self, request: &SpeechRequest) -> AvatarResult<()> {
        info!(sequence = request.sequence, "🗣️ Avatar: {}", request.text);
        let words = request.text.split_whitespace().count() as u32;
        tokio::time::sleep(self.per_word * words.max(1)).await;
        Ok(())
    }

    async fn cancel_current(&self) -> AvatarResult<()> {
        info!("⏹️ Avatar stopped speaking");
        Ok(())
    }

    async fn close(&self) -> AvatarResult<()> {
        Ok(())
    }
}

/// Transport that immediately "receives" a video and an audio track and plays them.
#[derive(Debug, Default)]
pub struct PlaceholderTransport {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

#[async_trait]
impl RealtimeTransport for PlaceholderTransport {
    async fn negotiate(
        &mut self,
        credentials: &RelayCredentials,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> AvatarResult<()> {
        debug!(relay = ?credentials.urls.first(), "placeholder negotiation");
        let sent = [
            TransportEvent::ConnectionStateChanged("connected".to_string()),
            TransportEvent::TrackReceived(MediaTrack { kind: TrackKind::Video, id: "video-0".to_string() }),
            TransportEvent::TrackReceived(MediaTrack { kind: TrackKind::Audio, id: "audio-0".to_string() }),
            TransportEvent::TrackPlaying(TrackKind::Video),
        ]
        .into_iter()
        .all(|event| events.send(event).is_ok());
        if !sent {
            return Err(AvatarError::Transport("event channel closed".to_string()));
        }
        self.events = Some(events);
        Ok(())
    }

    async fn close(&mut self) -> AvatarResult<()> {
        if let Some(events) = self.events.take() {
            let _ = events.send(TransportEvent::Closed);
        }
        Ok(())
    }
}

/// Relay source that hands out fixed credentials.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderRelay;

#[async_trait]
impl RelayCredentialSource for PlaceholderRelay {
    async fn fetch(&self, _descriptor: &ConnectionDescriptor) -> AvatarResult<RelayCredentials> {
        Ok(RelayCredentials {
            urls: vec!["turn:relay.invalid:3478".to_string()],
            username: "placeholder".to_string(),
            password: "placeholder".to_string(),
        })
    }
}

/// Sink that logs attached tracks.
#[derive(Debug, Clone)]
pub struct LoggingSink {
    label: &'static str,
}

impl LoggingSink {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

impl MediaSink for LoggingSink {
    fn attach(&self, track: &MediaTrack) {
        info!(sink = self.label, id = %track.id, "track attached");
    }
}

/// Replies by repeating the latest user message.
#[derive(Debug, Default, Clone)]
pub struct EchoCompletion;

#[async_trait]
impl CompletionService for EchoCompletion {
    async fn complete(&self, messages: &[Message], _: Option<&DataSource>) -> AvatarResult<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .ok_or_else(|| AvatarError::CompletionRequestFailed("no user message".to_string()))?;
        Ok(format!("You said: {}", last.content))
    }
}

/// Backend made of placeholder engines. Every session's recognizer listens to the same feed.
#[derive(Clone, Default)]
pub struct PlaceholderBackend {
    feed: RecognizerFeed,
    synthesizer: PlaceholderSynthesizer,
}

impl PlaceholderBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_synthesizer(mut self, synthesizer: PlaceholderSynthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn feed(&self) -> RecognizerFeed {
        self.feed.clone()
    }
}

#[async_trait]
impl AvatarBackend for PlaceholderBackend {
    async fn create(
        &self,
        descriptor: &ConnectionDescriptor,
        config: &AvatarConfig,
    ) -> AvatarResult<SessionEngines> {
        info!(
            character = %config.avatar.character,
            style = %config.avatar.style,
            private = matches!(descriptor, ConnectionDescriptor::PrivateEndpoint { .. }),
            "creating placeholder engines"
        );
        Ok(SessionEngines {
            transport: Box::new(PlaceholderTransport::default()),
            synthesizer: Arc::new(self.synthesizer.clone()),
            recognizer: Box::new(PlaceholderRecognizer::new(self.feed.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feed_only_speaks_while_listening() {
        let feed = RecognizerFeed::new();
        let mut recognizer = PlaceholderRecognizer::new(feed.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        recognizer.attach_events(tx);

        assert!(!feed.say("ignored"));
        recognizer.start_continuous().await.unwrap();
        assert!(feed.say("hello"));
        assert_eq!(rx.recv().await, Some(RecognitionEvent::Partial("hello".into())));
        assert_eq!(rx.recv().await, Some(RecognitionEvent::Final("hello".into())));

        recognizer.close().await.unwrap();
        assert!(!feed.say("gone"));
    }

    #[tokio::test]
    async fn echo_repeats_last_user_message() {
        let reply = EchoCompletion
            .complete(&[Message::system("s"), Message::user("one"), Message::user("two")], None)
            .await
            .unwrap();
        assert_eq!(reply, "You said: two");
        assert!(EchoCompletion.complete(&[], None).await.is_err());
    }

    #[tokio::test]
    async fn transport_reports_tracks_then_playing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = PlaceholderTransport::default();
        let creds = PlaceholderRelay.fetch(&AvatarConfig::default().connection()).await.unwrap();
        transport.negotiate(&creds, tx).await.unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[3], TransportEvent::TrackPlaying(TrackKind::Video));
    }
}
