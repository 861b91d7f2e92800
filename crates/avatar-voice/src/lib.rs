//! # Avatar Voice - Conversation Orchestration for a Talking Avatar
//!
//! Drives a spoken conversation with a cloud-rendered avatar: microphone speech is
//! recognized, sent to a chat completion deployment, and the reply is spoken back by
//! the avatar over a realtime media session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  Conversation Orchestrator (actor)                │
//! │  ┌────────────────┐   Final    ┌────────────┐   reply            │
//! │  │ Transcription  │──────────→ │ Completion │──────────┐         │
//! │  │  Controller    │            │   Client   │          ↓         │
//! │  └────────────────┘            └────────────┘  ┌──────────────┐  │
//! │          ↑  barge-in cancels speech            │ Speech Output│  │
//! │          └─────────────────────────────────────│    Queue     │  │
//! │                                                └──────────────┘  │
//! │  ┌────────────────────────────────────────────────────┐  ↓      │
//! │  │ Media Session (relay token → transport → stream)   │←─┘      │
//! │  └────────────────────────────────────────────────────┘         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Vendor engines plug in through [`AvatarBackend`], [`CompletionService`] and
//! [`RelayCredentialSource`]. The [`placeholder`] module has stand-ins for all of them.

pub mod completion;
pub mod config;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod placeholder;
pub mod recognition;
pub mod speech_queue;
pub mod ssml;
pub mod transcript;

pub use completion::{AzureOpenAiCompletion, CompletionClient, CompletionService};
pub use crate::config::{AvatarConfig, ConfigHandle, ConnectionDescriptor, DataSource, TurnMode};
pub use error::{AvatarError, AvatarResult, ErrorKind, FieldError};
pub use media::{
    AvatarBackend, MediaSessionClient, MediaSink, MediaSinks, MediaTrack, RealtimeTransport,
    RelayCredentialSource, RelayCredentials, RelayTokenClient, SessionEngines, TrackKind, TransportEvent,
};
pub use orchestrator::{
    ConversationOrchestrator, MicrophoneToggle, OrchestratorEvent, OrchestratorHandle, OrchestratorServices,
    Session, SessionStatus,
};
pub use placeholder::{
    EchoCompletion, LoggingSink, PlaceholderBackend, PlaceholderRecognizer, PlaceholderRelay,
    PlaceholderSynthesizer, PlaceholderTransport, RecognizerFeed,
};
pub use recognition::{RecognitionEvent, SpeechTranscriptionEngine, TranscriptionController};
pub use speech_queue::{SpeechEvent, SpeechOutputQueue, SpeechRequest, SpeechSynthesisEngine};
pub use ssml::VoiceProfile;
pub use transcript::{Message, Role, Transcript};
