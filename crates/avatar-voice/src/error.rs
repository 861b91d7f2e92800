//! Error types for the avatar conversation system

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type alias for avatar operations
pub type AvatarResult<T> = Result<T, AvatarError>;

/// One failed configuration field, reported before a session is allowed to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Dotted path of the field (e.g. `speech_service.api_key`).
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn required(field: &'static str, label: &str) -> Self {
        Self {
            field,
            message: format!("{} is required", label),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur in the avatar orchestration system
#[derive(Error, Debug)]
pub enum AvatarError {
    #[error("Configuration validation failed: {}", join_field_errors(.0))]
    ConfigurationInvalid(Vec<FieldError>),

    #[error("Session establishment failed: {0}")]
    SessionEstablishmentFailed(String),

    #[error("Recognition engine unavailable: {0}")]
    RecognitionEngineUnavailable(String),

    #[error("Completion request failed: {0}")]
    CompletionRequestFailed(String),

    #[error("Speech render failed: {0}")]
    SynthesisRenderFailed(String),

    #[error("Microphone access is required for speech recognition: {0}")]
    MicrophonePermissionDenied(String),

    #[error("No active session")]
    SessionInactive,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Orchestrator task is no longer running")]
    OrchestratorClosed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for AvatarError {
    fn from(err: config::ConfigError) -> Self {
        AvatarError::Config(err.to_string())
    }
}

/// Coarse error category surfaced to the presentation layer alongside the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    SessionEstablishment,
    Recognition,
    Completion,
    Synthesis,
    Microphone,
    Session,
    Internal,
}

impl AvatarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AvatarError::ConfigurationInvalid(_) | AvatarError::Config(_) => ErrorKind::Configuration,
            AvatarError::SessionEstablishmentFailed(_) | AvatarError::Transport(_) => {
                ErrorKind::SessionEstablishment
            }
            AvatarError::RecognitionEngineUnavailable(_) => ErrorKind::Recognition,
            AvatarError::CompletionRequestFailed(_) => ErrorKind::Completion,
            AvatarError::SynthesisRenderFailed(_) => ErrorKind::Synthesis,
            AvatarError::MicrophonePermissionDenied(_) => ErrorKind::Microphone,
            AvatarError::SessionInactive => ErrorKind::Session,
            AvatarError::OrchestratorClosed | AvatarError::Http(_) | AvatarError::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// True for failures the recognizer reports while it is still warming up.
    pub fn is_transient(&self) -> bool {
        matches!(self, AvatarError::RecognitionEngineUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_invalid_lists_every_field() {
        let err = AvatarError::ConfigurationInvalid(vec![
            FieldError::required("speech_service.api_key", "Azure Speech API Key"),
            FieldError::required("open_ai.endpoint", "Azure OpenAI Endpoint"),
        ]);
        assert_eq!(
            err.to_string(),
            "Configuration validation failed: Azure Speech API Key is required, Azure OpenAI Endpoint is required"
        );
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn only_recognizer_warmup_is_transient() {
        assert!(AvatarError::RecognitionEngineUnavailable("warming up".into()).is_transient());
        assert!(!AvatarError::CompletionRequestFailed("503".into()).is_transient());
    }
}
