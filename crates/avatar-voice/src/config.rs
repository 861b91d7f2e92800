//! Avatar configuration loaded from TOML and environment.
//!
//! Precedence: env `AVATAR_CONFIG` path > `config/avatar.toml` > struct defaults, with
//! `AVATAR__SECTION__FIELD` environment variables layered on top
//! (e.g. `AVATAR__SPEECH_SERVICE__API_KEY`).
//!
//! A [`ConfigHandle`] wraps the active configuration in a `watch` channel so the
//! orchestrator sees live edits from the presentation layer.

use crate::error::{AvatarResult, FieldError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_CONFIG_PATH: &str = "config/avatar.toml";
const ENV_PREFIX: &str = "AVATAR";

/// Speech / avatar service account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechServiceConfig {
    pub region: String,
    pub api_key: String,
    /// Custom domain endpoint, used only when `options.enable_private_endpoint` is set.
    pub private_endpoint: String,
}

impl Default for SpeechServiceConfig {
    fn default() -> Self {
        Self {
            region: "westus2".to_string(),
            api_key: String::new(),
            private_endpoint: String::new(),
        }
    }
}

/// Chat completion deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment_name: String,
    pub system_prompt: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            deployment_name: "gpt-4o".to_string(),
            system_prompt: "You are an AI assistant that helps people find information.".to_string(),
        }
    }
}

/// Search index used for retrieval augmentation ("on your data").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CognitiveSearchConfig {
    pub endpoint: String,
    pub api_key: String,
    pub index_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Comma-separated candidate locales for recognition.
    pub stt_locales: String,
    pub recognition_language: String,
    pub tts_voice: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            stt_locales: "en-US,de-DE,es-ES,fr-FR,it-IT,ja-JP,ko-KR,zh-CN".to_string(),
            recognition_language: "en-US".to_string(),
            tts_voice: "en-US-AvaMultilingualNeural".to_string(),
        }
    }
}

impl SpeechConfig {
    pub fn stt_locale_list(&self) -> Vec<String> {
        self.stt_locales
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarCharacterConfig {
    pub character: String,
    pub style: String,
}

impl Default for AvatarCharacterConfig {
    fn default() -> Self {
        Self {
            character: "meg".to_string(),
            style: "formal".to_string(),
        }
    }
}

/// Feature toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    pub enable_private_endpoint: bool,
    /// Attach the cognitive search index to every completion request.
    pub enable_oyd: bool,
    /// Keep the microphone listening across turns.
    pub continuous_conversation: bool,
    /// Turn the microphone on once the avatar is visibly ready.
    pub auto_start_microphone: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            enable_private_endpoint: false,
            enable_oyd: false,
            continuous_conversation: true,
            auto_start_microphone: true,
        }
    }
}

/// Delays and limits for the orchestrator's scheduled work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after the first media track plays before auto-starting the microphone.
    pub microphone_grace_ms: u64,
    /// Fixed backoff between deferred recognizer start attempts.
    pub recognizer_retry_ms: u64,
    pub recognizer_max_attempts: u32,
    pub http_timeout_secs: u64,
    /// Silence appended after each rendered utterance (0 = none).
    pub ending_silence_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            microphone_grace_ms: 5000,
            recognizer_retry_ms: 1000,
            recognizer_max_attempts: 10,
            http_timeout_secs: 60,
            ending_silence_ms: 0,
        }
    }
}

impl TimingConfig {
    pub fn microphone_grace(&self) -> Duration {
        Duration::from_millis(self.microphone_grace_ms)
    }

    pub fn recognizer_retry(&self) -> Duration {
        Duration::from_millis(self.recognizer_retry_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

/// Full avatar configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub speech_service: SpeechServiceConfig,
    pub open_ai: OpenAiConfig,
    pub cognitive_search: CognitiveSearchConfig,
    pub speech: SpeechConfig,
    pub avatar: AvatarCharacterConfig,
    pub options: OptionsConfig,
    pub timing: TimingConfig,
}

/// How the speech services are addressed, resolved once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Subscription { region: String, key: String },
    PrivateEndpoint { url: String, key: String },
}

impl ConnectionDescriptor {
    pub fn key(&self) -> &str {
        match self {
            ConnectionDescriptor::Subscription { key, .. } => key,
            ConnectionDescriptor::PrivateEndpoint { key, .. } => key,
        }
    }

    /// Avatar relay (TURN) token endpoint for this connection.
    pub fn relay_token_url(&self) -> String {
        match self {
            ConnectionDescriptor::Subscription { region, .. } => format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/avatar/relay/token/v1",
                region
            ),
            ConnectionDescriptor::PrivateEndpoint { url, .. } => format!(
                "{}/tts/cognitiveservices/avatar/relay/token/v1",
                url.trim_end_matches('/')
            ),
        }
    }
}

/// Retrieval augmentation source attached to completion requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    pub endpoint: String,
    pub key: String,
    pub index_name: String,
    /// The system prompt travels with the index instead of as a System message.
    pub role_information: String,
}

/// Whether the microphone stays on after a recognized utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    Continuous,
    SingleShot,
}

impl TurnMode {
    pub fn keeps_listening(self) -> bool {
        matches!(self, TurnMode::Continuous)
    }
}

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

impl AvatarConfig {
    /// Load config from file and environment.
    pub fn load() -> AvatarResult<Self> {
        let path = std::env::var("AVATAR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(Path::new(&path))
    }

    /// Load from a specific TOML file (skipped if missing), then environment overrides.
    pub fn load_from_path(path: &Path) -> AvatarResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }

    /// Field-level problems that must be fixed before a session may start.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if blank(&self.speech_service.api_key) {
            errors.push(FieldError::required("speech_service.api_key", "Azure Speech API Key"));
        }
        if self.options.enable_private_endpoint {
            if blank(&self.speech_service.private_endpoint) {
                errors.push(FieldError::required(
                    "speech_service.private_endpoint",
                    "Private Endpoint",
                ));
            }
        } else if blank(&self.speech_service.region) {
            errors.push(FieldError::required("speech_service.region", "Azure Speech Region"));
        }

        if blank(&self.open_ai.endpoint) {
            errors.push(FieldError::required("open_ai.endpoint", "Azure OpenAI Endpoint"));
        }
        if blank(&self.open_ai.api_key) {
            errors.push(FieldError::required("open_ai.api_key", "Azure OpenAI API Key"));
        }
        if blank(&self.open_ai.deployment_name) {
            errors.push(FieldError::required(
                "open_ai.deployment_name",
                "Azure OpenAI Deployment Name",
            ));
        }

        if self.options.enable_oyd {
            if blank(&self.cognitive_search.endpoint) {
                errors.push(FieldError::required(
                    "cognitive_search.endpoint",
                    "Azure Cognitive Search Endpoint",
                ));
            }
            if blank(&self.cognitive_search.api_key) {
                errors.push(FieldError::required(
                    "cognitive_search.api_key",
                    "Azure Cognitive Search API Key",
                ));
            }
            if blank(&self.cognitive_search.index_name) {
                errors.push(FieldError::required(
                    "cognitive_search.index_name",
                    "Azure Cognitive Search Index Name",
                ));
            }
        }

        if blank(&self.speech.tts_voice) {
            errors.push(FieldError::required("speech.tts_voice", "TTS Voice"));
        }
        if blank(&self.avatar.character) {
            errors.push(FieldError::required("avatar.character", "Avatar Character"));
        }
        if blank(&self.avatar.style) {
            errors.push(FieldError::required("avatar.style", "Avatar Style"));
        }

        errors
    }

    pub fn connection(&self) -> ConnectionDescriptor {
        let key = self.speech_service.api_key.trim().to_string();
        let endpoint = self.speech_service.private_endpoint.trim();
        if self.options.enable_private_endpoint && !endpoint.is_empty() {
            ConnectionDescriptor::PrivateEndpoint {
                url: endpoint.trim_end_matches('/').to_string(),
                key,
            }
        } else {
            ConnectionDescriptor::Subscription {
                region: self.speech_service.region.trim().to_string(),
                key,
            }
        }
    }

    /// The search index, when retrieval augmentation is on and fully configured.
    pub fn data_source(&self) -> Option<DataSource> {
        if !self.options.enable_oyd {
            return None;
        }
        let search = &self.cognitive_search;
        if blank(&search.endpoint) || blank(&search.api_key) || blank(&search.index_name) {
            return None;
        }
        Some(DataSource {
            endpoint: search.endpoint.trim().to_string(),
            key: search.api_key.trim().to_string(),
            index_name: search.index_name.trim().to_string(),
            role_information: self.open_ai.system_prompt.clone(),
        })
    }

    /// System message that opens every transcript. With a data source attached the
    /// prompt is carried as role information instead.
    pub fn system_seed(&self) -> Option<String> {
        if self.data_source().is_some() || blank(&self.open_ai.system_prompt) {
            return None;
        }
        Some(self.open_ai.system_prompt.clone())
    }

    pub fn turn_mode(&self) -> TurnMode {
        if self.options.continuous_conversation {
            TurnMode::Continuous
        } else {
            TurnMode::SingleShot
        }
    }
}

/// Shared, observable configuration. Clones see the same value.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<AvatarConfig>>,
}

impl ConfigHandle {
    pub fn new(config: AvatarConfig) -> Self {
        let (tx, _rx) = watch::channel(config);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> AvatarConfig {
        self.tx.borrow().clone()
    }

    /// Replace the configuration and notify subscribers.
    pub fn update(&self, config: AvatarConfig) {
        self.tx.send_replace(config);
    }

    pub fn modify(&self, f: impl FnOnce(&mut AvatarConfig)) {
        self.tx.send_modify(f);
    }

    pub fn subscribe(&self) -> watch::Receiver<AvatarConfig> {
        self.tx.subscribe()
    }
}
