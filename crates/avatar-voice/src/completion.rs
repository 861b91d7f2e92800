//! **Completion** — send the transcript to a chat completion deployment and get one reply.
//!
//! Implement [`CompletionService`] for any backend. [`AzureOpenAiCompletion`] speaks the
//! Azure OpenAI chat completions protocol, including the optional search data source.

use crate::config::{DataSource, OpenAiConfig};
use crate::error::{AvatarError, AvatarResult};
use crate::transcript::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const API_VERSION: &str = "2024-02-15-preview";

/// Backend that turns a conversation into a single assistant reply.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        data_source: Option<&DataSource>,
    ) -> AvatarResult<String>;
}

/// Per-session completion client: a service plus the session's data source.
#[derive(Clone)]
pub struct CompletionClient {
    service: Arc<dyn CompletionService>,
    data_source: Option<DataSource>,
}

impl CompletionClient {
    pub fn new(service: Arc<dyn CompletionService>, data_source: Option<DataSource>) -> Self {
        Self { service, data_source }
    }

    pub fn data_source(&self) -> Option<&DataSource> {
        self.data_source.as_ref()
    }

    /// Complete against a transcript snapshot. Every failure is reported as
    /// `CompletionRequestFailed` so the turn can be abandoned uniformly.
    pub async fn complete(&self, transcript: Vec<Message>) -> AvatarResult<String> {
        debug!(messages = transcript.len(), grounded = self.data_source.is_some(), "completion request");
        match self.service.complete(&transcript, self.data_source.as_ref()).await {
            Ok(reply) => Ok(reply.trim().to_string()),
            Err(AvatarError::CompletionRequestFailed(msg)) => Err(AvatarError::CompletionRequestFailed(msg)),
            Err(e) => Err(AvatarError::CompletionRequestFailed(e.to_string())),
        }
    }
}

// Azure OpenAI request/response
#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_sources: Option<Vec<SearchDataSource<'a>>>,
}

#[derive(Serialize)]
struct SearchDataSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    parameters: SearchParameters<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchParameters<'a> {
    endpoint: &'a str,
    key: &'a str,
    index_name: &'a str,
    semantic_configuration: &'static str,
    query_type: &'static str,
    fields_mapping: FieldsMapping,
    in_scope: bool,
    role_information: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FieldsMapping {
    content_fields_separator: &'static str,
    content_fields: [&'static str; 1],
    filepath_field: Option<&'static str>,
    title_field: &'static str,
    url_field: Option<&'static str>,
}

impl<'a> SearchDataSource<'a> {
    fn from_source(source: &'a DataSource) -> Self {
        Self {
            kind: "AzureCognitiveSearch",
            parameters: SearchParameters {
                endpoint: &source.endpoint,
                key: &source.key,
                index_name: &source.index_name,
                semantic_configuration: "",
                query_type: "simple",
                fields_mapping: FieldsMapping {
                    content_fields_separator: "\n",
                    content_fields: ["content"],
                    filepath_field: None,
                    title_field: "title",
                    url_field: None,
                },
                in_scope: true,
                role_information: &source.role_information,
            },
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Azure OpenAI chat completions deployment.
#[derive(Debug, Clone)]
pub struct AzureOpenAiCompletion {
    endpoint: String,
    api_key: String,
    deployment: String,
    client: reqwest::Client,
}

impl AzureOpenAiCompletion {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        deployment: impl Into<String>,
        timeout: Duration,
    ) -> AvatarResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into().trim().to_string(),
            deployment: deployment.into().trim().to_string(),
            client,
        })
    }

    pub fn from_config(config: &OpenAiConfig, timeout: Duration) -> AvatarResult<Self> {
        Self::new(&config.endpoint, &config.api_key, &config.deployment_name, timeout)
    }

    fn url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, API_VERSION
        )
    }
}

#[async_trait]
impl CompletionService for AzureOpenAiCompletion {
    async fn complete(
        &self,
        messages: &[Message],
        data_source: Option<&DataSource>,
    ) -> AvatarResult<String> {
        let body = ChatRequest {
            messages,
            max_tokens: 1000,
            temperature: 0.7,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stream: false,
            data_sources: data_source.map(|s| vec![SearchDataSource::from_source(s)]),
        };

        let res = self
            .client
            .post(self.url())
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AvatarError::CompletionRequestFailed(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AvatarError::CompletionRequestFailed(format!(
                "Azure OpenAI error {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| AvatarError::CompletionRequestFailed(format!("response parse failed: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AvatarError::CompletionRequestFailed("response had no choices".to_string()))
    }
}
