//! **Media session** — relay credentials, realtime transport and avatar stream startup.
//!
//! [`MediaSessionClient::connect`] runs the whole establishment sequence:
//! fetch relay credentials, negotiate the transport, then ask the renderer to start
//! streaming. Inbound tracks are routed to caller-supplied [`MediaSink`]s by
//! [`MediaSinks::route`] as transport events arrive.

use crate::config::{AvatarConfig, ConnectionDescriptor};
use crate::error::{AvatarError, AvatarResult};
use crate::recognition::SpeechTranscriptionEngine;
use crate::speech_queue::SpeechSynthesisEngine;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// TURN relay credentials for the avatar transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait RelayCredentialSource: Send + Sync {
    async fn fetch(&self, descriptor: &ConnectionDescriptor) -> AvatarResult<RelayCredentials>;
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelayTokenResponse {
    urls: Vec<String>,
    username: String,
    password: String,
}

/// Fetches relay credentials from the avatar relay token endpoint.
#[derive(Debug, Clone)]
pub struct RelayTokenClient {
    client: reqwest::Client,
    url_override: Option<String>,
}

impl RelayTokenClient {
    pub fn new(timeout: Duration) -> AvatarResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url_override: None })
    }

    /// Use `url` instead of the descriptor's token endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url_override = Some(url.into());
        self
    }
}

#[async_trait]
impl RelayCredentialSource for RelayTokenClient {
    async fn fetch(&self, descriptor: &ConnectionDescriptor) -> AvatarResult<RelayCredentials> {
        let url = self
            .url_override
            .clone()
            .unwrap_or_else(|| descriptor.relay_token_url());
        debug!(%url, "fetching relay token");

        let res = self
            .client
            .get(&url)
            .header("Ocp-Apim-Subscription-Key", descriptor.key())
            .send()
            .await
            .map_err(|e| AvatarError::SessionEstablishmentFailed(format!("relay token request failed: {}", e)))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AvatarError::SessionEstablishmentFailed(format!(
                "relay token error {}: {}",
                status, body
            )));
        }

        let token: RelayTokenResponse = res.json().await.map_err(|e| {
            AvatarError::SessionEstablishmentFailed(format!("relay token parse failed: {}", e))
        })?;
        // Only the first relay URL is used.
        let urls: Vec<String> = token.urls.into_iter().take(1).collect();
        if urls.is_empty() {
            return Err(AvatarError::SessionEstablishmentFailed(
                "relay token response had no URLs".to_string(),
            ));
        }
        Ok(RelayCredentials {
            urls,
            username: token.username,
            password: token.password,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub kind: TrackKind,
    pub id: String,
}

/// Events raised by the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    TrackReceived(MediaTrack),
    /// An inbound track started playing at its sink.
    TrackPlaying(TrackKind),
    DataChannelMessage(String),
    ConnectionStateChanged(String),
    Closed,
}

/// Peer connection carrying the avatar's audio and video.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Negotiate with the relay. Every event for this transport goes to `events`.
    async fn negotiate(
        &mut self,
        credentials: &RelayCredentials,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> AvatarResult<()>;

    async fn close(&mut self) -> AvatarResult<()>;
}

/// Destination for one inbound media track.
pub trait MediaSink: Send + Sync {
    fn attach(&self, track: &MediaTrack);
}

/// What the orchestrator needs to know about a transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSignal {
    Nothing,
    Playing(TrackKind),
    Disconnected(String),
}

/// Video and audio sinks the inbound tracks are attached to.
#[derive(Clone)]
pub struct MediaSinks {
    pub video: Arc<dyn MediaSink>,
    pub audio: Arc<dyn MediaSink>,
}

impl MediaSinks {
    pub fn new(video: Arc<dyn MediaSink>, audio: Arc<dyn MediaSink>) -> Self {
        Self { video, audio }
    }

    /// Attach tracks, log data channel traffic and condense the rest.
    pub fn route(&self, event: &TransportEvent) -> MediaSignal {
        match event {
            TransportEvent::TrackReceived(track) => {
                info!(kind = ?track.kind, id = %track.id, "📺 Track received");
                match track.kind {
                    TrackKind::Video => self.video.attach(track),
                    TrackKind::Audio => self.audio.attach(track),
                }
                MediaSignal::Nothing
            }
            TransportEvent::TrackPlaying(kind) => MediaSignal::Playing(*kind),
            TransportEvent::DataChannelMessage(payload) => {
                match serde_json::from_str::<serde_json::Value>(payload) {
                    Ok(value) => info!(payload = %value, "avatar event"),
                    Err(e) => warn!("unparsable data channel message ({}): {}", e, payload),
                }
                MediaSignal::Nothing
            }
            TransportEvent::ConnectionStateChanged(state) => {
                info!(%state, "transport connection state");
                match state.as_str() {
                    "disconnected" | "failed" | "closed" => MediaSignal::Disconnected(state.clone()),
                    _ => MediaSignal::Nothing,
                }
            }
            TransportEvent::Closed => MediaSignal::Disconnected("closed".to_string()),
        }
    }
}

/// Engines created for one session.
pub struct SessionEngines {
    pub transport: Box<dyn RealtimeTransport>,
    pub synthesizer: Arc<dyn SpeechSynthesisEngine>,
    pub recognizer: Box<dyn SpeechTranscriptionEngine>,
}

/// Creates the vendor engines for each session.
#[async_trait]
pub trait AvatarBackend: Send + Sync {
    async fn create(
        &self,
        descriptor: &ConnectionDescriptor,
        config: &AvatarConfig,
    ) -> AvatarResult<SessionEngines>;
}

/// Established media session: transport plus rendering engine.
pub struct MediaSessionClient {
    transport: Option<Box<dyn RealtimeTransport>>,
    synthesizer: Option<Arc<dyn SpeechSynthesisEngine>>,
}

impl MediaSessionClient {
    /// Establish the session. On failure everything created so far is closed.
    pub async fn connect(
        relay: &dyn RelayCredentialSource,
        descriptor: &ConnectionDescriptor,
        transport: Box<dyn RealtimeTransport>,
        synthesizer: Arc<dyn SpeechSynthesisEngine>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> AvatarResult<Self> {
        let mut client = Self {
            transport: Some(transport),
            synthesizer: Some(synthesizer),
        };
        match client.establish(relay, descriptor, events).await {
            Ok(()) => {
                info!("✅ Avatar media session established");
                Ok(client)
            }
            Err(e) => {
                client.close().await;
                Err(match e {
                    AvatarError::SessionEstablishmentFailed(msg) => AvatarError::SessionEstablishmentFailed(msg),
                    other => AvatarError::SessionEstablishmentFailed(other.to_string()),
                })
            }
        }
    }

    async fn establish(
        &mut self,
        relay: &dyn RelayCredentialSource,
        descriptor: &ConnectionDescriptor,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> AvatarResult<()> {
        let credentials = relay.fetch(descriptor).await?;
        debug!(relays = credentials.urls.len(), "relay credentials fetched");

        if let Some(transport) = self.transport.as_mut() {
            transport.negotiate(&credentials, events).await?;
        }
        if let Some(synthesizer) = self.synthesizer.as_ref() {
            synthesizer.start_stream().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none() && self.synthesizer.is_none()
    }

    /// Release the transport, then the rendering engine. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("transport close failed: {}", e);
            }
        }
        if let Some(synthesizer) = self.synthesizer.take() {
            if let Err(e) = synthesizer.close().await {
                warn!("synthesizer close failed: {}", e);
            }
        }
    }
}
