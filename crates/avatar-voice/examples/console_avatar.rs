//! Console Avatar — the full conversation loop with placeholder media.
//!
//! Lines typed on stdin are heard as speech while the microphone is on, otherwise they
//! go in as typed messages. The avatar's replies are logged.
//!
//! Replies come from Azure OpenAI when `AVATAR__OPEN_AI__ENDPOINT` and
//! `AVATAR__OPEN_AI__API_KEY` are set (in the environment, `.env` or `config/avatar.toml`);
//! otherwise the avatar echoes what it heard.
//!
//! Commands: `/mic`, `/quiet`, `/reset`, `/history`, `/stop`, `/start`, `/quit`.

use anyhow::Context;
use avatar_voice::{
    AvatarConfig, AzureOpenAiCompletion, CompletionService, ConfigHandle, ConversationOrchestrator,
    EchoCompletion, LoggingSink, MediaSinks, OrchestratorEvent, OrchestratorServices, PlaceholderBackend,
    PlaceholderRelay,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn fill_blank(value: &mut String, placeholder: &str) {
    if value.trim().is_empty() {
        *value = placeholder.to_string();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AvatarConfig::load().context("loading avatar config")?;

    let completion: Arc<dyn CompletionService> =
        if !config.open_ai.endpoint.trim().is_empty() && !config.open_ai.api_key.trim().is_empty() {
            info!("Using Azure OpenAI deployment '{}'", config.open_ai.deployment_name);
            Arc::new(AzureOpenAiCompletion::from_config(&config.open_ai, config.timing.http_timeout())?)
        } else {
            info!("No Azure OpenAI credentials; the avatar will echo you.");
            Arc::new(EchoCompletion)
        };

    // Placeholder engines never contact the speech service.
    fill_blank(&mut config.speech_service.api_key, "placeholder");
    fill_blank(&mut config.open_ai.endpoint, "placeholder");
    fill_blank(&mut config.open_ai.api_key, "placeholder");

    let backend = PlaceholderBackend::new();
    let feed = backend.feed();
    let services = OrchestratorServices {
        backend: Arc::new(backend),
        relay: Arc::new(PlaceholderRelay),
        completion,
        sinks: MediaSinks::new(Arc::new(LoggingSink::new("video")), Arc::new(LoggingSink::new("audio"))),
    };

    let orchestrator = ConversationOrchestrator::spawn(ConfigHandle::new(config), services);

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::TranscriptAppended { role, text, .. } => info!("💬 {}: {}", role.label(), text),
                OrchestratorEvent::Error { kind, message } => warn!(?kind, "{}", message),
                OrchestratorEvent::StatusChanged(status) => info!(?status, "session"),
                OrchestratorEvent::Subtitle(_) | OrchestratorEvent::TranscriptCleared => {}
            }
        }
    });

    let session = orchestrator.start().await.context("starting avatar session")?;
    info!(%session, "Avatar session started. Type to talk, /quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/mic" => match orchestrator.toggle_microphone().await {
                Ok(state) => info!(?state, "microphone"),
                Err(e) => warn!("{}", e),
            },
            "/quiet" => orchestrator.stop_speaking().await?,
            "/reset" => orchestrator.reset_conversation().await?,
            "/history" => {
                for message in orchestrator.transcript().await? {
                    println!("{}", message.history_line());
                }
            }
            "/stop" => orchestrator.stop().await,
            "/start" => {
                if let Err(e) = orchestrator.start().await {
                    warn!("{}", e);
                }
            }
            text if feed.say(text) => {}
            text => {
                if let Err(e) = orchestrator.send_typed_message(text).await {
                    warn!("{}", e);
                }
            }
        }
    }

    orchestrator.stop().await;
    info!("Bye.");
    Ok(())
}
