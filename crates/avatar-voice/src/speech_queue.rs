//! **SpeechOutputQueue** — serialize avatar speech on the single output channel.
//!
//! A worker task owns the pending list and renders one [`SpeechRequest`] at a time.
//! Submits and cancels travel over the same FIFO channel, so a cancel issued before a
//! submit always lands before that submit's render starts.

use crate::error::AvatarResult;
use crate::ssml::VoiceProfile;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One utterance for the avatar to speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    pub text: String,
    pub sequence: u64,
    pub ssml: String,
}

/// Avatar rendering engine: streams avatar media and speaks requests into it.
#[async_trait]
pub trait SpeechSynthesisEngine: Send + Sync {
    /// Ask the remote renderer to begin streaming into the established transport.
    async fn start_stream(&self) -> AvatarResult<()>;

    /// Speak one request. Resolves when the utterance has finished rendering.
    async fn render(&self, request: &SpeechRequest) -> AvatarResult<()>;

    /// Stop the utterance currently rendering, if any.
    async fn cancel_current(&self) -> AvatarResult<()>;

    async fn close(&self) -> AvatarResult<()>;
}

/// Progress reported by the queue worker, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    SpeakingChanged(bool),
    RenderStarted { sequence: u64 },
    RenderFinished { sequence: u64 },
    RenderFailed { sequence: u64, message: String },
    /// In-flight render stopped; `discarded` counts it plus the dropped pending entries.
    Cancelled { discarded: usize },
}

enum QueueCommand {
    Submit(SpeechRequest),
    CancelAll,
}

/// Handle to the speech worker.
pub struct SpeechOutputQueue {
    commands: mpsc::UnboundedSender<QueueCommand>,
    speaking: watch::Receiver<bool>,
    voice: VoiceProfile,
    next_sequence: u64,
    worker: JoinHandle<()>,
}

impl SpeechOutputQueue {
    /// Spawn the worker. Progress is reported on `events`.
    pub fn spawn(
        engine: Arc<dyn SpeechSynthesisEngine>,
        voice: VoiceProfile,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (speaking_tx, speaking_rx) = watch::channel(false);

        let worker = tokio::spawn(run_worker(engine, command_rx, speaking_tx, events));

        Self {
            commands: command_tx,
            speaking: speaking_rx,
            voice,
            next_sequence: 1,
            worker,
        }
    }

    /// Queue `text` for rendering. Returns its sequence number.
    pub fn submit(&mut self, text: impl Into<String>) -> u64 {
        let text = text.into();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let request = SpeechRequest {
            ssml: self.voice.ssml(&text),
            text,
            sequence,
        };
        debug!(sequence, "speech submitted");
        if self.commands.send(QueueCommand::Submit(request)).is_err() {
            warn!(sequence, "speech worker has stopped; dropping utterance");
        }
        sequence
    }

    /// Stop the current render and drop everything pending.
    pub fn cancel_all(&self) {
        let _ = self.commands.send(QueueCommand::CancelAll);
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn set_voice(&mut self, voice: VoiceProfile) {
        self.voice = voice;
    }

    /// Cancel everything and wait for the worker to exit.
    pub async fn shutdown(self) {
        self.cancel_all();
        drop(self.commands);
        if let Err(e) = self.worker.await {
            warn!("speech worker ended abnormally: {}", e);
        }
    }
}

fn set_speaking(
    speaking: &watch::Sender<bool>,
    events: &mpsc::UnboundedSender<SpeechEvent>,
    value: bool,
) {
    let changed = speaking.send_if_modified(|current| {
        let changed = *current != value;
        *current = value;
        changed
    });
    if changed {
        let _ = events.send(SpeechEvent::SpeakingChanged(value));
    }
}

async fn run_worker(
    engine: Arc<dyn SpeechSynthesisEngine>,
    mut commands: mpsc::UnboundedReceiver<QueueCommand>,
    speaking: watch::Sender<bool>,
    events: mpsc::UnboundedSender<SpeechEvent>,
) {
    let mut pending: VecDeque<SpeechRequest> = VecDeque::new();

    'outer: loop {
        let request = match pending.pop_front() {
            Some(r) => r,
            None => {
                // A submit that raced the last render's completion keeps speaking high.
                let next = match commands.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(mpsc::error::TryRecvError::Empty) => {
                        set_speaking(&speaking, &events, false);
                        commands.recv().await
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => None,
                };
                match next {
                    Some(QueueCommand::Submit(r)) => r,
                    Some(QueueCommand::CancelAll) => {
                        set_speaking(&speaking, &events, false);
                        continue;
                    }
                    None => break,
                }
            }
        };

        set_speaking(&speaking, &events, true);
        let sequence = request.sequence;
        let _ = events.send(SpeechEvent::RenderStarted { sequence });
        info!(sequence, "🗣️ Rendering utterance");

        let render = engine.render(&request);
        tokio::pin!(render);

        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(QueueCommand::Submit(r)) => pending.push_back(r),
                    Some(QueueCommand::CancelAll) => {
                        let discarded = pending.len() + 1;
                        pending.clear();
                        if let Err(e) = engine.cancel_current().await {
                            warn!(sequence, "cancel of in-flight render failed: {}", e);
                        }
                        set_speaking(&speaking, &events, false);
                        let _ = events.send(SpeechEvent::Cancelled { discarded });
                        info!(sequence, discarded, "⚡ Speech cancelled");
                        continue 'outer;
                    }
                    None => {
                        if let Err(e) = engine.cancel_current().await {
                            warn!(sequence, "cancel on shutdown failed: {}", e);
                        }
                        break 'outer;
                    }
                },
                result = &mut render => {
                    match result {
                        Ok(()) => {
                            let _ = events.send(SpeechEvent::RenderFinished { sequence });
                        }
                        Err(e) => {
                            warn!(sequence, "render failed: {}", e);
                            let _ = events.send(SpeechEvent::RenderFailed {
                                sequence,
                                message: e.to_string(),
                            });
                        }
                    }
                    break;
                }
            }
        }
    }

    set_speaking(&speaking, &events, false);
    debug!("speech worker stopped");
}
