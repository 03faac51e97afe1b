//! Playback engine: drives a [`PlaybackSession`] against the server.
//!
//! Single-threaded and cooperative. The only suspension points are the
//! transport round trips; every answer is fed back into the session before
//! the next event is looked at.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use lectern_core::{BlockIndex, ChannelMessage, ErrorKind, ModelCatalog, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PlayerConfig;
use crate::error::PlayerResult;
use crate::realtime::RealtimeEvent;
use crate::session::{Command, PlaybackOutcome, PlaybackSession, SessionConfig};
use crate::transport::SynthesisTransport;

/// User-side input to a running engine.
#[derive(Debug)]
pub enum Control {
    Seek(BlockIndex),
    /// Playback finished the block under the cursor.
    Advance,
    Retry(BlockIndex),
    SwitchVoice(Option<String>),
    Await {
        block_idx: BlockIndex,
        reply: oneshot::Sender<PlaybackOutcome>,
    },
    Stop,
}

pub struct PlaybackEngine<T> {
    session: PlaybackSession,
    transport: T,
    catalog: ModelCatalog,
}

impl<T: SynthesisTransport> PlaybackEngine<T> {
    pub fn new(transport: T, catalog: ModelCatalog, session: PlaybackSession) -> Self {
        Self {
            session,
            transport,
            catalog,
        }
    }

    /// Fetch the catalog, register the document's blocks and open a session.
    pub async fn open(transport: T, config: &PlayerConfig, blocks: &[String]) -> PlayerResult<Self> {
        let catalog = transport.catalog().await?;
        let document = transport.register_document(blocks).await?;
        let session = PlaybackSession::open(
            &catalog,
            document.document_id,
            document.block_count,
            config.user_id,
            &config.model_slug,
            config.voice_slug.as_deref(),
            SessionConfig::from(&config.buffer),
        )?;
        info!(
            document_id = %document.document_id,
            block_count = document.block_count,
            model_slug = %session.model_slug(),
            voice_slug = %session.voice_slug(),
            "Playback session opened"
        );
        Ok(Self::new(transport, catalog, session))
    }

    /// Open a session on an already registered document.
    #[allow(clippy::too_many_arguments)]
    pub fn attach(
        transport: T,
        catalog: ModelCatalog,
        document_id: lectern_core::DocumentId,
        block_count: u32,
        user_id: UserId,
        model_slug: &str,
        voice_slug: Option<&str>,
        config: SessionConfig,
    ) -> PlayerResult<Self> {
        let session = PlaybackSession::open(
            &catalog,
            document_id,
            block_count,
            user_id,
            model_slug,
            voice_slug,
            config,
        )?;
        Ok(Self::new(transport, catalog, session))
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_session(self) -> PlaybackSession {
        self.session
    }

    pub async fn start(&mut self) {
        let commands = self.session.fill(Instant::now());
        self.execute(commands).await;
    }

    pub async fn tick(&mut self) {
        let commands = self.session.tick(Instant::now());
        self.execute(commands).await;
    }

    /// Carry out commands, feeding every answer back into the session until
    /// nothing is left to do. Transport failures end up as block state.
    pub async fn execute(&mut self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            if !self.session.wants(&command) {
                debug!(?command, "Skipping superseded command");
                continue;
            }
            let follow_up = match command {
                Command::Request(request) => match self.transport.request(&request).await {
                    Ok(receipt) => self.session.on_request_ack(&request, receipt, Instant::now()),
                    Err(err) => match err.block_error_kind() {
                        Some(kind) => {
                            warn!(block_idx = request.block_idx, error = %err, "Synthesis request failed");
                            self.session
                                .on_request_failed(&request, kind, err.to_string(), Instant::now())
                        }
                        None => {
                            self.protocol_error(err.to_string());
                            Vec::new()
                        }
                    },
                },
                Command::FetchAudio {
                    block_idx,
                    content_key,
                } => match self.transport.fetch_audio(&content_key).await {
                    Ok(Some(audio)) => {
                        debug!(block_idx, bytes = audio.len(), "Audio fetched");
                        self.session.audio_fetched(block_idx, &content_key, audio);
                        Vec::new()
                    }
                    Ok(None) => self.session.audio_missing(block_idx, &content_key, Instant::now()),
                    Err(err) => match err.block_error_kind() {
                        Some(_) => {
                            warn!(block_idx, error = %err, "Audio fetch failed");
                            self.session.audio_fetch_failed(block_idx, &content_key);
                            Vec::new()
                        }
                        None => {
                            self.protocol_error(err.to_string());
                            Vec::new()
                        }
                    },
                },
            };
            queue.extend(follow_up);
        }
    }

    pub async fn handle_realtime(&mut self, event: RealtimeEvent) {
        let now = Instant::now();
        let commands = match event {
            RealtimeEvent::Connected => self.session.on_connected(now),
            RealtimeEvent::Message(ChannelMessage::Status(status)) => self.session.apply_status(&status, now),
            RealtimeEvent::Message(ChannelMessage::Lagged { skipped }) => self.session.on_lagged(skipped, now),
            RealtimeEvent::Message(ChannelMessage::Connected { document_id }) => {
                if document_id != self.session.document_id() {
                    self.protocol_error(format!("channel opened for document {}", document_id));
                }
                Vec::new()
            }
            RealtimeEvent::Reconnecting { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Status channel reconnecting");
                self.session.on_reconnecting(attempt);
                Vec::new()
            }
            RealtimeEvent::Failed { attempts } => {
                self.session.on_connection_failed(attempts);
                Vec::new()
            }
            RealtimeEvent::ProtocolError(message) => {
                self.protocol_error(message);
                Vec::new()
            }
        };
        self.execute(commands).await;
    }

    /// Returns false once the engine should stop.
    pub async fn handle_control(&mut self, control: Control) -> PlayerResult<bool> {
        let now = Instant::now();
        let commands = match control {
            Control::Seek(block_idx) => self.session.seek(block_idx, now)?,
            Control::Advance => self.session.advance(now),
            Control::Retry(block_idx) => self.session.retry(block_idx, now)?,
            Control::SwitchVoice(voice) => self.session.switch_voice(&self.catalog, voice.as_deref(), now)?,
            Control::Await { block_idx, reply } => {
                self.session.subscribe(block_idx, reply)?;
                Vec::new()
            }
            Control::Stop => {
                self.session.stop();
                return Ok(false);
            }
        };
        self.execute(commands).await;
        Ok(true)
    }

    /// Run until stopped or the control channel closes. Returns the session
    /// so callers can inspect the final state.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RealtimeEvent>,
        mut controls: mpsc::Receiver<Control>,
        tick_interval: Duration,
    ) -> PlaybackSession {
        self.start().await;

        let mut tick = interval(tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_realtime(event).await;
                }

                control = controls.recv() => {
                    let Some(control) = control else {
                        self.session.stop();
                        break;
                    };
                    match self.handle_control(control).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => warn!(error = %e, "Control rejected"),
                    }
                }

                _ = tick.tick() => {
                    self.tick().await;
                }
            }
        }

        info!(document_id = %self.session.document_id(), "Playback engine stopped");
        self.session
    }

    fn protocol_error(&mut self, message: String) {
        let failed = self.session.fail_pending(ErrorKind::ProtocolError, message.clone());
        error!(error = %message, failed, "Protocol error, failing pending blocks");
    }
}
