//! Document status channel with reconnect backoff.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use lectern_core::{ChannelMessage, DocumentId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{PlayerConfig, ReconnectConfig};
use crate::error::TransportError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the channel manager reports to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connected,
    Message(ChannelMessage),
    /// The connection dropped or could not be opened; retrying after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// `max_attempts` consecutive attempts failed. The manager has exited.
    Failed { attempts: u32 },
    /// The server sent a frame that is not a channel message.
    ProtocolError(String),
}

/// Exponential backoff with jitter, bounded by `max_attempts`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current_ms: u64,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_ms = config.initial_ms;
        Self {
            config,
            current_ms,
            attempts: 0,
        }
    }

    /// Consecutive failures since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current_ms = self.config.initial_ms;
        self.attempts = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = jittered_backoff(self.current_ms, self.config.jitter_ms);
        let next = (self.current_ms as f64 * self.config.multiplier) as u64;
        self.current_ms = next.min(self.config.max_ms);
        Some(Duration::from_millis(delay))
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

#[derive(Debug, Clone)]
pub struct RealtimeClient {
    endpoint: String,
    reconnect: ReconnectConfig,
}

impl RealtimeClient {
    pub fn new(config: &PlayerConfig) -> Self {
        Self::with_endpoint(&config.ws_endpoint, config.reconnect.clone())
    }

    pub fn with_endpoint(endpoint: &str, reconnect: ReconnectConfig) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            reconnect,
        }
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }

    pub fn document_url(&self, document_id: DocumentId) -> String {
        format!("{}/ws/documents/{}", self.endpoint, document_id)
    }

    pub async fn connect(&self, document_id: DocumentId) -> Result<WsStream, TransportError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.document_url(document_id)).await?;
        Ok(stream)
    }
}

/// Keep a document's status channel open, forwarding everything to `sender`.
///
/// Exits when `sender` is closed or reconnect attempts are exhausted; the
/// latter is reported as [`RealtimeEvent::Failed`].
pub fn spawn_realtime(
    client: RealtimeClient,
    document_id: DocumentId,
    sender: mpsc::Sender<RealtimeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(client.reconnect_config().clone());
        loop {
            match client.connect(document_id).await {
                Ok(mut stream) => {
                    backoff.reset();
                    info!(document_id = %document_id, "Status channel open");
                    if sender.send(RealtimeEvent::Connected).await.is_err() {
                        return;
                    }

                    while let Some(message) = stream.next().await {
                        let event = match message {
                            Ok(Message::Text(text)) => match serde_json::from_str::<ChannelMessage>(&text) {
                                Ok(msg) => RealtimeEvent::Message(msg),
                                Err(err) => RealtimeEvent::ProtocolError(format!(
                                    "undecodable channel frame: {}",
                                    err
                                )),
                            },
                            Ok(Message::Close(_)) => {
                                debug!(document_id = %document_id, "Server closed status channel");
                                break;
                            }
                            Ok(_) => continue,
                            Err(err) => {
                                warn!(document_id = %document_id, error = %err, "Status channel error");
                                break;
                            }
                        };
                        if sender.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(document_id = %document_id, error = %err, "Status channel connect failed");
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    let event = RealtimeEvent::Reconnecting {
                        attempt: backoff.attempts(),
                        delay,
                    };
                    if sender.send(event).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        document_id = %document_id,
                        attempts = backoff.attempts(),
                        "Giving up on status channel"
                    );
                    let _ = sender
                        .send(RealtimeEvent::Failed {
                            attempts: backoff.attempts(),
                        })
                        .await;
                    return;
                }
            }
        }
    })
}
