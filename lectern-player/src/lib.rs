//! LECTERN Player - Playback Client
//!
//! Client side of the delivery pipeline. A [`PlaybackSession`] keeps the
//! per-block state for one document and voice; the [`PlaybackEngine`] drives
//! it against the server over HTTP ([`HttpTransport`]) and the document
//! status channel ([`spawn_realtime`]).
//!
//! ```ignore
//! let config = PlayerConfig::load()?;
//! let transport = HttpTransport::new(&config)?;
//! let engine = PlaybackEngine::open(transport, &config, &blocks).await?;
//!
//! let (events_tx, events_rx) = mpsc::channel(256);
//! spawn_realtime(RealtimeClient::new(&config), engine.session().document_id(), events_tx);
//! let (controls_tx, controls_rx) = mpsc::channel(16);
//! tokio::spawn(engine.run(events_rx, controls_rx, config.tick_interval()));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod realtime;
pub mod session;
pub mod transport;

pub use config::{BufferConfig, ConfigError, PlayerConfig, ReconnectConfig};
pub use engine::{Control, PlaybackEngine};
pub use error::{PlayerError, PlayerResult, TransportError};
pub use realtime::{spawn_realtime, Backoff, RealtimeClient, RealtimeEvent};
pub use session::{
    BlockState, CancelReason, Command, ConnectionState, PlaybackOutcome, PlaybackSession,
    SessionConfig,
};
pub use transport::{BlockRequest, HttpTransport, RegisteredDocument, RequestReceipt, SynthesisTransport};
