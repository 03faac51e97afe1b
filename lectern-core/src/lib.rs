//! LECTERN Core - Pipeline Types
//!
//! Pure data structures shared by the cache engine, the server pipeline and
//! the playback client. All other crates depend on this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod catalog;
pub mod error;
pub mod key;
pub mod usage;

pub use catalog::{ModelCatalog, ModelDescriptor, VoiceDescriptor};
pub use error::{
    BillingError, ConfigError, LecternError, LecternResult, QueueError, StorageError,
    ValidationError,
};
pub use key::{normalize_slug, normalize_text, ContentKey, CONTENT_KEY_LEN};
pub use usage::{Deduction, UsagePools};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Document identifier.
pub type DocumentId = Uuid;

/// User (billing subject) identifier.
pub type UserId = Uuid;

/// Job identifier. UUIDv7, doubles as the billing correlation id.
pub type JobId = Uuid;

/// Zero-based position of a block inside its document.
pub type BlockIndex = u32;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 identifier (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

// ============================================================================
// ENUMS
// ============================================================================

/// Failure taxonomy shared by server and client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worker crashed, OOM'd or timed out. Retry.
    TransientWorkerFailure,
    /// e.g. voice unsupported for model. Surfaced immediately, never retried.
    InvalidRequest,
    /// Cache write failed. Never reported as success.
    StorageFailure,
    /// Usage accounting failed. Stays in the billing queue.
    BillingApplyFailure,
    /// Client-local: connection dropped, triggers reconciliation.
    ConnectionLoss,
    /// Client-local: the block waited longer than its budget.
    Timeout,
    /// Client-local: the server broke the protocol. Fails every pending block.
    ProtocolError,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::InvalidRequest)
    }
}

/// Per-block synthesis status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Idle,
    Queued,
    Processing,
    Cached,
    Error,
}

impl BlockStatus {
    /// Position in the forward lifecycle. `Cached` and `Error` are both terminal.
    pub fn rank(&self) -> u8 {
        match self {
            BlockStatus::Idle => 0,
            BlockStatus::Queued => 1,
            BlockStatus::Processing => 2,
            BlockStatus::Cached | BlockStatus::Error => 3,
        }
    }

    /// Waiting on the server.
    pub fn is_pending(&self) -> bool {
        matches!(self, BlockStatus::Queued | BlockStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Idle => "idle",
            BlockStatus::Queued => "queued",
            BlockStatus::Processing => "processing",
            BlockStatus::Cached => "cached",
            BlockStatus::Error => "error",
        }
    }
}

/// Kind of metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Characters,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Characters => "characters",
        }
    }
}

// ============================================================================
// JOBS AND RESULTS
// ============================================================================

/// Knobs that change the rendered audio and therefore the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SynthesisParams {
    /// Playback speed in percent (100 = normal).
    pub speed_pct: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            speed_pct: 100,
            variant: None,
        }
    }
}

/// Name of the work queue serving `model_slug`.
pub fn queue_for_model(model_slug: &str) -> String {
    let slug: String = normalize_slug(model_slug)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("synthesis.{}", slug)
}

/// Identity of an outstanding request. At most one job per key is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub document_id: DocumentId,
    pub block_idx: BlockIndex,
    pub model_slug: String,
    pub voice_slug: String,
}

impl JobKey {
    pub fn new(document_id: DocumentId, block_idx: BlockIndex, model_slug: &str, voice_slug: &str) -> Self {
        Self {
            document_id,
            block_idx,
            model_slug: normalize_slug(model_slug),
            voice_slug: normalize_slug(voice_slug),
        }
    }
}

/// A unit of work for an external synthesis worker. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisJob {
    pub job_id: JobId,
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub block_idx: BlockIndex,
    pub model_slug: String,
    pub voice_slug: String,
    pub text: String,
    pub params: SynthesisParams,
    pub content_key: ContentKey,
    pub queue: String,
    pub enqueued_at: Timestamp,
}

impl SynthesisJob {
    pub fn new(
        user_id: UserId,
        key: &JobKey,
        text: impl Into<String>,
        params: SynthesisParams,
    ) -> Self {
        let text = text.into();
        let content_key = ContentKey::derive(&text, &key.model_slug, &key.voice_slug, &params);
        Self {
            job_id: new_entity_id(),
            user_id,
            document_id: key.document_id,
            block_idx: key.block_idx,
            model_slug: key.model_slug.clone(),
            voice_slug: key.voice_slug.clone(),
            text,
            params,
            content_key,
            queue: queue_for_model(&key.model_slug),
            enqueued_at: Utc::now(),
        }
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.document_id, self.block_idx, &self.model_slug, &self.voice_slug)
    }

    /// Billable size of this job.
    pub fn billable_quantity(&self) -> u64 {
        normalize_text(&self.text).chars().count() as u64
    }
}

/// What a worker produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SynthesisOutcome {
    Success { audio: Vec<u8>, duration_ms: u64 },
    Failure { kind: ErrorKind, message: String },
}

/// A worker's answer to a [`SynthesisJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub job_id: JobId,
    pub document_id: DocumentId,
    pub block_idx: BlockIndex,
    pub model_slug: String,
    pub voice_slug: String,
    pub content_key: ContentKey,
    pub outcome: SynthesisOutcome,
}

impl SynthesisResult {
    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.document_id, self.block_idx, &self.model_slug, &self.voice_slug)
    }

    pub fn for_job(job: &SynthesisJob, outcome: SynthesisOutcome) -> Self {
        Self {
            job_id: job.job_id,
            document_id: job.document_id,
            block_idx: job.block_idx,
            model_slug: job.model_slug.clone(),
            voice_slug: job.voice_slug.clone(),
            content_key: job.content_key.clone(),
            outcome,
        }
    }
}

// ============================================================================
// BILLING
// ============================================================================

/// Metered usage to be applied by the cold path. Delivered at-least-once;
/// `correlation_id` is the idempotency key ledgers deduplicate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub user_id: UserId,
    pub resource_kind: ResourceKind,
    pub quantity: u64,
    pub correlation_id: Uuid,
    pub enqueued_at: Timestamp,
}

impl BillingEvent {
    pub fn for_job(job: &SynthesisJob) -> Self {
        Self {
            user_id: job.user_id,
            resource_kind: ResourceKind::Characters,
            quantity: job.billable_quantity(),
            correlation_id: job.job_id,
            enqueued_at: Utc::now(),
        }
    }
}

// ============================================================================
// STATUS NOTIFICATIONS
// ============================================================================

/// Error detail attached to an `error` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Status push for one block, published on the document's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub document_id: DocumentId,
    pub block_idx: BlockIndex,
    pub model_slug: String,
    pub voice_slug: String,
    pub status: BlockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_key: Option<ContentKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    /// The job this status is about. Absent for cache hits served without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl StatusEvent {
    pub fn new(key: &JobKey, status: BlockStatus) -> Self {
        Self {
            document_id: key.document_id,
            block_idx: key.block_idx,
            model_slug: key.model_slug.clone(),
            voice_slug: key.voice_slug.clone(),
            status,
            content_key: None,
            error: None,
            job_id: None,
        }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn cached(key: &JobKey, content_key: ContentKey) -> Self {
        Self {
            content_key: Some(content_key),
            ..Self::new(key, BlockStatus::Cached)
        }
    }

    pub fn failed(key: &JobKey, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(StatusError {
                kind,
                message: message.into(),
            }),
            ..Self::new(key, BlockStatus::Error)
        }
    }

    /// True when this event belongs to the given document/model/voice triple.
    pub fn matches(&self, document_id: DocumentId, model_slug: &str, voice_slug: &str) -> bool {
        self.document_id == document_id
            && self.model_slug == normalize_slug(model_slug)
            && self.voice_slug == normalize_slug(voice_slug)
    }
}

/// Frame sent on a document's WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Connected { document_id: DocumentId },
    Status(StatusEvent),
    /// The server dropped `skipped` events for this subscriber.
    Lagged { skipped: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_message_is_tagged() -> Result<(), serde_json::Error> {
        let key = JobKey::new(Uuid::nil(), 4, "kokoro", "af_heart");
        let msg = ChannelMessage::Status(StatusEvent::new(&key, BlockStatus::Processing));
        let json = serde_json::to_value(&msg)?;
        assert_eq!(json["type"], "status");
        assert_eq!(json["block_idx"], 4);
        assert_eq!(json["status"], "processing");
        assert!(json.get("job_id").is_none());

        let back: ChannelMessage = serde_json::from_value(json)?;
        assert_eq!(back, msg);

        let job_id = Uuid::now_v7();
        let with_job = ChannelMessage::Status(StatusEvent::new(&key, BlockStatus::Queued).with_job(job_id));
        let json = serde_json::to_value(&with_job)?;
        assert_eq!(json["job_id"], job_id.to_string());
        assert_eq!(serde_json::from_value::<ChannelMessage>(json)?, with_job);

        let lagged: ChannelMessage = serde_json::from_str(r#"{"type":"lagged","skipped":3}"#)?;
        assert_eq!(lagged, ChannelMessage::Lagged { skipped: 3 });
        Ok(())
    }

    #[test]
    fn test_queue_for_model_is_deterministic() {
        assert_eq!(queue_for_model("Kokoro"), "synthesis.kokoro");
        assert_eq!(queue_for_model("kokoro"), queue_for_model(" KOKORO "));
        assert_eq!(queue_for_model("xtts v2"), "synthesis.xtts-v2");
    }

    #[test]
    fn test_job_derives_key_and_queue() {
        let key = JobKey::new(Uuid::now_v7(), 3, "Kokoro", "AF_Heart");
        let job = SynthesisJob::new(Uuid::now_v7(), &key, "Some text.", SynthesisParams::default());
        assert_eq!(job.queue, "synthesis.kokoro");
        assert_eq!(job.voice_slug, "af_heart");
        assert_eq!(
            job.content_key,
            ContentKey::derive("Some text.", "kokoro", "af_heart", &SynthesisParams::default())
        );
        assert_eq!(job.job_key(), key);
    }

    #[test]
    fn test_billing_event_uses_job_id_as_correlation() {
        let key = JobKey::new(Uuid::now_v7(), 0, "kokoro", "af_heart");
        let job = SynthesisJob::new(Uuid::now_v7(), &key, "  four  ", SynthesisParams::default());
        let event = BillingEvent::for_job(&job);
        assert_eq!(event.correlation_id, job.job_id);
        assert_eq!(event.quantity, 4);
    }

    #[test]
    fn test_block_status_ranks() {
        assert!(BlockStatus::Queued.rank() < BlockStatus::Processing.rank());
        assert!(BlockStatus::Cached.is_terminal());
        assert!(BlockStatus::Error.is_terminal());
        assert!(BlockStatus::Processing.is_pending());
        assert!(!BlockStatus::Idle.is_pending());
    }

    #[test]
    fn test_status_event_matches_triple() {
        let doc = Uuid::now_v7();
        let key = JobKey::new(doc, 1, "kokoro", "af_heart");
        let event = StatusEvent::new(&key, BlockStatus::Queued);
        assert!(event.matches(doc, "KOKORO", "af_heart"));
        assert!(!event.matches(doc, "kokoro", "am_adam"));
        assert!(!event.matches(Uuid::now_v7(), "kokoro", "af_heart"));
    }

    #[test]
    fn test_status_event_wire_format() -> Result<(), serde_json::Error> {
        let key = JobKey::new(Uuid::nil(), 2, "kokoro", "af_heart");
        let event = StatusEvent::failed(&key, ErrorKind::StorageFailure, "disk full");
        let json = serde_json::to_value(&event)?;
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["kind"], "storage_failure");
        assert!(json.get("content_key").is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_request_not_retryable() {
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(ErrorKind::TransientWorkerFailure.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
    }
}
