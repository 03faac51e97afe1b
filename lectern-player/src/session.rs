//! Per-session playback state.
//!
//! A [`PlaybackSession`] owns the status table of one document rendered by
//! one model/voice pair. It performs no I/O: every operation takes the
//! current [`Instant`] and returns the [`Command`]s the engine has to carry
//! out, so the state machine can be driven deterministically in tests.
//!
//! Block lifecycle: `idle → queued → processing → {cached | error}`.
//!
//! - Requests are only issued for `idle` blocks, at most `max_in_flight`
//!   pending at once, inside the buffer window past the cursor.
//! - `retry` writes `queued` unconditionally, whatever the block holds.
//! - An `error` status from the channel is only trusted for the latest
//!   request. When both the event and the block carry a job id they must
//!   match; otherwise the latest request must have been confirmed, either by
//!   an ack naming its job or by a `queued`/`processing` push.
//! - Losing cached audio spends the block's auto-retry budget, so a store
//!   that keeps dropping an artifact ends in a retryable `error`.
//! - A reconnect (or a lagged channel) resets pending blocks to `idle` and
//!   re-requests them; `cached` blocks keep their audio.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lectern_core::{
    normalize_slug, BlockIndex, BlockStatus, ContentKey, DocumentId, ErrorKind, JobId,
    ModelCatalog, StatusError, StatusEvent, UserId,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::BufferConfig;
use crate::error::{PlayerError, PlayerResult};
use crate::transport::{BlockRequest, RequestReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Blocks to keep requested past the cursor.
    pub buffer_ahead: u32,
    pub max_in_flight: usize,
    pub block_timeout: Duration,
    pub max_auto_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_ahead: 3,
            max_in_flight: 2,
            block_timeout: Duration::from_secs(30),
            max_auto_retries: 2,
        }
    }
}

impl From<&BufferConfig> for SessionConfig {
    fn from(buffer: &BufferConfig) -> Self {
        Self {
            buffer_ahead: buffer.ahead,
            max_in_flight: buffer.max_in_flight,
            block_timeout: buffer.block_timeout(),
            max_auto_retries: buffer.max_auto_retries,
        }
    }
}

/// Work the engine must perform on behalf of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Request(BlockRequest),
    FetchAudio {
        block_idx: BlockIndex,
        content_key: ContentKey,
    },
}

/// Why a pending wait ended without audio. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    VoiceSwitch,
    Stopped,
    Timeout,
}

/// What a waiter on a block eventually receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Ready(Arc<Vec<u8>>),
    Failed(StatusError),
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts are exhausted. Only a new session recovers.
    Failed { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct BlockState {
    pub status: BlockStatus,
    pub content_key: Option<ContentKey>,
    pub audio: Option<Arc<Vec<u8>>>,
    pub error: Option<StatusError>,
    pub job_id: Option<JobId>,
    pub auto_retries: u32,
    requested_at: Option<Instant>,
    confirmed: bool,
    fetching: bool,
}

impl Default for BlockState {
    fn default() -> Self {
        Self {
            status: BlockStatus::Idle,
            content_key: None,
            audio: None,
            error: None,
            job_id: None,
            auto_retries: 0,
            requested_at: None,
            confirmed: false,
            fetching: false,
        }
    }
}

impl BlockState {
    fn reset_pending(&mut self) {
        self.status = BlockStatus::Idle;
        self.requested_at = None;
        self.confirmed = false;
        self.job_id = None;
    }
}

pub struct PlaybackSession {
    document_id: DocumentId,
    user_id: UserId,
    model_slug: String,
    voice_slug: String,
    config: SessionConfig,
    blocks: Vec<BlockState>,
    cursor: BlockIndex,
    connection: ConnectionState,
    waiters: HashMap<BlockIndex, Vec<oneshot::Sender<PlaybackOutcome>>>,
    stopped: bool,
}

impl PlaybackSession {
    /// Start a session, validating (or defaulting) the voice against the
    /// server catalog.
    pub fn open(
        catalog: &ModelCatalog,
        document_id: DocumentId,
        block_count: u32,
        user_id: UserId,
        model_slug: &str,
        voice_slug: Option<&str>,
        config: SessionConfig,
    ) -> PlayerResult<Self> {
        let voice = catalog.resolve_voice(model_slug, voice_slug)?;
        let model = catalog.validate_pair(model_slug, &voice)?;

        Ok(Self {
            document_id,
            user_id,
            model_slug: model.slug.clone(),
            voice_slug: voice,
            config,
            blocks: vec![BlockState::default(); block_count as usize],
            cursor: 0,
            connection: ConnectionState::Disconnected,
            waiters: HashMap::new(),
            stopped: false,
        })
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn model_slug(&self) -> &str {
        &self.model_slug
    }

    pub fn voice_slug(&self) -> &str {
        &self.voice_slug
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn cursor(&self) -> BlockIndex {
        self.cursor
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn block(&self, block_idx: BlockIndex) -> Option<&BlockState> {
        self.blocks.get(block_idx as usize)
    }

    pub fn status(&self, block_idx: BlockIndex) -> Option<BlockStatus> {
        self.block(block_idx).map(|b| b.status)
    }

    /// Blocks waiting on the server.
    pub fn in_flight(&self) -> usize {
        self.blocks.iter().filter(|b| b.status.is_pending()).count()
    }

    /// False once a queued command no longer matches the session, e.g. the
    /// block failed or the voice changed before it was sent.
    pub fn wants(&self, command: &Command) -> bool {
        if self.stopped {
            return false;
        }
        match command {
            Command::Request(request) => {
                self.is_current(request)
                    && self
                        .status(request.block_idx)
                        .is_some_and(|status| status.is_pending())
            }
            Command::FetchAudio {
                block_idx,
                content_key,
            } => self.block(*block_idx).is_some_and(|b| {
                b.status == BlockStatus::Cached && b.content_key.as_ref() == Some(content_key)
            }),
        }
    }

    // ========================================================================
    // BUFFERING
    // ========================================================================

    /// Request what the buffer window is missing, within `max_in_flight`.
    pub fn fill(&mut self, now: Instant) -> Vec<Command> {
        if self.stopped || self.blocks.is_empty() {
            return Vec::new();
        }

        let end = self
            .cursor
            .saturating_add(self.config.buffer_ahead)
            .min(self.block_count() - 1);
        let mut in_flight = self.in_flight();
        let mut commands = Vec::new();

        for idx in self.cursor..=end {
            let (status, needs_audio) = {
                let block = &self.blocks[idx as usize];
                (block.status, block.audio.is_none() && !block.fetching)
            };
            match status {
                BlockStatus::Idle if in_flight < self.config.max_in_flight => {
                    commands.push(self.issue(idx, now));
                    in_flight += 1;
                }
                BlockStatus::Cached if needs_audio => {
                    if let Some(command) = self.fetch(idx) {
                        commands.push(command);
                    }
                }
                _ => {}
            }
        }
        commands
    }

    pub fn seek(&mut self, block_idx: BlockIndex, now: Instant) -> PlayerResult<Vec<Command>> {
        self.check_block(block_idx)?;
        self.cursor = block_idx;
        Ok(self.fill(now))
    }

    /// Move the cursor to the next block after playback finished the current one.
    pub fn advance(&mut self, now: Instant) -> Vec<Command> {
        if self.cursor + 1 < self.block_count() {
            self.cursor += 1;
        }
        self.fill(now)
    }

    /// Time out overdue blocks, then refill the window.
    pub fn tick(&mut self, now: Instant) -> Vec<Command> {
        if self.stopped {
            return Vec::new();
        }

        let overdue: Vec<BlockIndex> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.status.is_pending()
                    && b.requested_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= self.config.block_timeout)
            })
            .map(|(idx, _)| idx as BlockIndex)
            .collect();

        let mut commands = Vec::new();
        for idx in overdue {
            let message = format!(
                "no result after {}ms",
                self.config.block_timeout.as_millis()
            );
            commands.extend(self.fail_block(idx, ErrorKind::Timeout, message, now));
        }
        commands.extend(self.fill(now));
        commands
    }

    /// Re-request a block. Always lands in `queued`, whatever the block held.
    pub fn retry(&mut self, block_idx: BlockIndex, now: Instant) -> PlayerResult<Vec<Command>> {
        if self.stopped {
            return Err(PlayerError::Stopped);
        }
        self.check_block(block_idx)?;

        let block = &mut self.blocks[block_idx as usize];
        block.auto_retries = 0;
        block.audio = None;
        block.content_key = None;
        block.fetching = false;
        info!(document_id = %self.document_id, block_idx, "Retrying block");
        Ok(vec![self.issue(block_idx, now)])
    }

    // ========================================================================
    // SERVER RESPONSES
    // ========================================================================

    /// Apply the synchronous answer to a request.
    pub fn on_request_ack(
        &mut self,
        request: &BlockRequest,
        receipt: RequestReceipt,
        _now: Instant,
    ) -> Vec<Command> {
        if !self.is_current(request) {
            debug!(block_idx = request.block_idx, "Discarding ack for a previous voice");
            return Vec::new();
        }
        let idx = request.block_idx;
        let Some(block) = self.blocks.get_mut(idx as usize) else {
            return Vec::new();
        };

        match receipt.status {
            BlockStatus::Cached => self.mark_cached(idx, receipt.content_key),
            BlockStatus::Queued | BlockStatus::Processing => {
                if block.status.is_pending() {
                    block.content_key = Some(receipt.content_key);
                    if let Some(job_id) = receipt.job_id {
                        // The server named the job serving this request.
                        block.job_id = Some(job_id);
                        block.confirmed = true;
                    }
                    if receipt.status.rank() > block.status.rank() {
                        block.status = receipt.status;
                    }
                }
                Vec::new()
            }
            other => {
                warn!(block_idx = idx, status = other.as_str(), "Unexpected request status");
                Vec::new()
            }
        }
    }

    /// The request itself failed (rejected, network, server error).
    pub fn on_request_failed(
        &mut self,
        request: &BlockRequest,
        kind: ErrorKind,
        message: String,
        now: Instant,
    ) -> Vec<Command> {
        if !self.is_current(request) {
            return Vec::new();
        }
        match self.status(request.block_idx) {
            Some(status) if status.is_pending() => self.fail_block(request.block_idx, kind, message, now),
            _ => Vec::new(),
        }
    }

    /// Apply a status push from the document channel.
    pub fn apply_status(&mut self, event: &StatusEvent, now: Instant) -> Vec<Command> {
        if self.stopped {
            return Vec::new();
        }
        if !event.matches(self.document_id, &self.model_slug, &self.voice_slug) {
            debug!(
                document_id = %event.document_id,
                model_slug = %event.model_slug,
                voice_slug = %event.voice_slug,
                "Discarding status for another session"
            );
            return Vec::new();
        }
        let idx = event.block_idx;
        let Some(block) = self.blocks.get_mut(idx as usize) else {
            warn!(block_idx = idx, "Status for a block outside the document");
            return Vec::new();
        };

        match event.status {
            BlockStatus::Cached => match &event.content_key {
                Some(key) if block.content_key.as_ref() == Some(key) && block.status == BlockStatus::Cached => {
                    Vec::new()
                }
                Some(key) => self.mark_cached(idx, key.clone()),
                None => {
                    warn!(block_idx = idx, "Cached status without a content key");
                    Vec::new()
                }
            },
            BlockStatus::Queued | BlockStatus::Processing => {
                let same_job = match (event.job_id, block.job_id) {
                    (Some(event_job), Some(block_job)) => event_job == block_job,
                    _ => true,
                };
                if block.status.is_pending() && same_job {
                    block.confirmed = true;
                    if event.status.rank() > block.status.rank() {
                        block.status = event.status;
                    }
                }
                Vec::new()
            }
            BlockStatus::Error => {
                let current = match (event.job_id, block.job_id) {
                    (Some(event_job), Some(block_job)) => event_job == block_job,
                    _ => block.confirmed,
                };
                if !block.status.is_pending() || !current {
                    debug!(block_idx = idx, status = block.status.as_str(), "Ignoring stale error");
                    return Vec::new();
                }
                let (kind, message) = match &event.error {
                    Some(err) => (err.kind, err.message.clone()),
                    None => (ErrorKind::TransientWorkerFailure, "synthesis failed".to_string()),
                };
                self.fail_block(idx, kind, message, now)
            }
            BlockStatus::Idle => Vec::new(),
        }
    }

    pub fn audio_fetched(&mut self, block_idx: BlockIndex, content_key: &ContentKey, audio: Vec<u8>) {
        let Some(block) = self.blocks.get_mut(block_idx as usize) else {
            return;
        };
        if block.status != BlockStatus::Cached || block.content_key.as_ref() != Some(content_key) {
            debug!(block_idx, "Discarding audio for a superseded key");
            return;
        }
        let audio = Arc::new(audio);
        block.audio = Some(Arc::clone(&audio));
        block.fetching = false;
        self.resolve(block_idx, PlaybackOutcome::Ready(audio));
    }

    /// The server no longer holds the artifact. Request it again while the
    /// block's retry budget lasts.
    pub fn audio_missing(
        &mut self,
        block_idx: BlockIndex,
        content_key: &ContentKey,
        now: Instant,
    ) -> Vec<Command> {
        let Some(block) = self.blocks.get_mut(block_idx as usize) else {
            return Vec::new();
        };
        if block.content_key.as_ref() != Some(content_key) {
            return Vec::new();
        }
        warn!(block_idx, content_key = %content_key, "Cached audio is gone");
        *block = BlockState {
            auto_retries: block.auto_retries,
            ..BlockState::default()
        };
        let mut commands = self.fail_block(
            block_idx,
            ErrorKind::StorageFailure,
            "cached audio is gone".to_string(),
            now,
        );
        commands.extend(self.fill(now));
        commands
    }

    /// The fetch failed transiently; the next fill tries again.
    pub fn audio_fetch_failed(&mut self, block_idx: BlockIndex, content_key: &ContentKey) {
        if let Some(block) = self.blocks.get_mut(block_idx as usize) {
            if block.content_key.as_ref() == Some(content_key) {
                block.fetching = false;
            }
        }
    }

    // ========================================================================
    // CONNECTION
    // ========================================================================

    /// The channel is (re)established. The server kept nothing for us, so
    /// pending work is re-requested.
    pub fn on_connected(&mut self, now: Instant) -> Vec<Command> {
        let previous = self.connection;
        self.connection = ConnectionState::Connected;
        info!(document_id = %self.document_id, ?previous, "Status channel connected");
        self.reconcile(now)
    }

    pub fn on_reconnecting(&mut self, attempt: u32) {
        self.connection = ConnectionState::Reconnecting { attempt };
    }

    /// The channel is gone for good. Nothing pending will ever resolve.
    pub fn on_connection_failed(&mut self, attempts: u32) {
        self.connection = ConnectionState::Failed { attempts };
        let failed = self.fail_pending(
            ErrorKind::ConnectionLoss,
            format!("status channel lost after {} attempts", attempts),
        );
        warn!(document_id = %self.document_id, attempts, failed, "Status channel failed");
    }

    /// The channel dropped events. Same recovery as a reconnect.
    pub fn on_lagged(&mut self, skipped: u64, now: Instant) -> Vec<Command> {
        warn!(document_id = %self.document_id, skipped, "Status channel lagged, reconciling");
        self.reconcile(now)
    }

    /// Reset pending blocks to `idle` and refill. Cached blocks are untouched.
    pub fn reconcile(&mut self, now: Instant) -> Vec<Command> {
        let mut reset = 0;
        for block in self.blocks.iter_mut().filter(|b| b.status.is_pending()) {
            block.reset_pending();
            reset += 1;
        }
        if reset > 0 {
            debug!(document_id = %self.document_id, reset, "Pending blocks reset to idle");
        }
        self.fill(now)
    }

    /// Fail every pending block immediately. Used for protocol errors.
    pub fn fail_pending(&mut self, kind: ErrorKind, message: String) -> usize {
        let pending: Vec<BlockIndex> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status.is_pending())
            .map(|(idx, _)| idx as BlockIndex)
            .collect();

        for &idx in &pending {
            self.set_error(idx, kind, message.clone());
        }
        pending.len()
    }

    // ========================================================================
    // VOICE / MODEL
    // ========================================================================

    /// Switch voice on the current model. `None` picks the model default.
    pub fn switch_voice(
        &mut self,
        catalog: &ModelCatalog,
        voice_slug: Option<&str>,
        now: Instant,
    ) -> PlayerResult<Vec<Command>> {
        let model = self.model_slug.clone();
        self.switch_model(catalog, &model, voice_slug, now)
    }

    pub fn switch_model(
        &mut self,
        catalog: &ModelCatalog,
        model_slug: &str,
        voice_slug: Option<&str>,
        now: Instant,
    ) -> PlayerResult<Vec<Command>> {
        if self.stopped {
            return Err(PlayerError::Stopped);
        }
        let voice = catalog.resolve_voice(model_slug, voice_slug)?;
        let model = catalog.validate_pair(model_slug, &voice)?.slug.clone();
        if model == self.model_slug && voice == self.voice_slug {
            return Ok(Vec::new());
        }

        info!(
            document_id = %self.document_id,
            from = %self.voice_slug,
            to = %voice,
            model_slug = %model,
            "Switching voice"
        );
        self.cancel_all(CancelReason::VoiceSwitch);
        self.model_slug = model;
        self.voice_slug = voice;
        for block in &mut self.blocks {
            *block = BlockState::default();
        }
        Ok(self.fill(now))
    }

    // ========================================================================
    // WAITERS
    // ========================================================================

    /// Wait for a block's audio.
    pub fn wait_for(&mut self, block_idx: BlockIndex) -> PlayerResult<oneshot::Receiver<PlaybackOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.subscribe(block_idx, tx)?;
        Ok(rx)
    }

    pub fn subscribe(
        &mut self,
        block_idx: BlockIndex,
        reply: oneshot::Sender<PlaybackOutcome>,
    ) -> PlayerResult<()> {
        self.check_block(block_idx)?;
        if self.stopped {
            let _ = reply.send(PlaybackOutcome::Cancelled(CancelReason::Stopped));
            return Ok(());
        }

        let block = &self.blocks[block_idx as usize];
        match (&block.status, &block.audio, &block.error) {
            (BlockStatus::Cached, Some(audio), _) => {
                let _ = reply.send(PlaybackOutcome::Ready(Arc::clone(audio)));
            }
            (BlockStatus::Error, _, Some(err)) => {
                let _ = reply.send(outcome_for_error(err));
            }
            _ => self.waiters.entry(block_idx).or_default().push(reply),
        }
        Ok(())
    }

    /// End the session. Every waiter resolves to `Cancelled(Stopped)`.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.cancel_all(CancelReason::Stopped);
        info!(document_id = %self.document_id, "Playback session stopped");
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn check_block(&self, block_idx: BlockIndex) -> PlayerResult<()> {
        if (block_idx as usize) < self.blocks.len() {
            Ok(())
        } else {
            Err(PlayerError::UnknownBlock {
                block_idx,
                block_count: self.block_count(),
            })
        }
    }

    fn is_current(&self, request: &BlockRequest) -> bool {
        request.document_id == self.document_id
            && normalize_slug(&request.model_slug) == self.model_slug
            && normalize_slug(&request.voice_slug) == self.voice_slug
    }

    fn request_for(&self, block_idx: BlockIndex) -> BlockRequest {
        BlockRequest {
            document_id: self.document_id,
            block_idx,
            model_slug: self.model_slug.clone(),
            voice_slug: self.voice_slug.clone(),
            user_id: self.user_id,
        }
    }

    /// Unconditionally mark the block queued and build its request.
    fn issue(&mut self, block_idx: BlockIndex, now: Instant) -> Command {
        let block = &mut self.blocks[block_idx as usize];
        block.status = BlockStatus::Queued;
        block.error = None;
        block.job_id = None;
        block.requested_at = Some(now);
        block.confirmed = false;
        Command::Request(self.request_for(block_idx))
    }

    fn fetch(&mut self, block_idx: BlockIndex) -> Option<Command> {
        let block = &mut self.blocks[block_idx as usize];
        let content_key = block.content_key.clone()?;
        block.fetching = true;
        Some(Command::FetchAudio {
            block_idx,
            content_key,
        })
    }

    fn mark_cached(&mut self, block_idx: BlockIndex, content_key: ContentKey) -> Vec<Command> {
        let block = &mut self.blocks[block_idx as usize];
        if block.content_key.as_ref() != Some(&content_key) {
            block.audio = None;
            block.fetching = false;
        }
        block.status = BlockStatus::Cached;
        block.content_key = Some(content_key);
        block.error = None;
        block.requested_at = None;
        block.confirmed = true;

        if let Some(audio) = block.audio.clone() {
            self.resolve(block_idx, PlaybackOutcome::Ready(audio));
            return Vec::new();
        }
        if block.fetching {
            return Vec::new();
        }
        self.fetch(block_idx).into_iter().collect()
    }

    /// Fail a pending block, re-requesting it while its retry budget lasts.
    fn fail_block(
        &mut self,
        block_idx: BlockIndex,
        kind: ErrorKind,
        message: String,
        now: Instant,
    ) -> Vec<Command> {
        let max_auto_retries = self.config.max_auto_retries;
        let block = &mut self.blocks[block_idx as usize];
        if kind.is_retryable() && block.auto_retries < max_auto_retries {
            block.auto_retries += 1;
            debug!(
                block_idx,
                kind = ?kind,
                attempt = block.auto_retries,
                message = %message,
                "Re-requesting block"
            );
            return vec![self.issue(block_idx, now)];
        }
        warn!(block_idx, kind = ?kind, message = %message, "Block failed");
        self.set_error(block_idx, kind, message);
        Vec::new()
    }

    fn set_error(&mut self, block_idx: BlockIndex, kind: ErrorKind, message: String) {
        let block = &mut self.blocks[block_idx as usize];
        let error = StatusError { kind, message };
        block.status = BlockStatus::Error;
        block.error = Some(error.clone());
        block.requested_at = None;
        block.confirmed = false;
        block.job_id = None;
        self.resolve(block_idx, outcome_for_error(&error));
    }

    fn resolve(&mut self, block_idx: BlockIndex, outcome: PlaybackOutcome) {
        if let Some(waiters) = self.waiters.remove(&block_idx) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    fn cancel_all(&mut self, reason: CancelReason) {
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(PlaybackOutcome::Cancelled(reason));
            }
        }
    }
}

fn outcome_for_error(error: &StatusError) -> PlaybackOutcome {
    match error.kind {
        ErrorKind::Timeout => PlaybackOutcome::Cancelled(CancelReason::Timeout),
        _ => PlaybackOutcome::Failed(error.clone()),
    }
}
