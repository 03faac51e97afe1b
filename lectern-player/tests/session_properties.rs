//! Property tests for the playback state machine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lectern_core::{
    BlockStatus, ContentKey, ErrorKind, JobKey, ModelCatalog, StatusEvent, SynthesisParams,
};
use lectern_player::{BlockRequest, Command, PlaybackSession, RequestReceipt, SessionConfig};
use proptest::prelude::*;
use uuid::Uuid;

const BLOCKS: u32 = 8;

#[derive(Debug, Clone)]
enum Op {
    Fill,
    Advance,
    Reconnect,
    Lagged,
    Status(u32, BlockStatus),
    Ack(u32, BlockStatus),
    Audio(u32),
    Tick(u64),
}

fn op() -> impl Strategy<Value = Op> {
    let status = prop_oneof![
        Just(BlockStatus::Queued),
        Just(BlockStatus::Processing),
        Just(BlockStatus::Cached),
        Just(BlockStatus::Error),
    ];
    let ack_status = prop_oneof![
        Just(BlockStatus::Queued),
        Just(BlockStatus::Processing),
        Just(BlockStatus::Cached),
    ];
    prop_oneof![
        Just(Op::Fill),
        Just(Op::Advance),
        Just(Op::Reconnect),
        Just(Op::Lagged),
        (0..BLOCKS, status).prop_map(|(idx, s)| Op::Status(idx, s)),
        (0..BLOCKS, ack_status).prop_map(|(idx, s)| Op::Ack(idx, s)),
        (0..BLOCKS).prop_map(Op::Audio),
        (0u64..20_000).prop_map(Op::Tick),
    ]
}

fn key_for(idx: u32) -> ContentKey {
    ContentKey::derive(&format!("block {}", idx), "kokoro", "af_heart", &SynthesisParams::default())
}

fn new_session(max_in_flight: usize, max_auto_retries: u32) -> PlaybackSession {
    let catalog = ModelCatalog::builtin().expect("catalog");
    PlaybackSession::open(
        &catalog,
        Uuid::now_v7(),
        BLOCKS,
        Uuid::now_v7(),
        "kokoro",
        Some("af_heart"),
        SessionConfig {
            buffer_ahead: 4,
            max_in_flight,
            block_timeout: Duration::from_secs(5),
            max_auto_retries,
        },
    )
    .expect("session")
}

fn apply(session: &mut PlaybackSession, op: &Op, now: &mut Instant) -> Vec<Command> {
    match op {
        Op::Fill => session.fill(*now),
        Op::Advance => session.advance(*now),
        Op::Reconnect => {
            session.on_reconnecting(1);
            session.on_connected(*now)
        }
        Op::Lagged => session.on_lagged(3, *now),
        Op::Status(idx, status) => {
            let key = JobKey::new(session.document_id(), *idx, "kokoro", "af_heart");
            let event = match status {
                BlockStatus::Cached => StatusEvent::cached(&key, key_for(*idx)),
                BlockStatus::Error => {
                    StatusEvent::failed(&key, ErrorKind::TransientWorkerFailure, "worker died")
                }
                other => StatusEvent::new(&key, *other),
            };
            session.apply_status(&event, *now)
        }
        Op::Ack(idx, status) => {
            let request = BlockRequest {
                document_id: session.document_id(),
                block_idx: *idx,
                model_slug: "kokoro".to_string(),
                voice_slug: "af_heart".to_string(),
                user_id: Uuid::nil(),
            };
            let receipt = RequestReceipt {
                status: *status,
                content_key: key_for(*idx),
                voice_slug: "af_heart".to_string(),
                job_id: None,
            };
            session.on_request_ack(&request, receipt, *now)
        }
        Op::Audio(idx) => {
            session.audio_fetched(*idx, &key_for(*idx), vec![*idx as u8; 4]);
            Vec::new()
        }
        Op::Tick(ms) => {
            *now += Duration::from_millis(*ms);
            session.tick(*now)
        }
    }
}

proptest! {
    #[test]
    fn in_flight_never_exceeds_bound(
        max_in_flight in 1usize..4,
        retries in 0u32..3,
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let mut session = new_session(max_in_flight, retries);
        let mut now = Instant::now();
        for op in &ops {
            let commands = apply(&mut session, op, &mut now);
            prop_assert!(session.in_flight() <= max_in_flight, "after {:?}", op);

            let mut seen = HashSet::new();
            for command in &commands {
                if let Command::Request(request) = command {
                    prop_assert!(seen.insert(request.block_idx), "duplicate request in {:?}", op);
                    prop_assert_eq!(session.status(request.block_idx), Some(BlockStatus::Queued));
                }
            }
        }
    }

    #[test]
    fn reconnect_keeps_local_audio(
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let mut session = new_session(3, 1);
        let mut now = Instant::now();
        for op in &ops {
            apply(&mut session, op, &mut now);
        }

        let before: Vec<Option<Arc<Vec<u8>>>> = (0..BLOCKS)
            .map(|idx| session.block(idx).and_then(|b| b.audio.clone()))
            .collect();
        let pending_before: Vec<bool> = (0..BLOCKS)
            .map(|idx| session.status(idx).is_some_and(|s| s.is_pending()))
            .collect();

        session.on_reconnecting(1);
        let commands = session.on_connected(now);

        for idx in 0..BLOCKS {
            let after = session.block(idx).and_then(|b| b.audio.clone());
            match (&before[idx as usize], &after) {
                (Some(a), Some(b)) => prop_assert!(Arc::ptr_eq(a, b)),
                (None, None) => {}
                (a, b) => prop_assert!(false, "block {} audio changed: {:?} -> {:?}", idx, a.is_some(), b.is_some()),
            }
            if before[idx as usize].is_some() {
                prop_assert_eq!(session.status(idx), Some(BlockStatus::Cached));
            }
        }

        // Previously pending blocks are either re-requested or idle.
        for idx in 0..BLOCKS {
            if pending_before[idx as usize] {
                let requested = commands
                    .iter()
                    .any(|c| matches!(c, Command::Request(r) if r.block_idx == idx));
                let status = session.status(idx);
                prop_assert!(
                    (requested && status == Some(BlockStatus::Queued)) || status == Some(BlockStatus::Idle),
                    "block {} left as {:?}", idx, status
                );
            }
        }
    }

    #[test]
    fn retry_always_lands_in_queued(
        ops in prop::collection::vec(op(), 0..40),
        target in 0..BLOCKS,
    ) {
        let mut session = new_session(3, 0);
        let mut now = Instant::now();
        for op in &ops {
            apply(&mut session, op, &mut now);
        }
        let commands = session.retry(target, now).expect("retry");
        prop_assert_eq!(session.status(target), Some(BlockStatus::Queued));
        prop_assert!(matches!(commands.as_slice(), [Command::Request(r)] if r.block_idx == target));

        // A late error from before the retry never wins.
        let key = JobKey::new(session.document_id(), target, "kokoro", "af_heart");
        session.apply_status(
            &StatusEvent::failed(&key, ErrorKind::TransientWorkerFailure, "stale"),
            now,
        );
        prop_assert_eq!(session.status(target), Some(BlockStatus::Queued));
    }
}
