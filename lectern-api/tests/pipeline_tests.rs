//! End-to-end tests of the delivery pipeline through the HTTP router.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use lectern_api::jobs::{billing_drain_task, BillingDrainConfig, BillingDrainMetrics, JobLeaseConfig};
use lectern_api::{
    create_api_router, AppState, ConsumeOutcome, MemoryUsageLedger, ServerConfig, UsageLedger,
};
use lectern_api::billing::LedgerReceipt;
use lectern_core::{
    new_entity_id, BillingError, BillingEvent, BlockStatus, JobKey, ModelCatalog, SynthesisJob,
    SynthesisOutcome, SynthesisParams, SynthesisResult, UserId,
};
use lectern_storage::{ArtifactStore, CacheConfig, LmdbArtifactCache};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{watch, Notify};
use tower::ServiceExt;

struct Harness {
    _dir: TempDir,
    state: AppState,
    app: Router,
}

fn harness() -> Harness {
    harness_with_lease(JobLeaseConfig::development())
}

fn harness_with_lease(lease: JobLeaseConfig) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let cache = LmdbArtifactCache::open(
        CacheConfig::new(dir.path()).with_flush_interval(Duration::from_secs(60)),
    )
    .expect("cache open");
    let store: Arc<dyn ArtifactStore> = Arc::new(cache);
    let catalog = ModelCatalog::builtin().expect("builtin catalog");

    let (state, results_rx) = AppState::new(
        catalog,
        store,
        64,
        256,
        BillingDrainConfig::development(),
        &lease,
    );
    state.consumer().spawn_pool(results_rx);
    let app = create_api_router(state.clone(), &ServerConfig::default());

    Harness {
        _dir: dir,
        state,
        app,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    (status, bytes.to_vec())
}

async fn call_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = call(app, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn register(app: &Router, blocks: &[&str]) -> String {
    let (status, body) = call_json(
        app,
        Method::POST,
        "/api/v1/documents",
        Some(json!({ "blocks": blocks })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["document_id"].as_str().expect("document_id").to_string()
}

fn synthesis_body(document_id: &str, block_idx: u32, voice: &str, user_id: UserId) -> Value {
    json!({
        "document_id": document_id,
        "block_idx": block_idx,
        "model_slug": "kokoro",
        "voice_slug": voice,
        "user_id": user_id,
    })
}

#[tokio::test]
async fn unsupported_voice_is_invalid_request() {
    let h = harness();
    let doc = register(&h.app, &["Hello."]).await;

    let (status, body) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "narrator", new_entity_id())),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert_eq!(h.state.jobs.outstanding(), 0);
}

#[tokio::test]
async fn unknown_block_and_document_are_not_found() {
    let h = harness();
    let doc = register(&h.app, &["Only block."]).await;

    let (status, body) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 5, "af_heart", new_entity_id())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "BLOCK_NOT_FOUND");

    let missing = new_entity_id().to_string();
    let (status, body) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&missing, 0, "af_heart", new_entity_id())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "DOCUMENT_NOT_FOUND");
}

#[tokio::test]
async fn identical_request_is_deduplicated_then_served_from_cache() {
    let h = harness();
    let doc = register(&h.app, &["The quick brown fox.", "Jumps over."]).await;
    let user = new_entity_id();

    let (status, first) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "af_heart", user)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["status"], "queued");

    // Same request again while outstanding: same job, nothing new enqueued.
    let (status, second) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "AF_HEART", user)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["job_id"], first["job_id"]);
    assert_eq!(second["content_key"], first["content_key"]);
    assert_eq!(h.state.jobs.depth("synthesis.kokoro"), 1);

    // A worker pulls the job, then the queue is empty.
    let (status, job) = call_json(&h.app, Method::GET, "/api/v1/queues/synthesis.kokoro/next", None).await;
    assert_eq!(status, StatusCode::OK);
    let job: SynthesisJob = serde_json::from_value(job).expect("job");
    let (status, _) = call(&h.app, Method::GET, "/api/v1/queues/synthesis.kokoro/next", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, processing) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "af_heart", user)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(processing["status"], "processing");

    let audio = b"RIFF\0\0\0\0WAVEfmt audio".to_vec();
    let result = SynthesisResult::for_job(
        &job,
        SynthesisOutcome::Success {
            audio: audio.clone(),
            duration_ms: 900,
        },
    );
    let (status, _) = call(
        &h.app,
        Method::POST,
        "/api/v1/results",
        Some(serde_json::to_value(&result).expect("result json")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !h.state.store.contains(&job.content_key).await.expect("contains") {
        assert!(tokio::time::Instant::now() < deadline, "result never cached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, cached) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "af_heart", user)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cached["status"], "cached");
    assert_eq!(cached["content_key"], first["content_key"]);
    assert!(cached.get("job_id").is_none());
    assert_eq!(h.state.jobs.outstanding(), 0);

    let uri = format!("/api/v1/cache/{}", job.content_key);
    let (status, bytes) = call(&h.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, audio);
    let (status, _) = call(&h.app, Method::HEAD, &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    // Billed exactly once.
    assert_eq!(h.state.billing.depth(), 1);
}

#[tokio::test]
async fn silent_worker_loses_the_job_after_its_lease() {
    let h = harness_with_lease(JobLeaseConfig {
        lease: Duration::from_millis(50),
        interval: Duration::from_millis(10),
    });
    let doc = register(&h.app, &["Nobody reports this one."]).await;
    let user = new_entity_id();

    let (_, first) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "af_heart", user)),
    )
    .await;
    let (status, _) = call(&h.app, Method::GET, "/api/v1/queues/synthesis.kokoro/next", None).await;
    assert_eq!(status, StatusCode::OK);

    // While the lease holds, a retry joins the taken job.
    let (_, joined) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "af_heart", user)),
    )
    .await;
    assert_eq!(joined["status"], "processing");
    assert_eq!(joined["job_id"], first["job_id"]);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let (status, fresh) = call_json(
        &h.app,
        Method::POST,
        "/api/v1/synthesis",
        Some(synthesis_body(&doc, 0, "af_heart", user)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(fresh["status"], "queued");
    assert_ne!(fresh["job_id"], first["job_id"]);
    assert_eq!(h.state.jobs.depth("synthesis.kokoro"), 1);
}

#[tokio::test]
async fn cache_routes_validate_keys() {
    let h = harness();
    let (status, body) = call_json(&h.app, Method::GET, "/api/v1/cache/not-a-key", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let missing = "0".repeat(64);
    let (status, body) = call_json(&h.app, Method::GET, &format!("/api/v1/cache/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ARTIFACT_NOT_FOUND");

    let (status, _) = call(&h.app, Method::HEAD, &format!("/api/v1/cache/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, Method::POST, &format!("/api/v1/cache/{}/pin", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stats) = call_json(&h.app, Method::GET, "/api/v1/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["entry_count"], 0);
}

#[tokio::test]
async fn unknown_queue_is_not_found() {
    let h = harness();
    let (status, body) = call_json(&h.app, Method::GET, "/api/v1/queues/synthesis.nope/next", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "QUEUE_NOT_FOUND");
}

#[tokio::test]
async fn models_and_health_are_served() {
    let h = harness();
    let (status, catalog) = call_json(&h.app, Method::GET, "/api/v1/models", None).await;
    assert_eq!(status, StatusCode::OK);
    let catalog: ModelCatalog = serde_json::from_value(catalog).expect("catalog");
    assert!(catalog.get("kokoro").is_some());

    let (status, bytes) = call(&h.app, Method::GET, "/health/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"pong");

    let (status, health) = call_json(&h.app, Method::GET, "/health/billing", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["details"]["queue_depth"], 0);

    let (status, _) = call(&h.app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
}

/// Ledger that never finishes a call.
struct StalledLedger {
    release: Notify,
}

#[async_trait]
impl UsageLedger for StalledLedger {
    async fn apply(&self, _: UserId, _: &[BillingEvent]) -> Result<LedgerReceipt, BillingError> {
        self.release.notified().await;
        Err(BillingError::PoolUnavailable {
            reason: "stalled".to_string(),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_of_results_completes_while_billing_is_stalled() {
    let h = harness();
    let blocks: Vec<String> = (0..40).map(|i| format!("Sentence number {}.", i)).collect();
    let block_refs: Vec<&str> = blocks.iter().map(String::as_str).collect();
    let doc = register(&h.app, &block_refs).await;
    let document_id = doc.parse().expect("uuid");
    let user = new_entity_id();

    let ledger = Arc::new(StalledLedger {
        release: Notify::new(),
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = tokio::spawn(billing_drain_task(
        Arc::clone(&h.state.billing),
        ledger.clone() as Arc<dyn UsageLedger>,
        BillingDrainConfig::development(),
        Arc::new(BillingDrainMetrics::new()),
        shutdown_rx,
    ));

    let mut subscription = h.state.notifier.subscribe(document_id);

    let mut results = Vec::new();
    for (idx, text) in blocks.iter().enumerate() {
        let key = JobKey::new(document_id, idx as u32, "kokoro", "af_heart");
        let job = SynthesisJob::new(user, &key, text.clone(), SynthesisParams::default());
        h.state.jobs.enqueue(job.clone()).expect("enqueue");
        results.push(SynthesisResult::for_job(
            &job,
            SynthesisOutcome::Success {
                audio: vec![idx as u8; 4096],
                duration_ms: 1200,
            },
        ));
    }

    let consumer = h.state.consumer();
    let burst = futures_util::future::join_all(results.into_iter().map(|result| {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.consume(result).await })
    }));
    let outcomes = tokio::time::timeout(Duration::from_secs(10), burst)
        .await
        .expect("hot path must not wait on billing");

    for outcome in outcomes {
        assert!(matches!(outcome.expect("join"), ConsumeOutcome::Cached { .. }));
    }

    let mut cached = 0;
    while cached < 40 {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .expect("status event")
            .expect("not lagged");
        assert_eq!(event.document_id, document_id);
        if event.status == BlockStatus::Cached {
            cached += 1;
        }
    }

    assert_eq!(h.state.store.stats().await.expect("stats").entry_count, 40);
    // Every billing event is still held: queued or leased by the stalled drain.
    assert_eq!(h.state.billing.depth() + h.state.billing.in_flight(), 40);

    let _ = shutdown_tx.send(true);
    ledger.release.notify_waiters();
    let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
}

#[tokio::test]
async fn billing_for_one_user_is_applied_in_enqueue_order() {
    let h = harness();
    let doc = register(&h.app, &["One.", "Two.", "Three.", "Four.", "Five."]).await;
    let document_id = doc.parse().expect("uuid");
    let user = new_entity_id();
    let consumer = h.state.consumer();

    let mut expected = Vec::new();
    for idx in 0..5u32 {
        let key = JobKey::new(document_id, idx, "kokoro", "af_heart");
        let job = SynthesisJob::new(user, &key, format!("Block {}", idx), SynthesisParams::default());
        h.state.jobs.enqueue(job.clone()).expect("enqueue");
        expected.push(job.job_id);
        let outcome = consumer
            .consume(SynthesisResult::for_job(
                &job,
                SynthesisOutcome::Success {
                    audio: vec![1; 64],
                    duration_ms: 10,
                },
            ))
            .await;
        assert!(matches!(outcome, ConsumeOutcome::Cached { .. }));
    }

    let ledger = Arc::new(MemoryUsageLedger::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = tokio::spawn(billing_drain_task(
        Arc::clone(&h.state.billing),
        ledger.clone() as Arc<dyn UsageLedger>,
        BillingDrainConfig::development(),
        Arc::new(BillingDrainMetrics::new()),
        shutdown_rx,
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ledger.history(user).await.len() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "billing never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ledger.history(user).await, expected);

    let _ = shutdown_tx.send(true);
    let _ = drain.await;
}
