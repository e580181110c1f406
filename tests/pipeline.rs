//! End-to-end pipeline tests over a temporary SQLite database, a JSONL
//! archive directory, and in-memory fakes for the embedding provider and
//! the search index.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use tokio::sync::Notify;

use chatsync::budget::BudgetTracker;
use chatsync::config::{
    ChunkingConfig, Config, DaemonConfig, DbConfig, EmbeddingConfig, IndexConfig, SourceConfig,
};
use chatsync::daemon::{drain_conversation, ConversationWork};
use chatsync::embedder::{EmbedResponse, Embedder, EmbeddingBackend};
use chatsync::error::{BackendFailure, PipelineError};
use chatsync::feeder::{IndexBackend, IndexFeeder};
use chatsync::models::{IndexDocument, Metrics};
use chatsync::pipeline::{MessageOutcome, Pipeline, SyncOptions};
use chatsync::source::JsonlSource;
use chatsync::state::StateStore;
use chatsync::{db, migrate};

/// Embedding provider fake: deterministic vectors, call counters, and two
/// failure knobs (fail the first N calls, or fail while a marker substring
/// appears in any input).
struct FakeEmbedder {
    calls: AtomicU64,
    inputs: AtomicU64,
    fail_remaining: AtomicU64,
    fail_marker: Mutex<Option<String>>,
}

impl FakeEmbedder {
    fn new(fail_times: u64) -> Self {
        Self {
            calls: AtomicU64::new(0),
            inputs: AtomicU64::new(0),
            fail_remaining: AtomicU64::new(fail_times),
            fail_marker: Mutex::new(None),
        }
    }

    fn set_marker(&self, marker: &str) {
        *self.fail_marker.lock().unwrap() = Some(marker.to_string());
    }

    fn clear_marker(&self) {
        *self.fail_marker.lock().unwrap() = None;
    }
}

#[async_trait]
impl EmbeddingBackend for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(marker) = self.fail_marker.lock().unwrap().as_deref() {
            if texts.iter().any(|t| t.contains(marker)) {
                return Err(BackendFailure::Transient("injected failure".to_string()));
            }
        }
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendFailure::Transient("503 service unavailable".to_string()));
        }

        self.inputs.fetch_add(texts.len() as u64, Ordering::SeqCst);
        Ok(EmbedResponse {
            vectors: texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 2.0, 3.0])
                .collect(),
            total_tokens: Some(texts.len() as u64 * 8),
        })
    }
}

/// Embedding fake that parks inside `embed` until released, for driving two
/// writers into a deterministic interleaving.
struct GatedEmbedder {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl EmbeddingBackend for GatedEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, BackendFailure> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(EmbedResponse {
            vectors: texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 2.0, 3.0])
                .collect(),
            total_tokens: None,
        })
    }
}

/// Index fake: an in-memory document map with write counters.
#[derive(Default)]
struct FakeIndex {
    docs: Mutex<HashMap<String, String>>,
    upserts: AtomicU64,
    deletes: AtomicU64,
}

impl FakeIndex {
    fn docs_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .docs
            .lock()
            .unwrap()
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl IndexBackend for FakeIndex {
    async fn upsert(&self, doc: &IndexDocument) -> Result<(), BackendFailure> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap()
            .insert(doc.id.clone(), doc.text.clone());
        Ok(())
    }

    async fn delete(&self, doc_id: &str) -> Result<(), BackendFailure> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.docs.lock().unwrap().remove(doc_id);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct HarnessOpts {
    budget_usd: f64,
    target_tokens: usize,
    max_retries: u32,
    fail_times: u64,
}

impl Default for HarnessOpts {
    fn default() -> Self {
        Self {
            budget_usd: 0.0,
            target_tokens: 64,
            max_retries: 3,
            fail_times: 0,
        }
    }
}

struct Harness {
    _dir: TempDir,
    archive: PathBuf,
    pipeline: Pipeline,
    source: JsonlSource,
    store: StateStore,
    embed_backend: Arc<FakeEmbedder>,
    index_backend: Arc<FakeIndex>,
}

async fn harness(opts: HarnessOpts) -> Harness {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("archive");
    std::fs::create_dir(&archive).unwrap();

    let config = Config {
        db: DbConfig {
            path: dir.path().join("state.sqlite"),
        },
        source: SourceConfig {
            root: archive.clone(),
            poll_interval_secs: 1,
        },
        chunking: ChunkingConfig {
            target_tokens: opts.target_tokens,
            ..ChunkingConfig::default()
        },
        embedding: EmbeddingConfig {
            endpoint: "http://unused".to_string(),
            model: "fake-embed".to_string(),
            dims: 4,
            batch_size: 16,
            concurrency: 2,
            daily_budget_usd: opts.budget_usd,
            max_retries: opts.max_retries,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            timeout_secs: 5,
            api_key_env: "UNUSED_KEY".to_string(),
        },
        index: IndexConfig {
            endpoint: "http://unused".to_string(),
            namespace: "test".to_string(),
            concurrency: 2,
            max_retries: opts.max_retries,
            timeout_secs: 5,
        },
        daemon: DaemonConfig::default(),
    };

    let pool = db::connect(&config.db.path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = StateStore::new(pool);

    let embed_backend = Arc::new(FakeEmbedder::new(opts.fail_times));
    let index_backend = Arc::new(FakeIndex::default());
    let metrics = Arc::new(Metrics::default());

    let embedder = Embedder::new(
        Arc::clone(&embed_backend) as Arc<dyn EmbeddingBackend>,
        store.clone(),
        &config.embedding,
        config.chunking.chunking_version,
        config.chunking.preprocess_version,
        Arc::new(BudgetTracker::new(opts.budget_usd)),
        Arc::clone(&metrics),
    );
    let feeder = IndexFeeder::new(
        Arc::clone(&index_backend) as Arc<dyn IndexBackend>,
        &config.index,
        config.embedding.backoff_base_ms,
        config.embedding.backoff_max_ms,
        Arc::clone(&metrics),
    );

    let source = JsonlSource::new(&config.source);
    let pipeline = Pipeline::new(config, store.clone(), embedder, feeder, metrics);

    Harness {
        _dir: dir,
        archive,
        pipeline,
        source,
        store,
        embed_backend,
        index_backend,
    }
}

fn append_events(archive: &Path, conversation_id: &str, events: &[serde_json::Value]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(archive.join(format!("{}.jsonl", conversation_id)))
        .unwrap();
    for event in events {
        writeln!(file, "{}", event).unwrap();
    }
}

fn msg(message_id: i64, timestamp: i64, text: &str) -> serde_json::Value {
    serde_json::json!({
        "conversation_id": "c1",
        "message_id": message_id,
        "timestamp": timestamp,
        "sender": "alice",
        "raw_text": text,
    })
}

fn event(value: serde_json::Value) -> chatsync::models::MessageEvent {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let h = harness(HarnessOpts::default()).await;
    append_events(
        &h.archive,
        "c1",
        &[
            msg(1, 1_700_000_000, "the quarterly numbers look solid"),
            msg(2, 1_700_000_060, "agreed, shipping the report tomorrow"),
        ],
    );

    let opts = SyncOptions::default();
    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &opts)
        .await
        .unwrap();
    assert_eq!(report.indexed, 2);

    let calls = h.embed_backend.calls.load(Ordering::SeqCst);
    let upserts = h.index_backend.upserts.load(Ordering::SeqCst);
    assert!(calls > 0);
    assert!(upserts > 0);

    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &opts)
        .await
        .unwrap();
    assert_eq!(report.indexed, 0);
    assert_eq!(h.embed_backend.calls.load(Ordering::SeqCst), calls);
    assert_eq!(h.index_backend.upserts.load(Ordering::SeqCst), upserts);

    let state = h.store.get_state("c1").await.unwrap().unwrap();
    assert_eq!(state.last_message_id, Some(2));
}

#[tokio::test]
async fn test_identical_text_embeds_once() {
    let h = harness(HarnessOpts::default()).await;
    // Same sender, timestamp, and text: the composed chunk text is identical
    // for both messages, so the second one is served from the cache.
    append_events(
        &h.archive,
        "c1",
        &[
            msg(1, 1_700_000_000, "lunch at noon?"),
            msg(2, 1_700_000_000, "lunch at noon?"),
        ],
    );

    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.indexed, 2);
    assert_eq!(h.embed_backend.inputs.load(Ordering::SeqCst), 1);
    // Distinct document ids even though the vectors are shared.
    assert_eq!(h.index_backend.docs_with_prefix("c1:").len(), 2);
}

#[tokio::test]
async fn test_budget_exceeded_before_any_call() {
    let h = harness(HarnessOpts {
        budget_usd: 0.000_000_1,
        ..HarnessOpts::default()
    })
    .await;
    append_events(&h.archive, "c1", &[msg(1, 1_700_000_000, &"word ".repeat(200))]);

    let err = h
        .pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::BudgetExceeded { .. }));
    assert_eq!(h.embed_backend.calls.load(Ordering::SeqCst), 0);
    assert!(h.index_backend.docs_with_prefix("c1:").is_empty());
}

#[tokio::test]
async fn test_edit_shrinking_chunks_removes_orphans() {
    let h = harness(HarnessOpts {
        target_tokens: 16,
        ..HarnessOpts::default()
    })
    .await;
    let long_text = "we should walk through the migration plan step by step before \
        anyone touches production, because the rollback story is still not written \
        down anywhere and that has burned us before on much smaller changes";
    append_events(&h.archive, "c1", &[msg(1, 1_700_000_000, long_text)]);

    h.pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    let before = h.index_backend.docs_with_prefix("c1:1:");
    assert!(before.len() > 1, "expected multiple chunks, got {:?}", before);

    // Edits reach the pipeline through the live feed or a sweep, not the
    // cursor-based fetch.
    let mut edit = msg(1, 1_700_000_100, "migration plan approved");
    edit["edit_revision"] = serde_json::json!(1);
    let outcome = h.pipeline.process_message(&event(edit), None, false).await.unwrap();
    assert_eq!(outcome, MessageOutcome::Indexed(1));

    let after = h.index_backend.docs_with_prefix("c1:1:");
    assert_eq!(after, vec!["c1:1:0:v1".to_string()]);
    let mirror = h.store.get_message_chunks("c1", 1).await.unwrap();
    assert_eq!(mirror.len(), 1);
}

#[tokio::test]
async fn test_edit_to_empty_tears_down_documents() {
    let h = harness(HarnessOpts::default()).await;
    append_events(&h.archive, "c1", &[msg(1, 1_700_000_000, "soon to vanish")]);
    h.pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(h.index_backend.docs_with_prefix("c1:1:").len(), 1);

    let mut edit = msg(1, 1_700_000_100, "");
    edit["edit_revision"] = serde_json::json!(1);
    let outcome = h.pipeline.process_message(&event(edit), None, false).await.unwrap();
    assert_eq!(outcome, MessageOutcome::Empty);
    assert!(h.index_backend.docs_with_prefix("c1:1:").is_empty());
    assert!(h.store.get_message_chunks("c1", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_then_purge() {
    let h = harness(HarnessOpts::default()).await;
    let old_ts = chrono::Utc::now().timestamp() - 100 * 86_400;
    append_events(&h.archive, "c1", &[msg(1, old_ts, "this will be deleted")]);
    h.pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(h.index_backend.docs_with_prefix("c1:1:").len(), 1);

    let mut deletion = msg(1, old_ts + 60, "");
    deletion["deleted"] = serde_json::json!(true);
    let outcome = h
        .pipeline
        .process_message(&event(deletion), None, false)
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Deleted);
    assert!(h.index_backend.docs_with_prefix("c1:1:").is_empty());

    // The deletion happened well past the 30-day retention window, so the
    // purge pass drops the mirror rows too.
    let purged = h.pipeline.purge().await.unwrap();
    assert_eq!(purged, 1);
    assert!(h.store.get_message_chunks("c1", 1).await.unwrap().is_empty());

    // A second purge finds nothing.
    assert_eq!(h.pipeline.purge().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_failures_retry_then_cache() {
    let h = harness(HarnessOpts {
        fail_times: 3,
        ..HarnessOpts::default()
    })
    .await;
    append_events(&h.archive, "c1", &[msg(1, 1_700_000_000, "flaky network day")]);

    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.failed, 0);
    // Three injected 503s, then the call that succeeded.
    assert_eq!(h.embed_backend.calls.load(Ordering::SeqCst), 4);

    let mirror = h.store.get_message_chunks("c1", 1).await.unwrap();
    assert_eq!(mirror.len(), 1);
    let cached = h
        .store
        .get_cached_embedding(&mirror[0].text_hash, "fake-embed")
        .await
        .unwrap();
    assert!(cached.is_some());
}

#[tokio::test]
async fn test_failed_message_defers_cursor() {
    let h = harness(HarnessOpts {
        max_retries: 0,
        ..HarnessOpts::default()
    })
    .await;
    h.embed_backend.set_marker("FAILME");
    append_events(
        &h.archive,
        "c1",
        &[
            msg(1, 1_700_000_000, "fine"),
            msg(2, 1_700_000_060, "FAILME please"),
            msg(3, 1_700_000_120, "also fine"),
        ],
    );

    let opts = SyncOptions::default();
    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &opts)
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.failed, 1);

    // The cursor stops before the failed message; message 3 waits its turn.
    let state = h.store.get_state("c1").await.unwrap().unwrap();
    assert_eq!(state.last_message_id, Some(1));
    assert!(h.index_backend.docs_with_prefix("c1:3:").is_empty());

    h.embed_backend.clear_marker();
    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &opts)
        .await
        .unwrap();
    assert_eq!(report.indexed, 2);
    let state = h.store.get_state("c1").await.unwrap().unwrap();
    assert_eq!(state.last_message_id, Some(3));
}

#[tokio::test]
async fn test_malformed_message_does_not_wedge_cursor() {
    let h = harness(HarnessOpts::default()).await;
    append_events(
        &h.archive,
        "c1",
        &[
            msg(-5, 1_700_000_000, "corrupt export row"),
            msg(1, 1_700_000_060, "healthy message"),
        ],
    );

    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.indexed, 1);

    // The corrupt row never becomes processable, so the cursor moves past it.
    let state = h.store.get_state("c1").await.unwrap().unwrap();
    assert_eq!(state.last_message_id, Some(1));
}

#[tokio::test]
async fn test_stale_revision_is_skipped() {
    let h = harness(HarnessOpts::default()).await;

    let mut edited = msg(1, 1_700_000_000, "the corrected text");
    edited["edit_revision"] = serde_json::json!(1);
    let outcome = h
        .pipeline
        .process_message(&event(edited), None, false)
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Indexed(1));

    // The original (revision 0) arrives late and must not clobber the edit.
    let stale = msg(1, 1_700_000_000, "teh original tpyo");
    let outcome = h
        .pipeline
        .process_message(&event(stale), None, false)
        .await
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Skipped);

    let docs = h.index_backend.docs.lock().unwrap();
    let text = docs.get("c1:1:0:v1").unwrap();
    assert!(text.contains("corrected"));
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let h = harness(HarnessOpts::default()).await;
    append_events(&h.archive, "c1", &[msg(1, 1_700_000_000, "estimate me")]);

    let opts = SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    };
    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &opts)
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert!(report.est_tokens > 0);
    assert_eq!(h.embed_backend.calls.load(Ordering::SeqCst), 0);
    assert!(h.index_backend.docs_with_prefix("c1:").is_empty());
    assert!(h.store.get_state("c1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_live_edit_applies_without_waiting_for_sweep() {
    let h = harness(HarnessOpts::default()).await;
    append_events(&h.archive, "c1", &[msg(1, 1_700_000_000, "original wording")]);
    h.pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();

    // A live edit arrives for a message the cursor already passed; the
    // cursor-based fetch would filter it out, so the worker applies the
    // event payload directly.
    let mut edit = msg(1, 1_700_000_050, "revised wording");
    edit["edit_revision"] = serde_json::json!(1);
    append_events(&h.archive, "c1", &[edit.clone()]);

    let work = ConversationWork {
        events: vec![event(edit)],
        ..ConversationWork::default()
    };
    let report = drain_conversation(&h.pipeline, &h.source, "c1", work)
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);

    let docs = h.index_backend.docs.lock().unwrap();
    assert!(docs.get("c1:1:0:v1").unwrap().contains("revised"));
    drop(docs);

    // Same path for a live deletion.
    let mut deletion = msg(1, 1_700_000_100, "");
    deletion["deleted"] = serde_json::json!(true);
    let work = ConversationWork {
        events: vec![event(deletion)],
        ..ConversationWork::default()
    };
    let report = drain_conversation(&h.pipeline, &h.source, "c1", work)
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);
    assert!(h.index_backend.docs_with_prefix("c1:1:").is_empty());
}

#[tokio::test]
async fn test_slow_writer_cannot_clobber_newer_revision() {
    let h = harness(HarnessOpts::default()).await;

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let gated = Arc::new(GatedEmbedder {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
    });

    // A second pipeline over the same store and index, with an embedder that
    // parks mid-call.
    let config = h.pipeline.config().clone();
    let metrics = Arc::new(Metrics::default());
    let embedder = Embedder::new(
        gated as Arc<dyn EmbeddingBackend>,
        h.store.clone(),
        &config.embedding,
        config.chunking.chunking_version,
        config.chunking.preprocess_version,
        Arc::new(BudgetTracker::new(0.0)),
        Arc::clone(&metrics),
    );
    let feeder = IndexFeeder::new(
        Arc::clone(&h.index_backend) as Arc<dyn IndexBackend>,
        &config.index,
        config.embedding.backoff_base_ms,
        config.embedding.backoff_max_ms,
        Arc::clone(&metrics),
    );
    let slow = Arc::new(Pipeline::new(
        config,
        h.store.clone(),
        embedder,
        feeder,
        metrics,
    ));

    // The slow writer starts on revision 0 and parks inside the provider call.
    let stale = event(msg(1, 1_700_000_000, "original wording"));
    let slow_task = tokio::spawn({
        let slow = Arc::clone(&slow);
        async move { slow.process_message(&stale, None, false).await }
    });
    entered.notified().await;

    // Revision 1 lands while revision 0 is still embedding.
    let mut edit = msg(1, 1_700_000_000, "revised wording");
    edit["edit_revision"] = serde_json::json!(1);
    h.pipeline
        .process_message(&event(edit), None, false)
        .await
        .unwrap();

    release.notify_one();
    let outcome = slow_task.await.unwrap().unwrap();
    assert_eq!(outcome, MessageOutcome::Skipped);

    let docs = h.index_backend.docs.lock().unwrap();
    assert!(docs.get("c1:1:0:v1").unwrap().contains("revised"));
}

#[tokio::test]
async fn test_failed_batch_is_not_billed() {
    let h = harness(HarnessOpts {
        max_retries: 0,
        ..HarnessOpts::default()
    })
    .await;
    h.embed_backend.set_marker("FAILME");
    append_events(
        &h.archive,
        "c1",
        &[msg(1, 1_700_000_000, &format!("FAILME {}", "word ".repeat(40)))],
    );

    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.pipeline.metrics().cost_usd(), 0.0);

    h.embed_backend.clear_marker();
    let report = h
        .pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(report.indexed, 1);
    assert!(h.pipeline.metrics().cost_usd() > 0.0);
}

#[tokio::test]
async fn test_sweep_resolves_reply_context_outside_window() {
    let h = harness(HarnessOpts::default()).await;
    let now = chrono::Utc::now().timestamp();
    // The parent sits outside the 7-day sweep window.
    append_events(
        &h.archive,
        "c1",
        &[msg(1, now - 10 * 86_400, "does thursday work for the offsite")],
    );
    h.pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();

    // The reply lands in the archive without a live event.
    let mut reply = msg(2, now - 60, "thursday works");
    reply["reply_to_id"] = serde_json::json!(1);
    append_events(&h.archive, "c1", &[reply]);

    h.pipeline.sweep(&h.source).await.unwrap();

    let docs = h.index_backend.docs.lock().unwrap();
    let text = docs.get("c1:2:0:v1").unwrap();
    assert!(text.contains("thursday works"));
    assert!(text.contains("does thursday work"), "reply context missing: {}", text);
}

#[tokio::test]
async fn test_sweep_reconciles_missed_edit() {
    let h = harness(HarnessOpts::default()).await;
    let now = chrono::Utc::now().timestamp();
    append_events(&h.archive, "c1", &[msg(1, now - 60, "first draft")]);
    h.pipeline
        .process_conversation(&h.source, "c1", &SyncOptions::default())
        .await
        .unwrap();

    // An edit lands in the archive without a live event; the cursor-based
    // fetch would never see it.
    let mut edit = msg(1, now, "final draft");
    edit["edit_revision"] = serde_json::json!(1);
    append_events(&h.archive, "c1", &[edit]);

    h.pipeline.sweep(&h.source).await.unwrap();

    let docs = h.index_backend.docs.lock().unwrap();
    assert!(docs.get("c1:1:0:v1").unwrap().contains("final draft"));
    drop(docs);

    let state = h.store.get_state("c1").await.unwrap().unwrap();
    assert!(state.last_swept_at.is_some());
}
