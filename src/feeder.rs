//! Index feeder: idempotent upsert/delete against the remote search index.
//!
//! Document ids are a deterministic function of
//! `(conversation, message, chunk_index, chunking_version)`, so re-sending a
//! write is a no-op in effect. Writes retry transient errors with backoff and
//! are capped by a concurrency limit to avoid overloading the index.
//!
//! When an edit shrinks a message's chunk count, the new documents are
//! upserted *before* the orphaned higher-indexed documents of the prior
//! revision are deleted, so the message never has a window with zero
//! retrievable content.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::backoff::RetryPolicy;
use crate::config::IndexConfig;
use crate::error::{is_transient_status, BackendFailure, PipelineError};
use crate::models::{ChunkRecord, IndexDocument, Metrics};

/// Seam to the remote search index's document API.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn upsert(&self, doc: &IndexDocument) -> Result<(), BackendFailure>;
    async fn delete(&self, doc_id: &str) -> Result<(), BackendFailure>;
    async fn health_check(&self) -> bool;
}

/// Speaks a Vespa-style document API:
/// `{endpoint}/document/v1/{namespace}/message/docid/{id}`.
pub struct HttpIndexBackend {
    client: reqwest::Client,
    feed_url_base: String,
    health_url: String,
}

impl HttpIndexBackend {
    pub fn new(config: &IndexConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let endpoint = config.endpoint.trim_end_matches('/');

        Ok(Self {
            client,
            feed_url_base: format!(
                "{}/document/v1/{}/message/docid",
                endpoint, config.namespace
            ),
            health_url: format!("{}/state/v1/health", endpoint),
        })
    }

    fn classify(status: reqwest::StatusCode, body: String) -> BackendFailure {
        let msg = format!("index error {}: {}", status, body);
        if is_transient_status(status) {
            BackendFailure::Transient(msg)
        } else {
            BackendFailure::Permanent(msg)
        }
    }
}

#[async_trait]
impl IndexBackend for HttpIndexBackend {
    async fn upsert(&self, doc: &IndexDocument) -> Result<(), BackendFailure> {
        let body = serde_json::json!({
            "fields": {
                "id": doc.id,
                "conversation_id": doc.conversation_id,
                "message_id": doc.message_id,
                "chunk_index": doc.chunk_index,
                "sender": doc.sender.as_deref().unwrap_or(""),
                "message_date": doc.message_date,
                "thread_id": doc.thread_id,
                "has_link": doc.has_link,
                "text": doc.text,
                "embedding": { "values": doc.vector },
            }
        });

        let response = self
            .client
            .post(format!("{}/{}", self.feed_url_base, doc.id))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendFailure::Transient(format!("feed request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Self::classify(
            status,
            response.text().await.unwrap_or_default(),
        ))
    }

    async fn delete(&self, doc_id: &str) -> Result<(), BackendFailure> {
        let response = self
            .client
            .delete(format!("{}/{}", self.feed_url_base, doc_id))
            .send()
            .await
            .map_err(|e| BackendFailure::Transient(format!("delete request failed: {}", e)))?;

        let status = response.status();
        // 404 counts as success: the document is already gone.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::classify(
            status,
            response.text().await.unwrap_or_default(),
        ))
    }

    async fn health_check(&self) -> bool {
        match self.client.get(&self.health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

enum WriteOp {
    Upsert(IndexDocument),
    Delete(String),
}

/// Drives index writes with bounded concurrency and per-write retries.
pub struct IndexFeeder {
    backend: Arc<dyn IndexBackend>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl IndexFeeder {
    pub fn new(
        backend: Arc<dyn IndexBackend>,
        config: &IndexConfig,
        backoff_base_ms: u64,
        backoff_max_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            policy: RetryPolicy::new(config.max_retries, backoff_base_ms, backoff_max_ms),
            metrics,
        }
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    /// Upsert the documents of a message revision, then delete prior-revision
    /// documents that no longer exist (shrunk chunk counts, version bumps).
    pub async fn sync_message(
        &self,
        docs: &[IndexDocument],
        prior: &[ChunkRecord],
    ) -> Result<(), PipelineError> {
        self.run_ops(docs.iter().cloned().map(WriteOp::Upsert).collect())
            .await?;

        let live_ids: HashSet<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        let orphans: Vec<WriteOp> = prior
            .iter()
            .filter(|rec| !live_ids.contains(rec.chunk_id.as_str()))
            .map(|rec| WriteOp::Delete(rec.chunk_id.clone()))
            .collect();

        if !orphans.is_empty() {
            self.metrics
                .deletes_issued
                .fetch_add(orphans.len() as u64, Ordering::Relaxed);
            self.run_ops(orphans).await?;
        }
        Ok(())
    }

    /// Remove every recorded chunk document for a deleted message.
    pub async fn delete_message(&self, prior: &[ChunkRecord]) -> Result<(), PipelineError> {
        let ops: Vec<WriteOp> = prior
            .iter()
            .map(|rec| WriteOp::Delete(rec.chunk_id.clone()))
            .collect();
        self.metrics
            .deletes_issued
            .fetch_add(ops.len() as u64, Ordering::Relaxed);
        self.run_ops(ops).await
    }

    /// Delete arbitrary document ids (purge pass).
    pub async fn delete_ids(&self, ids: &[String]) -> Result<(), PipelineError> {
        let ops: Vec<WriteOp> = ids.iter().cloned().map(WriteOp::Delete).collect();
        self.run_ops(ops).await
    }

    async fn run_ops(&self, ops: Vec<WriteOp>) -> Result<(), PipelineError> {
        let mut tasks: JoinSet<Result<(), PipelineError>> = JoinSet::new();

        for op in ops {
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&self.semaphore);
            let metrics = Arc::clone(&self.metrics);
            let policy = self.policy;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::Permanent("semaphore closed".to_string()))?;
                write_with_retry(backend.as_ref(), &op, policy, &metrics).await
            });
        }

        let mut first_err: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| PipelineError::Permanent(format!("feed task panicked: {}", e)))?;
            if let Err(e) = outcome {
                if first_err.is_none() || e.is_fatal() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn write_with_retry(
    backend: &dyn IndexBackend,
    op: &WriteOp,
    policy: RetryPolicy,
    metrics: &Metrics,
) -> Result<(), PipelineError> {
    let mut backoff = policy.start();

    loop {
        let result = match op {
            WriteOp::Upsert(doc) => backend.upsert(doc).await,
            WriteOp::Delete(id) => backend.delete(id).await,
        };

        match result {
            Ok(()) => {
                metrics.feed_success.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(BackendFailure::Permanent(msg)) => {
                metrics.feed_failures.fetch_add(1, Ordering::Relaxed);
                return Err(PipelineError::Permanent(msg));
            }
            Err(BackendFailure::Transient(msg)) => match backoff.next_delay() {
                Some(delay) => {
                    metrics.feed_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "index write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    metrics.feed_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(PipelineError::RetriesExhausted {
                        attempts: backoff.attempts(),
                        message: msg,
                    });
                }
            },
        }
    }
}
