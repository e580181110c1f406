//! Embedding cache and remote provider client.
//!
//! `Embedder::embed_texts` is the only path to the provider. It partitions a
//! request into cache hits (returned immediately) and misses, reserves the
//! estimated cost against the spend budget *before* any call is issued
//! (failing fast on budget exhaustion with zero spend), then embeds the
//! misses in bounded-concurrency batches with retry/backoff. Cache rows are
//! written before results are returned, so a crash after a successful call
//! never re-pays for the same content.
//!
//! The remote API is the OpenAI-style `POST /v1/embeddings` contract: the
//! response carries one vector per input, in input order, plus token usage.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry with backoff
//! - HTTP 4xx (client error, not 429) and auth failures → fail immediately
//! - Network errors → retry
//!
//! Exhausting retries fails that batch only; other in-flight batches are
//! unaffected.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::backoff::RetryPolicy;
use crate::budget::{estimate_cost, BudgetTracker};
use crate::config::EmbeddingConfig;
use crate::error::{is_transient_status, BackendFailure, PipelineError};
use crate::models::Metrics;
use crate::state::StateStore;

/// A single provider call's result: vectors aligned to request order.
#[derive(Debug)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: Option<u64>,
}

/// Seam to the remote embedding service.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, BackendFailure>;
}

/// Calls an OpenAI-compatible `/v1/embeddings` endpoint.
pub struct HttpEmbeddingBackend {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbeddingBackend {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: format!("{}/v1/embeddings", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, BackendFailure> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| BackendFailure::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| BackendFailure::Transient(format!("invalid response body: {}", e)))?;
            return parse_embeddings_response(&json);
        }

        let body_text = response.text().await.unwrap_or_default();
        if is_transient_status(status) {
            Err(BackendFailure::Transient(format!(
                "provider error {}: {}",
                status, body_text
            )))
        } else {
            Err(BackendFailure::Permanent(format!(
                "provider error {}: {}",
                status, body_text
            )))
        }
    }
}

/// Extract `data[].embedding` arrays and `usage.total_tokens`.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<EmbedResponse, BackendFailure> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| BackendFailure::Permanent("response missing data array".to_string()))?;

    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| BackendFailure::Permanent("response missing embedding".to_string()))?;
        vectors.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }

    let total_tokens = json
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64());

    Ok(EmbedResponse {
        vectors,
        total_tokens,
    })
}

/// Embedding front door: cache, budget, batching, concurrency, retries.
pub struct Embedder {
    backend: Arc<dyn EmbeddingBackend>,
    store: StateStore,
    budget: Arc<BudgetTracker>,
    metrics: Arc<Metrics>,
    semaphore: Arc<Semaphore>,
    policy: RetryPolicy,
    model: String,
    batch_size: usize,
    chunking_version: u32,
    preprocess_version: u32,
}

impl Embedder {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        store: StateStore,
        config: &EmbeddingConfig,
        chunking_version: u32,
        preprocess_version: u32,
        budget: Arc<BudgetTracker>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            store,
            budget,
            metrics,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            policy: RetryPolicy::new(
                config.max_retries,
                config.backoff_base_ms,
                config.backoff_max_ms,
            ),
            model: config.model.clone(),
            batch_size: config.batch_size,
            chunking_version,
            preprocess_version,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed `(text_hash, text)` pairs, returning a vector per hash.
    ///
    /// Duplicate hashes collapse to a single provider input; cached hashes
    /// never reach the provider at all.
    pub async fn embed_texts(
        &self,
        items: &[(String, String)],
    ) -> Result<HashMap<String, Vec<f32>>, PipelineError> {
        let mut results: HashMap<String, Vec<f32>> = HashMap::new();
        let mut misses: Vec<(String, String)> = Vec::new();

        for (hash, text) in items {
            if results.contains_key(hash) || misses.iter().any(|(h, _)| h == hash) {
                continue;
            }
            match self.store.get_cached_embedding(hash, &self.model).await? {
                Some(vector) => {
                    self.metrics.embed_cache_hits.fetch_add(1, Ordering::Relaxed);
                    results.insert(hash.clone(), vector);
                }
                None => {
                    self.metrics
                        .embed_cache_misses
                        .fetch_add(1, Ordering::Relaxed);
                    misses.push((hash.clone(), text.clone()));
                }
            }
        }

        if misses.is_empty() {
            tracing::debug!(count = items.len(), "all embeddings served from cache");
            return Ok(results);
        }

        // Budget is reserved for the whole miss set before any call goes out.
        let miss_texts: Vec<&str> = misses.iter().map(|(_, t)| t.as_str()).collect();
        let (_, est_cost) = estimate_cost(&miss_texts, &self.model);
        self.budget.reserve(est_cost)?;

        tracing::info!(
            misses = misses.len(),
            hits = results.len(),
            est_cost_usd = format!("{:.4}", est_cost),
            "embedding cache misses"
        );

        let mut tasks: JoinSet<Result<Vec<(String, Vec<f32>)>, PipelineError>> = JoinSet::new();
        for batch in misses.chunks(self.batch_size) {
            let batch = batch.to_vec();
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&self.semaphore);
            let metrics = Arc::clone(&self.metrics);
            let budget = Arc::clone(&self.budget);
            let policy = self.policy;
            let model = self.model.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::Permanent("semaphore closed".to_string()))?;
                let texts: Vec<&str> = batch.iter().map(|(_, t)| t.as_str()).collect();
                let (_, batch_cost) = estimate_cost(&texts, &model);
                let result = embed_batch(backend.as_ref(), &batch, policy, &metrics).await;
                if result.is_ok() {
                    // Only batches the provider actually served are billed.
                    metrics.add_cost(batch_cost);
                } else {
                    // This batch's share of the reservation was never paid.
                    budget.release(batch_cost);
                }
                result
            });
        }

        let mut first_err: Option<PipelineError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| PipelineError::Permanent(format!("embed task panicked: {}", e)))?;
            match outcome {
                Ok(pairs) => {
                    // Cache before returning: a crash past this point never
                    // re-pays for this content.
                    for (hash, vector) in pairs {
                        self.store
                            .cache_embedding(
                                &hash,
                                &self.model,
                                &vector,
                                self.chunking_version,
                                self.preprocess_version,
                            )
                            .await?;
                        results.insert(hash, vector);
                    }
                }
                Err(e) => {
                    if first_err.is_none() || e.is_fatal() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }

        Ok(results)
    }
}

/// Embed one batch, retrying transient failures under the policy.
async fn embed_batch(
    backend: &dyn EmbeddingBackend,
    batch: &[(String, String)],
    policy: RetryPolicy,
    metrics: &Metrics,
) -> Result<Vec<(String, Vec<f32>)>, PipelineError> {
    let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
    let mut backoff = policy.start();

    loop {
        match backend.embed(&texts).await {
            Ok(response) => {
                metrics.embed_calls.fetch_add(1, Ordering::Relaxed);
                if let Some(tokens) = response.total_tokens {
                    metrics.total_tokens.fetch_add(tokens, Ordering::Relaxed);
                }
                if response.vectors.len() != texts.len() {
                    return Err(PipelineError::Permanent(format!(
                        "provider returned {} vectors for {} inputs",
                        response.vectors.len(),
                        texts.len()
                    )));
                }
                return Ok(batch
                    .iter()
                    .map(|(h, _)| h.clone())
                    .zip(response.vectors)
                    .collect());
            }
            Err(BackendFailure::Permanent(msg)) => {
                return Err(PipelineError::Permanent(msg));
            }
            Err(BackendFailure::Transient(msg)) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "embedding batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(PipelineError::RetriesExhausted {
                        attempts: backoff.attempts(),
                        message: msg,
                    });
                }
            },
        }
    }
}
