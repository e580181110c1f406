//! Orchestration of the sync pipeline.
//!
//! A batch for one conversation runs FETCH -> PROCESS -> COMMIT: events come
//! off the source in order, each message flows through normalize -> chunk ->
//! embed -> feed, and the cursor only advances after the index writes for
//! the processed prefix are confirmed. A crash mid-batch therefore re-fetches
//! from the last committed cursor, and idempotent document ids make the
//! replay harmless.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::budget::estimate_cost;
use crate::chunk::chunk_message;
use crate::config::Config;
use crate::embedder::Embedder;
use crate::error::PipelineError;
use crate::feeder::IndexFeeder;
use crate::models::{ChunkRecord, IndexDocument, MessageEvent, Metrics};
use crate::normalize::{bounded_reply_context, create_header, normalize};
use crate::source::SourceAdapter;
use crate::state::StateStore;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Ignore saved cursors and re-walk full history.
    pub full: bool,
    /// Only process messages newer than this many days.
    pub since_days: Option<u32>,
    /// Cap on messages per conversation.
    pub limit: Option<usize>,
    /// Estimate work and cost without embedding or feeding anything.
    pub dry_run: bool,
}

#[derive(Debug, PartialEq)]
pub enum MessageOutcome {
    /// Chunks embedded and fed; mirror rows replaced.
    Indexed(usize),
    /// Stored revision is at least as new as the event.
    Skipped,
    /// Deletion propagated to the index.
    Deleted,
    /// Text normalized to nothing; any prior documents were removed.
    Empty,
}

#[derive(Debug, Default)]
pub struct ConversationReport {
    pub scanned: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
    pub chunks: usize,
    pub est_tokens: u64,
    pub est_cost_usd: f64,
}

impl ConversationReport {
    pub fn absorb(&mut self, other: &ConversationReport) {
        self.scanned += other.scanned;
        self.indexed += other.indexed;
        self.skipped += other.skipped;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.chunks += other.chunks;
        self.est_tokens += other.est_tokens;
        self.est_cost_usd += other.est_cost_usd;
    }
}

/// Map `message_id -> raw_text` for resolving reply context.
pub(crate) fn reply_texts(events: &[MessageEvent]) -> HashMap<i64, String> {
    events
        .iter()
        .filter(|e| !e.deleted && !e.raw_text.is_empty())
        .map(|e| (e.message_id, e.raw_text.clone()))
        .collect()
}

pub struct Pipeline {
    config: Config,
    store: StateStore,
    embedder: Embedder,
    feeder: IndexFeeder,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: StateStore,
        embedder: Embedder,
        feeder: IndexFeeder,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            feeder,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one message event through the pipeline.
    ///
    /// `force` bypasses the revision check, used when a chunking or
    /// preprocessing version bump requires re-indexing unchanged messages.
    pub async fn process_message(
        &self,
        event: &MessageEvent,
        reply_text: Option<&str>,
        force: bool,
    ) -> Result<MessageOutcome, PipelineError> {
        self.metrics.messages_scanned.fetch_add(1, Ordering::Relaxed);

        if event.message_id < 0 || event.timestamp < 0 {
            return Err(PipelineError::MalformedInput(format!(
                "message {} in {} has invalid id or timestamp",
                event.message_id, event.conversation_id
            )));
        }

        if event.deleted {
            let prior = self
                .store
                .get_message_chunks(&event.conversation_id, event.message_id)
                .await?;
            if !prior.is_empty() {
                self.feeder.delete_message(&prior).await?;
            }
            self.store
                .mark_message_deleted(&event.conversation_id, event.message_id, event.timestamp)
                .await?;
            return Ok(MessageOutcome::Deleted);
        }

        if !force {
            let stored = self
                .store
                .max_edit_revision(&event.conversation_id, event.message_id)
                .await?;
            if stored.is_some_and(|rev| rev >= event.edit_revision) {
                self.metrics.messages_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(MessageOutcome::Skipped);
            }
        }

        let normalized = normalize(&event.raw_text);
        let header = create_header(event.sender.as_deref(), event.timestamp);
        let reply_context = reply_text.and_then(|raw| {
            bounded_reply_context(&normalize(raw).text, self.config.chunking.reply_context_tokens)
        });

        let chunks = chunk_message(
            &self.config.chunking,
            self.embedder.model(),
            &event.conversation_id,
            event.message_id,
            event.thread_id,
            &normalized.text,
            normalized.has_link,
            &header,
            reply_context.as_deref(),
        );

        let prior = self
            .store
            .get_message_chunks(&event.conversation_id, event.message_id)
            .await?;

        // An edit down to nothing leaves zero chunks: tear down any prior
        // documents instead of feeding.
        if chunks.is_empty() {
            if !prior.is_empty() {
                self.feeder.delete_message(&prior).await?;
                self.store
                    .replace_message_chunks(&event.conversation_id, event.message_id, &[])
                    .await?;
            }
            return Ok(MessageOutcome::Empty);
        }

        let items: Vec<(String, String)> = chunks
            .iter()
            .map(|c| (c.text_hash.clone(), c.text.clone()))
            .collect();
        let vectors = self.embedder.embed_texts(&items).await?;

        let mut docs = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let vector = vectors.get(&chunk.text_hash).cloned().ok_or_else(|| {
                PipelineError::Permanent(format!("no embedding returned for {}", chunk.doc_id()))
            })?;
            docs.push(IndexDocument {
                id: chunk.doc_id(),
                conversation_id: chunk.conversation_id.clone(),
                message_id: chunk.message_id,
                chunk_index: chunk.chunk_index,
                sender: event.sender.clone(),
                message_date: event.timestamp,
                thread_id: chunk.thread_id,
                has_link: chunk.has_link,
                text: chunk.text.clone(),
                vector,
            });
        }

        // A concurrent writer may have committed a newer revision while this
        // one was embedding. Re-check right before the index write so stale
        // chunks are discarded instead of committed.
        if !force {
            let stored = self
                .store
                .max_edit_revision(&event.conversation_id, event.message_id)
                .await?;
            if stored.is_some_and(|rev| rev >= event.edit_revision) {
                self.metrics.messages_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(MessageOutcome::Skipped);
            }
        }

        // New documents land before prior-revision orphans are deleted.
        self.feeder.sync_message(&docs, &prior).await?;

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .map(|chunk| ChunkRecord {
                chunk_id: chunk.doc_id(),
                conversation_id: chunk.conversation_id.clone(),
                message_id: chunk.message_id,
                chunk_index: chunk.chunk_index,
                edit_revision: event.edit_revision,
                text_hash: chunk.text_hash.clone(),
                message_date: event.timestamp,
                deleted_at: None,
                sender: event.sender.clone(),
                thread_id: chunk.thread_id,
                has_link: chunk.has_link,
            })
            .collect();
        self.store
            .replace_message_chunks(&event.conversation_id, event.message_id, &records)
            .await?;

        self.metrics.messages_indexed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .chunks_written
            .fetch_add(docs.len() as u64, Ordering::Relaxed);
        Ok(MessageOutcome::Indexed(docs.len()))
    }

    /// Sync one conversation: fetch events past the cursor, process them in
    /// order, and commit the new cursor for the successfully processed
    /// prefix.
    pub async fn process_conversation(
        &self,
        source: &dyn SourceAdapter,
        conversation_id: &str,
        opts: &SyncOptions,
    ) -> Result<ConversationReport, PipelineError> {
        let state = self.store.get_state(conversation_id).await?;

        // A version bump invalidates every stored chunk id, so the whole
        // history is re-walked and the revision check is bypassed.
        let version_changed = state.as_ref().is_some_and(|s| {
            s.chunking_version != self.config.chunking.chunking_version
                || s.preprocess_version != self.config.chunking.preprocess_version
        });

        let cursor = if opts.full || version_changed {
            None
        } else {
            state.as_ref().and_then(|s| s.last_message_id)
        };

        let mut events = source
            .fetch_since(conversation_id, cursor)
            .await
            .map_err(|e| PipelineError::Source(e.to_string()))?;

        if let Some(days) = opts.since_days {
            let cutoff = chrono::Utc::now().timestamp() - days as i64 * SECONDS_PER_DAY;
            events.retain(|e| e.timestamp >= cutoff);
        }
        if let Some(limit) = opts.limit {
            events.truncate(limit);
        }

        let reply_lookup = reply_texts(&events);

        if opts.dry_run {
            return Ok(self.estimate_conversation(&events));
        }

        let mut report = ConversationReport::default();
        let mut last_ok: Option<i64> = None;

        for event in &events {
            let reply_text = event
                .reply_to_id
                .and_then(|id| reply_lookup.get(&id))
                .map(String::as_str);
            report.scanned += 1;

            match self.process_message(event, reply_text, version_changed).await {
                Ok(MessageOutcome::Indexed(n)) => {
                    report.indexed += 1;
                    report.chunks += n;
                    last_ok = Some(event.message_id);
                }
                Ok(MessageOutcome::Skipped) => {
                    report.skipped += 1;
                    last_ok = Some(event.message_id);
                }
                Ok(MessageOutcome::Deleted) => {
                    report.deleted += 1;
                    last_ok = Some(event.message_id);
                }
                Ok(MessageOutcome::Empty) => {
                    report.skipped += 1;
                    last_ok = Some(event.message_id);
                }
                Err(PipelineError::MalformedInput(msg)) => {
                    // A corrupt message never becomes processable; skip past
                    // it rather than wedging the cursor.
                    tracing::warn!(
                        conversation = conversation_id,
                        message_id = event.message_id,
                        error = %msg,
                        "skipping malformed message"
                    );
                    report.failed += 1;
                    self.metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
                    last_ok = Some(event.message_id);
                }
                Err(e) if e.is_fatal() => {
                    self.commit_cursor(conversation_id, last_ok).await?;
                    return Err(e);
                }
                Err(e) => {
                    // Leave the cursor before this message so the next run
                    // retries it; later messages wait to preserve order.
                    tracing::warn!(
                        conversation = conversation_id,
                        message_id = event.message_id,
                        error = %e,
                        "message failed, deferring rest of conversation"
                    );
                    report.failed += 1;
                    self.metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }

        self.commit_cursor(conversation_id, last_ok).await?;
        Ok(report)
    }

    async fn commit_cursor(
        &self,
        conversation_id: &str,
        last_ok: Option<i64>,
    ) -> Result<(), PipelineError> {
        if let Some(message_id) = last_ok {
            self.store
                .advance_cursor(
                    conversation_id,
                    message_id,
                    self.config.chunking.chunking_version,
                    self.config.chunking.preprocess_version,
                )
                .await?;
        }
        Ok(())
    }

    fn estimate_conversation(&self, events: &[MessageEvent]) -> ConversationReport {
        let mut report = ConversationReport::default();
        let mut texts: Vec<String> = Vec::new();

        for event in events {
            report.scanned += 1;
            if event.deleted {
                report.deleted += 1;
                continue;
            }
            let normalized = normalize(&event.raw_text);
            let header = create_header(event.sender.as_deref(), event.timestamp);
            let chunks = chunk_message(
                &self.config.chunking,
                self.embedder.model(),
                &event.conversation_id,
                event.message_id,
                event.thread_id,
                &normalized.text,
                normalized.has_link,
                &header,
                None,
            );
            if chunks.is_empty() {
                report.skipped += 1;
                continue;
            }
            report.indexed += 1;
            report.chunks += chunks.len();
            texts.extend(chunks.into_iter().map(|c| c.text));
        }

        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let (tokens, cost) = estimate_cost(&refs, self.embedder.model());
        report.est_tokens = tokens;
        report.est_cost_usd = cost;
        report
    }

    /// One-shot sync across every conversation the source knows about.
    ///
    /// Returns `true` when at least one message failed and was deferred.
    pub async fn run_sync(
        &self,
        source: &dyn SourceAdapter,
        opts: &SyncOptions,
    ) -> anyhow::Result<bool> {
        let conversations = source.list_conversations().await?;
        tracing::info!(count = conversations.len(), "starting sync pass");

        let mut total = ConversationReport::default();
        for conversation_id in &conversations {
            let report = self
                .process_conversation(source, conversation_id, opts)
                .await?;
            if report.scanned > 0 {
                tracing::info!(
                    conversation = %conversation_id,
                    scanned = report.scanned,
                    indexed = report.indexed,
                    failed = report.failed,
                    "conversation synced"
                );
            }
            total.absorb(&report);
        }

        if opts.dry_run {
            println!("Dry run across {} conversations:", conversations.len());
            println!("  Messages to index: {}", total.indexed);
            println!("  Chunks: {}", total.chunks);
            println!(
                "  Estimated: {} tokens, ${:.4}",
                total.est_tokens, total.est_cost_usd
            );
        } else {
            println!("Sync complete:");
            println!("  Conversations: {}", conversations.len());
            println!("  Messages scanned: {}", total.scanned);
            println!("  Indexed: {}", total.indexed);
            println!("  Skipped: {}", total.skipped);
            println!("  Deleted: {}", total.deleted);
            println!("  Failed: {}", total.failed);
            println!("  Chunks written: {}", total.chunks);
            println!(
                "  Embedding cost: ${:.4} (cache hit rate {:.1}%)",
                self.metrics.cost_usd(),
                self.metrics.cache_hit_rate()
            );
        }

        Ok(total.failed > 0)
    }

    /// Consistency sweep for one conversation: re-walk the recent window so
    /// edits and deletions that slipped past the live feed are reconciled.
    /// The revision check keeps already-synced messages cheap. Returns the
    /// number of messages that actually changed.
    pub async fn sweep_conversation(
        &self,
        source: &dyn SourceAdapter,
        conversation_id: &str,
    ) -> Result<usize, PipelineError> {
        let now = chrono::Utc::now().timestamp();
        let cutoff = now - self.config.daemon.sweep_window_days as i64 * SECONDS_PER_DAY;

        let mut events = source
            .fetch_since(conversation_id, None)
            .await
            .map_err(|e| PipelineError::Source(e.to_string()))?;

        // Reply parents can sit outside the window, so the lookup is built
        // before the cutoff filter.
        let replies = reply_texts(&events);
        events.retain(|e| e.timestamp >= cutoff);

        let mut reconciled = 0usize;
        for event in &events {
            let reply_text = event
                .reply_to_id
                .and_then(|id| replies.get(&id))
                .map(String::as_str);
            match self.process_message(event, reply_text, false).await {
                Ok(MessageOutcome::Skipped) => {}
                Ok(_) => reconciled += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        conversation = %conversation_id,
                        message_id = event.message_id,
                        error = %e,
                        "sweep failed for message"
                    );
                    self.metrics.messages_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.store.mark_swept(conversation_id, now).await?;
        Ok(reconciled)
    }

    /// Consistency sweep across every conversation the source knows about.
    pub async fn sweep(&self, source: &dyn SourceAdapter) -> Result<(), PipelineError> {
        let conversations = source
            .list_conversations()
            .await
            .map_err(|e| PipelineError::Source(e.to_string()))?;

        for conversation_id in &conversations {
            let reconciled = self.sweep_conversation(source, conversation_id).await?;
            if reconciled > 0 {
                tracing::info!(
                    conversation = %conversation_id,
                    reconciled,
                    "sweep reconciled messages"
                );
            }
        }
        Ok(())
    }

    /// Remove index documents and mirror rows for messages deleted longer
    /// ago than the retention window. Returns the number of documents purged.
    pub async fn purge(&self) -> Result<usize, PipelineError> {
        let retention_days = self.config.daemon.purge_retention_days;
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = chrono::Utc::now().timestamp() - retention_days as i64 * SECONDS_PER_DAY;

        let candidates = self.store.purge_candidates(cutoff).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.chunk_id.clone()).collect();
        self.feeder.delete_ids(&ids).await?;
        for id in &ids {
            self.store.remove_chunk_row(id).await?;
        }

        tracing::info!(purged = ids.len(), "purge pass removed documents");
        Ok(ids.len())
    }
}
