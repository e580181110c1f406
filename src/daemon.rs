//! Long-running daemon mode.
//!
//! A coordinator loop receives live events from the source's subscription
//! and queues work per conversation for a bounded worker pool. Edit and
//! deletion events carry their payload straight to the worker, which applies
//! them directly; the cursor-based fetch would filter them back out, since
//! their message ids sit at or below the committed cursor. New messages only
//! mark the conversation for a cursor resync, which picks them up in order
//! with their neighbors. Sweep ticks route each conversation through the
//! same queue, so a conversation is never touched by two tasks at once:
//! work arriving while it is in flight re-queues for another pass after the
//! current one commits. Ctrl-C stops intake and drains in-flight work.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::error::PipelineError;
use crate::models::MessageEvent;
use crate::pipeline::{reply_texts, ConversationReport, MessageOutcome, Pipeline, SyncOptions};
use crate::source::SourceAdapter;

/// Work owed to one conversation: live events to apply directly, plus
/// whether a cursor resync or a sweep pass is queued.
#[derive(Debug, Default)]
pub struct ConversationWork {
    pub events: Vec<MessageEvent>,
    pub resync: bool,
    pub sweep: bool,
}

pub async fn run_daemon(pipeline: Arc<Pipeline>, source: Arc<dyn SourceAdapter>) -> Result<()> {
    let daemon_cfg = pipeline.config().daemon.clone();

    // Subscribe before the catch-up passes so nothing appended in between
    // falls through the gap.
    let mut events = source.subscribe();

    lookback_pass(&pipeline, source.as_ref(), daemon_cfg.lookback_minutes).await?;
    catch_up(&pipeline, source.as_ref()).await?;
    tracing::info!(workers = daemon_cfg.worker_limit, "daemon running");

    let sweep_period = Duration::from_secs(daemon_cfg.sweep_interval_minutes.max(1) * 60);
    let mut sweep_tick = tokio::time::interval(sweep_period);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep_tick.tick().await;

    let mut pending: HashMap<String, ConversationWork> = HashMap::new();
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut requeue: HashMap<String, ConversationWork> = HashMap::new();
    let mut workers: JoinSet<(String, Result<ConversationReport, PipelineError>)> = JoinSet::new();
    let mut draining = false;
    let mut feed_open = true;

    loop {
        while !draining && workers.len() < daemon_cfg.worker_limit {
            let Some(conversation_id) = pending.keys().next().cloned() else {
                break;
            };
            let work = pending.remove(&conversation_id).unwrap_or_default();
            in_flight.insert(conversation_id.clone());

            let pipeline = Arc::clone(&pipeline);
            let source = Arc::clone(&source);
            workers.spawn(async move {
                let report =
                    drain_conversation(&pipeline, source.as_ref(), &conversation_id, work).await;
                (conversation_id, report)
            });
        }

        if draining && workers.is_empty() {
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !draining => {
                tracing::info!(in_flight = workers.len(), "shutdown requested, draining");
                draining = true;
            }

            maybe_event = events.recv(), if feed_open && !draining => {
                match maybe_event {
                    Some(event) => queue_event(event, &in_flight, &mut pending, &mut requeue),
                    None => {
                        // Sweep ticks still reconcile if the feed dies.
                        tracing::warn!("live feed closed");
                        feed_open = false;
                    }
                }
            }

            _ = sweep_tick.tick(), if !draining && daemon_cfg.sweep_interval_minutes > 0 => {
                match source.list_conversations().await {
                    Ok(conversations) => {
                        for conversation_id in conversations {
                            let slot = if in_flight.contains(&conversation_id) {
                                requeue.entry(conversation_id)
                            } else {
                                pending.entry(conversation_id)
                            };
                            slot.or_default().sweep = true;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "sweep enumeration failed"),
                }
                match pipeline.purge().await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => tracing::warn!(error = %e, "purge pass failed"),
                }
            }

            joined = workers.join_next(), if !workers.is_empty() => {
                let Some(joined) = joined else { continue };
                let (conversation_id, result) = joined?;
                in_flight.remove(&conversation_id);
                if let Some(work) = requeue.remove(&conversation_id) {
                    pending.insert(conversation_id.clone(), work);
                }
                match result {
                    Ok(report) => {
                        if report.indexed + report.deleted > 0 {
                            tracing::info!(
                                conversation = %conversation_id,
                                indexed = report.indexed,
                                deleted = report.deleted,
                                failed = report.failed,
                                "conversation synced"
                            );
                        }
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(conversation = %conversation_id, error = %e, "sync failed");
                    }
                }
            }
        }
    }

    let metrics = pipeline.metrics();
    tracing::info!(
        indexed = metrics.messages_indexed.load(Ordering::Relaxed),
        chunks = metrics.chunks_written.load(Ordering::Relaxed),
        failed = metrics.messages_failed.load(Ordering::Relaxed),
        cost_usd = metrics.cost_usd(),
        "daemon stopped"
    );
    Ok(())
}

/// Route one live event into the per-conversation queue. Deletions and edits
/// keep their payload; new messages just ask for a resync.
fn queue_event(
    event: MessageEvent,
    in_flight: &HashSet<String>,
    pending: &mut HashMap<String, ConversationWork>,
    requeue: &mut HashMap<String, ConversationWork>,
) {
    let conversation_id = event.conversation_id.clone();
    let work = if in_flight.contains(&conversation_id) {
        requeue.entry(conversation_id).or_default()
    } else {
        pending.entry(conversation_id).or_default()
    };
    if event.deleted || event.edit_revision > 0 {
        work.events.push(event);
    } else {
        work.resync = true;
    }
}

/// Apply one conversation's queued work: direct events first, then the
/// cursor resync, then the sweep pass.
pub async fn drain_conversation(
    pipeline: &Pipeline,
    source: &dyn SourceAdapter,
    conversation_id: &str,
    work: ConversationWork,
) -> Result<ConversationReport, PipelineError> {
    let mut report = ConversationReport::default();

    if !work.events.is_empty() {
        let mut events = work.events;
        events.sort_by_key(|e| (e.message_id, e.edit_revision));

        let replies = if events.iter().any(|e| e.reply_to_id.is_some()) {
            let all = source
                .fetch_since(conversation_id, None)
                .await
                .map_err(|e| PipelineError::Source(e.to_string()))?;
            reply_texts(&all)
        } else {
            HashMap::new()
        };

        for event in &events {
            let reply_text = event
                .reply_to_id
                .and_then(|id| replies.get(&id))
                .map(String::as_str);
            report.scanned += 1;
            match pipeline.process_message(event, reply_text, false).await {
                Ok(MessageOutcome::Indexed(n)) => {
                    report.indexed += 1;
                    report.chunks += n;
                }
                Ok(MessageOutcome::Deleted) => report.deleted += 1,
                Ok(MessageOutcome::Skipped) | Ok(MessageOutcome::Empty) => report.skipped += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        conversation = %conversation_id,
                        message_id = event.message_id,
                        error = %e,
                        "live event failed"
                    );
                    report.failed += 1;
                    pipeline
                        .metrics()
                        .messages_failed
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    if work.resync {
        let resync = pipeline
            .process_conversation(source, conversation_id, &SyncOptions::default())
            .await?;
        report.absorb(&resync);
    }

    if work.sweep {
        pipeline.sweep_conversation(source, conversation_id).await?;
    }

    Ok(report)
}

/// Replay the recent window through the revision check to cover edits and
/// deletions missed while the daemon was down. Cheap when nothing changed.
async fn lookback_pass(
    pipeline: &Pipeline,
    source: &dyn SourceAdapter,
    lookback_minutes: u64,
) -> Result<()> {
    if lookback_minutes == 0 {
        return Ok(());
    }
    let cutoff = chrono::Utc::now().timestamp() - (lookback_minutes * 60) as i64;

    for conversation_id in source.list_conversations().await? {
        let mut events = source.fetch_since(&conversation_id, None).await?;
        let replies = reply_texts(&events);
        events.retain(|e| e.timestamp >= cutoff);

        for event in &events {
            let reply_text = event
                .reply_to_id
                .and_then(|id| replies.get(&id))
                .map(String::as_str);
            match pipeline.process_message(event, reply_text, false).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        conversation = %conversation_id,
                        message_id = event.message_id,
                        error = %e,
                        "lookback failed for message"
                    );
                }
            }
        }
    }
    Ok(())
}

/// Incremental pass over every conversation to drain the backlog that
/// accrued while the daemon was offline.
async fn catch_up(pipeline: &Pipeline, source: &dyn SourceAdapter) -> Result<()> {
    let opts = SyncOptions::default();
    for conversation_id in source.list_conversations().await? {
        match pipeline
            .process_conversation(source, &conversation_id, &opts)
            .await
        {
            Ok(report) => {
                if report.indexed > 0 {
                    tracing::info!(
                        conversation = %conversation_id,
                        indexed = report.indexed,
                        "catch-up synced conversation"
                    );
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, error = %e, "catch-up failed");
            }
        }
    }
    Ok(())
}
