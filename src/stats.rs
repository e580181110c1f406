//! Sync state overview.
//!
//! A quick summary of what has been synced: cursors, mirrored chunk counts,
//! cache size, and per-conversation breakdowns. Used by `chatsync stats` to
//! give confidence that sync passes and sweeps are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct ConversationStats {
    conversation_id: String,
    message_count: i64,
    chunk_count: i64,
    deleted_count: i64,
    last_message_id: Option<i64>,
    last_swept_at: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(&config.db.path).await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;

    let total_messages: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT conversation_id || ':' || message_id) FROM chunks")
            .fetch_one(&pool)
            .await?;

    let deleted_pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE deleted_at IS NOT NULL")
            .fetch_one(&pool)
            .await?;

    let cached_embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Chatsync — Sync State");
    println!("=====================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Messages:     {}", total_messages);
    println!("  Chunks:       {}", total_chunks);
    println!("  Cached vecs:  {}", cached_embeddings);
    println!("  Purge queue:  {}", deleted_pending);

    let rows = sqlx::query(
        r#"
        SELECT
            s.conversation_id,
            s.last_message_id,
            s.last_swept_at,
            COUNT(DISTINCT c.message_id) AS message_count,
            COUNT(c.chunk_id) AS chunk_count,
            COUNT(c.deleted_at) AS deleted_count
        FROM sync_state s
        LEFT JOIN chunks c ON c.conversation_id = s.conversation_id
        GROUP BY s.conversation_id
        ORDER BY chunk_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let conversation_stats: Vec<ConversationStats> = rows
        .iter()
        .map(|row| ConversationStats {
            conversation_id: row.get("conversation_id"),
            message_count: row.get("message_count"),
            chunk_count: row.get("chunk_count"),
            deleted_count: row.get("deleted_count"),
            last_message_id: row.get("last_message_id"),
            last_swept_at: row.get("last_swept_at"),
        })
        .collect();

    if !conversation_stats.is_empty() {
        println!();
        println!("  By conversation:");
        println!(
            "  {:<28} {:>8} {:>8} {:>8} {:>10}   {}",
            "CONVERSATION", "MSGS", "CHUNKS", "DELETED", "CURSOR", "LAST SWEEP"
        );
        println!("  {}", "-".repeat(84));

        for s in &conversation_stats {
            let cursor_display = s
                .last_message_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            let sweep_display = match s.last_swept_at {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<28} {:>8} {:>8} {:>8} {:>10}   {}",
                s.conversation_id,
                s.message_count,
                s.chunk_count,
                s.deleted_count,
                cursor_display,
                sweep_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
