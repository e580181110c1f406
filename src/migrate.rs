use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Per-conversation cursor and version tags
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            conversation_id TEXT PRIMARY KEY,
            last_message_id INTEGER,
            last_swept_at INTEGER,
            chunking_version INTEGER NOT NULL,
            preprocess_version INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Local mirror of chunks fed to the index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            edit_revision INTEGER NOT NULL DEFAULT 0,
            text_hash TEXT NOT NULL,
            message_date INTEGER NOT NULL,
            deleted_at INTEGER,
            sender TEXT,
            thread_id INTEGER,
            has_link INTEGER NOT NULL DEFAULT 0,
            UNIQUE(conversation_id, message_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedding cache: never recomputed for an existing (hash, model) pair
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            text_hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dim INTEGER NOT NULL,
            vector BLOB NOT NULL,
            chunking_version INTEGER NOT NULL,
            preprocess_version INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (text_hash, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_conv_msg ON chunks(conversation_id, message_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_deleted ON chunks(deleted_at)")
        .execute(pool)
        .await?;

    Ok(())
}
