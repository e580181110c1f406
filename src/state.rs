//! Durable sync state: cursors, the chunk mirror, and the embedding cache.
//!
//! This store is the authority for idempotence and incremental resumption.
//! Cursor rows are only advanced by the orchestrator after index writes are
//! confirmed; chunk mirror rows record what was last fed per message so edits
//! can be diffed (revision check, shrink detection) and deletions purged.

use sqlx::{Row, SqlitePool};

use crate::error::PipelineError;
use crate::models::{ChunkRecord, SyncState};

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_state(
        &self,
        conversation_id: &str,
    ) -> Result<Option<SyncState>, PipelineError> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, last_message_id, last_swept_at,
                   chunking_version, preprocess_version
            FROM sync_state WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SyncState {
            conversation_id: r.get("conversation_id"),
            last_message_id: r.get("last_message_id"),
            last_swept_at: r.get("last_swept_at"),
            chunking_version: r.get::<i64, _>("chunking_version") as u32,
            preprocess_version: r.get::<i64, _>("preprocess_version") as u32,
        }))
    }

    /// Advance the cursor. Called only after the batch's index writes are
    /// confirmed.
    pub async fn advance_cursor(
        &self,
        conversation_id: &str,
        last_message_id: i64,
        chunking_version: u32,
        preprocess_version: u32,
    ) -> Result<(), PipelineError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sync_state (conversation_id, last_message_id, last_swept_at,
                                    chunking_version, preprocess_version, updated_at)
            VALUES (?, ?, NULL, ?, ?, ?)
            ON CONFLICT(conversation_id) DO UPDATE SET
                last_message_id = MAX(COALESCE(sync_state.last_message_id, 0), excluded.last_message_id),
                chunking_version = excluded.chunking_version,
                preprocess_version = excluded.preprocess_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(conversation_id)
        .bind(last_message_id)
        .bind(chunking_version as i64)
        .bind(preprocess_version as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_swept(&self, conversation_id: &str, ts: i64) -> Result<(), PipelineError> {
        sqlx::query(
            "UPDATE sync_state SET last_swept_at = ?, updated_at = ? WHERE conversation_id = ?",
        )
        .bind(ts)
        .bind(chrono::Utc::now().timestamp())
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- chunk mirror ----

    pub async fn get_message_chunks(
        &self,
        conversation_id: &str,
        message_id: i64,
    ) -> Result<Vec<ChunkRecord>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, conversation_id, message_id, chunk_index, edit_revision,
                   text_hash, message_date, deleted_at, sender, thread_id, has_link
            FROM chunks WHERE conversation_id = ? AND message_id = ?
            ORDER BY chunk_index
            "#,
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    /// Replace the mirror rows for one message with the chunks of its latest
    /// revision. The whole message is rewritten in one transaction: rows for
    /// dropped indices and for prior chunking versions disappear together.
    pub async fn replace_message_chunks(
        &self,
        conversation_id: &str,
        message_id: i64,
        records: &[ChunkRecord],
    ) -> Result<(), PipelineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE conversation_id = ? AND message_id = ?")
            .bind(conversation_id)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        for rec in records {
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_id, conversation_id, message_id, chunk_index,
                                    edit_revision, text_hash, message_date, deleted_at,
                                    sender, thread_id, has_link)
                VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?)
                "#,
            )
            .bind(&rec.chunk_id)
            .bind(&rec.conversation_id)
            .bind(rec.message_id)
            .bind(rec.chunk_index)
            .bind(rec.edit_revision)
            .bind(&rec.text_hash)
            .bind(rec.message_date)
            .bind(&rec.sender)
            .bind(rec.thread_id)
            .bind(rec.has_link)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_message_deleted(
        &self,
        conversation_id: &str,
        message_id: i64,
        deleted_at: i64,
    ) -> Result<(), PipelineError> {
        sqlx::query("UPDATE chunks SET deleted_at = ? WHERE conversation_id = ? AND message_id = ?")
            .bind(deleted_at)
            .bind(conversation_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Highest edit revision recorded for a message, if any chunks exist.
    pub async fn max_edit_revision(
        &self,
        conversation_id: &str,
        message_id: i64,
    ) -> Result<Option<i64>, PipelineError> {
        let rev: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(edit_revision) FROM chunks WHERE conversation_id = ? AND message_id = ?",
        )
        .bind(conversation_id)
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(rev)
    }

    /// Chunk rows whose message was deleted before `cutoff`, for the purge
    /// pass.
    pub async fn purge_candidates(
        &self,
        cutoff: i64,
    ) -> Result<Vec<ChunkRecord>, PipelineError> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, conversation_id, message_id, chunk_index, edit_revision,
                   text_hash, message_date, deleted_at, sender, thread_id, has_link
            FROM chunks WHERE deleted_at IS NOT NULL AND deleted_at < ?
            ORDER BY conversation_id, message_id, chunk_index
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    pub async fn remove_chunk_row(&self, chunk_id: &str) -> Result<(), PipelineError> {
        sqlx::query("DELETE FROM chunks WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- embedding cache ----

    pub async fn get_cached_embedding(
        &self,
        text_hash: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>, PipelineError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT vector FROM embedding_cache WHERE text_hash = ? AND model = ?",
        )
        .bind(text_hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    /// Cache a vector. Concurrent writers for the same key are value-identical
    /// (the hash is a pure function of text + model), so conflicts are no-ops.
    pub async fn cache_embedding(
        &self,
        text_hash: &str,
        model: &str,
        vector: &[f32],
        chunking_version: u32,
        preprocess_version: u32,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (text_hash, model, dim, vector,
                                         chunking_version, preprocess_version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(text_hash, model) DO NOTHING
            "#,
        )
        .bind(text_hash)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .bind(chunking_version as i64)
        .bind(preprocess_version as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_record(r: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
    ChunkRecord {
        chunk_id: r.get("chunk_id"),
        conversation_id: r.get("conversation_id"),
        message_id: r.get("message_id"),
        chunk_index: r.get("chunk_index"),
        edit_revision: r.get("edit_revision"),
        text_hash: r.get("text_hash"),
        message_date: r.get("message_date"),
        deleted_at: r.get("deleted_at"),
        sender: r.get("sender"),
        thread_id: r.get("thread_id"),
        has_link: r.get::<i64, _>("has_link") != 0,
    }
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }
}
