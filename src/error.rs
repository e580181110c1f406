//! Pipeline failure taxonomy.
//!
//! The orchestrator needs to branch on failure class — retry later, skip the
//! message, or abort the run — without parsing error strings, so the pipeline
//! core returns a tagged error instead of an opaque one. The CLI layer wraps
//! these in `anyhow` for display.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The period spend plus the batch estimate would exceed the ceiling.
    /// Fatal for the run; no partial spend occurred.
    #[error(
        "daily embedding budget exceeded: spent ${spent:.4} + estimated ${estimated:.4} > ceiling ${ceiling:.4}"
    )]
    BudgetExceeded {
        spent: f64,
        estimated: f64,
        ceiling: f64,
    },

    /// A transient failure survived every retry attempt. Isolated to one
    /// batch; other batches and conversations are unaffected.
    #[error("transient failure after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// Auth failure, schema mismatch, or another non-retryable condition.
    /// Halts the pipeline: silent partial indexing would corrupt retrieval.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// A single corrupt message or chunk. Skipped and counted; the batch
    /// continues.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("source adapter error: {0}")]
    Source(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl PipelineError {
    /// True when the run as a whole must stop (budget or permanent failure).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::BudgetExceeded { .. } | PipelineError::Permanent(_)
        )
    }
}

/// Failure classification for one remote call, before retry handling.
///
/// Backends return this; the retry loops translate it into either another
/// attempt or a [`PipelineError`].
#[derive(Debug)]
pub enum BackendFailure {
    /// Timeout, 5xx, rate limit: worth retrying.
    Transient(String),
    /// Auth, schema, or other non-retryable condition.
    Permanent(String),
}

/// Whether an HTTP response or transport failure is worth retrying.
///
/// 429 and 5xx are transient (rate limit, overload); 401/403 and the
/// remaining 4xx family are permanent. Transport errors (timeout, refused
/// connection) are transient.
pub fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}
