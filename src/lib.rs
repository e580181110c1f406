//! # Chatsync
//!
//! An ingestion and synchronization pipeline that keeps a personal message
//! archive continuously indexed in a remote hybrid search index.
//!
//! Chatsync reads message events from an archive source, normalizes and
//! chunks their text into token-bounded retrieval units, embeds the chunks
//! through a remote provider (with a local cache and a daily cost budget),
//! and feeds the resulting documents into a remote search index with
//! idempotent writes. Per-conversation cursors make every pass incremental
//! and crash-safe.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────┐   ┌───────────┐
//! │  Source   │──▶│     Pipeline      │──▶│   Index    │
//! │  (JSONL)  │   │ Normalize+Chunk   │   │  (remote)  │
//! └──────────┘   │  Embed (cached)   │   └───────────┘
//!                └─────────┬─────────┘
//!                          ▼
//!                    ┌──────────┐
//!                    │  SQLite   │
//!                    │ state +   │
//!                    │ cache     │
//!                    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chatsync init                 # create the state database
//! chatsync sync                 # incremental one-shot sync
//! chatsync sync --full          # re-walk full history
//! chatsync daemon               # follow the live feed
//! chatsync stats                # what's been synced
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | Archive source adapters |
//! | [`normalize`] | Text normalization and headers |
//! | [`chunk`] | Token-bounded chunking |
//! | [`embedder`] | Embedding provider, cache, budget |
//! | [`feeder`] | Idempotent index writes |
//! | [`state`] | Cursors and the local chunk mirror |
//! | [`pipeline`] | Batch orchestration |
//! | [`daemon`] | Live-feed worker pool |

pub mod backoff;
pub mod budget;
pub mod chunk;
pub mod config;
pub mod daemon;
pub mod db;
pub mod embedder;
pub mod error;
pub mod feeder;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod source;
pub mod state;
pub mod stats;
