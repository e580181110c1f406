//! Source adapters that surface message events from an archive.
//!
//! The built-in adapter reads a directory of JSONL exports, one
//! `<conversation_id>.jsonl` file per conversation with one [`MessageEvent`]
//! per line. Live mode tails the files by byte offset and emits newly
//! appended events.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::models::MessageEvent;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// All conversation ids the source currently knows about.
    async fn list_conversations(&self) -> Result<Vec<String>>;

    /// Events for one conversation with `message_id > cursor`, ordered by
    /// `message_id` ascending. `cursor = None` means the full history.
    async fn fetch_since(
        &self,
        conversation_id: &str,
        cursor: Option<i64>,
    ) -> Result<Vec<MessageEvent>>;

    /// A live feed of events appended after the subscription starts.
    fn subscribe(&self) -> mpsc::Receiver<MessageEvent>;
}

/// Source backed by a directory of per-conversation JSONL export files.
pub struct JsonlSource {
    root: PathBuf,
    poll_interval: Duration,
}

impl JsonlSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            root: config.root.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", conversation_id))
    }

    fn scan_files(root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .map(|e| e.path().to_path_buf())
            .collect();
        files.sort();
        files
    }
}

/// Parse the lines of one export file, skipping unparseable lines with a
/// warning rather than failing the whole conversation. Undecodable bytes are
/// replaced, never surfaced as errors.
fn read_events(path: &Path, conversation_id: &str) -> Result<Vec<MessageEvent>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read export file: {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);

    let mut events = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MessageEvent>(line) {
            Ok(mut event) => {
                if event.conversation_id.is_empty() {
                    event.conversation_id = conversation_id.to_string();
                }
                events.push(event);
            }
            Err(e) => {
                tracing::warn!(
                    file = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping malformed event line"
                );
            }
        }
    }
    Ok(events)
}

fn conversation_id_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

#[async_trait]
impl SourceAdapter for JsonlSource {
    async fn list_conversations(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || Self::scan_files(&root)).await?;
        Ok(files
            .iter()
            .filter_map(|p| conversation_id_of(p))
            .collect())
    }

    async fn fetch_since(
        &self,
        conversation_id: &str,
        cursor: Option<i64>,
    ) -> Result<Vec<MessageEvent>> {
        let path = self.conversation_path(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let conv = conversation_id.to_string();
        let mut events =
            tokio::task::spawn_blocking(move || read_events(&path, &conv)).await??;

        if let Some(cursor) = cursor {
            events.retain(|e| e.message_id > cursor);
        }
        events.sort_by_key(|e| (e.message_id, e.edit_revision));
        Ok(events)
    }

    fn subscribe(&self) -> mpsc::Receiver<MessageEvent> {
        let (tx, rx) = mpsc::channel(256);
        let root = self.root.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            // Start tailing at the current end of each file; the startup
            // lookback pass covers anything appended before the first poll.
            let mut offsets: HashMap<PathBuf, u64> = HashMap::new();
            for path in Self::scan_files(&root) {
                if let Ok(meta) = std::fs::metadata(&path) {
                    offsets.insert(path, meta.len());
                }
            }

            loop {
                tokio::time::sleep(poll_interval).await;

                for path in Self::scan_files(&root) {
                    let offset = offsets.get(&path).copied().unwrap_or(0);
                    let len = match std::fs::metadata(&path) {
                        Ok(meta) => meta.len(),
                        Err(_) => continue,
                    };
                    if len <= offset {
                        // Truncated files restart from the top.
                        if len < offset {
                            offsets.insert(path, 0);
                        }
                        continue;
                    }

                    let conv = match conversation_id_of(&path) {
                        Some(c) => c,
                        None => continue,
                    };
                    match tail_events(&path, offset, &conv) {
                        Ok((events, new_offset)) => {
                            offsets.insert(path, new_offset);
                            for event in events {
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(file = %path.display(), error = %e, "tail failed");
                        }
                    }
                }
            }
        });

        rx
    }
}

/// Read complete lines appended past `offset`, returning the events and the
/// offset just past the last full line. A partial trailing line is left for
/// the next poll.
fn tail_events(path: &Path, offset: u64, conversation_id: &str) -> Result<(Vec<MessageEvent>, u64)> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut consumed = offset;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        consumed += n as u64;

        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<MessageEvent>(trimmed) {
            Ok(mut event) => {
                if event.conversation_id.is_empty() {
                    event.conversation_id = conversation_id.to_string();
                }
                events.push(event);
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping malformed event line");
            }
        }
    }

    Ok((events, consumed))
}
