use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::mpsc;

use crate::config::AuditConfig;

/// Maximum number of entries to buffer before flushing, regardless of timer.
const BATCH_SIZE: usize = 100;

/// How often to flush buffered entries even if the batch is not full.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Most entries kept for retry while the sink keeps failing. Oldest go first.
const MAX_PENDING: usize = BATCH_SIZE * 10;

/// One completed chat request, written as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub virtual_key: String,
    pub provider: String,
    pub method: String,
    pub status: u16,
    pub duration_ms: i64,
    pub request: Box<RawValue>,
    pub response: Box<RawValue>,
}

/// Millisecond-precision UTC timestamp, e.g. `2025-03-04T05:06:07.123Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Embed a payload verbatim when it is JSON, otherwise as a (lossy) string.
///
/// JSON keeps its key order and number text; only whitespace between tokens
/// is removed so the entry stays on one line.
pub fn embed_payload(bytes: &[u8]) -> Box<RawValue> {
    if bytes.is_empty() {
        return RawValue::NULL.to_owned();
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        if serde_json::from_str::<&RawValue>(text).is_ok() {
            if let Ok(raw) = RawValue::from_string(compact_json(text)) {
                return raw;
            }
        }
    }
    serde_json::value::to_raw_value(&String::from_utf8_lossy(bytes))
        .unwrap_or_else(|_| RawValue::NULL.to_owned())
}

/// Drop insignificant whitespace from already-validated JSON text.
fn compact_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if !matches!(c, ' ' | '\t' | '\n' | '\r') {
            out.push(c);
        }
    }
    out
}

/// Where audit lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditSink {
    Stdout,
    /// Appended to; created if missing.
    File(PathBuf),
}

impl AuditSink {
    pub fn from_config(config: &AuditConfig) -> Self {
        match &config.path {
            Some(path) => Self::File(path.clone()),
            None => Self::Stdout,
        }
    }
}

/// Spawn a background task that reads `AuditEntry` values from the channel
/// and writes them to `sink` in batches.
///
/// The task exits once every sender is dropped and the remaining entries are
/// flushed, so the returned handle can be awaited on shutdown.
pub fn spawn_audit_logger(
    sink: AuditSink,
    mut rx: mpsc::UnboundedReceiver<AuditEntry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<AuditEntry> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                entry = rx.recv() => {
                    match entry {
                        Some(e) => {
                            buffer.push(e);
                            if buffer.len() >= BATCH_SIZE {
                                flush_batch(&sink, &mut buffer);
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush_batch(&sink, &mut buffer);
                            }
                            tracing::info!("Audit logger shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush_batch(&sink, &mut buffer);
                    }
                }
            }
        }
    })
}

fn flush_batch(sink: &AuditSink, buffer: &mut Vec<AuditEntry>) {
    let entries = std::mem::take(buffer);
    let count = entries.len();

    if let Err(e) = write_entries(sink, &entries) {
        tracing::error!(count, error = %e, "Failed to flush audit batch");
        // Retry on the next tick.
        buffer.extend(entries);
        if buffer.len() > MAX_PENDING {
            let dropped = buffer.len() - MAX_PENDING;
            buffer.drain(..dropped);
            tracing::warn!(dropped, kept = MAX_PENDING, "Audit backlog full; oldest entries dropped");
        }
    } else {
        tracing::debug!(count, "Flushed audit batch");
    }
}

fn write_entries(sink: &AuditSink, entries: &[AuditEntry]) -> std::io::Result<()> {
    let mut lines = Vec::with_capacity(entries.len() * 256);
    for entry in entries {
        serde_json::to_writer(&mut lines, entry)?;
        lines.push(b'\n');
    }

    match sink {
        AuditSink::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(&lines)?;
            out.flush()
        }
        AuditSink::File(path) => {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            file.write_all(&lines)?;
            file.flush()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
