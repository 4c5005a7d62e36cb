use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::AtomicU64;
use std::sync::Mutex;
use talus_events::LogFileStatus;

/// One queued upload: the raw buffer plus its scope. Consumed end-to-end by
/// a single worker (decode → parse → persist).
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub file_id: String,
    pub project_id: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub file_id: String,
    pub status: LogFileStatus,
}

#[derive(Debug, Default)]
pub struct RowBatch {
    pub event_rows: Vec<Value>,
    pub session_rows: Vec<Value>,
    pub file_rows: Vec<Value>,
}

impl RowBatch {
    pub fn row_count(&self) -> usize {
        self.event_rows.len() + self.session_rows.len() + self.file_rows.len()
    }
}

#[derive(Debug)]
pub enum SinkMessage {
    Batch(RowBatch),
}

#[derive(Default)]
pub struct Metrics {
    pub queue_depth: AtomicU64,
    pub files_parsed: AtomicU64,
    pub files_failed: AtomicU64,
    pub event_rows_written: AtomicU64,
    pub flush_failures: AtomicU64,
    pub last_flush_ms: AtomicU64,
    pub last_error: Mutex<String>,
}

/// Deterministic upload identity: the same buffer uploaded to the same
/// project under the same name maps to the same file id, so a retried job
/// upserts rather than duplicates.
pub fn file_id_for_upload(project_id: &str, file_name: &str, bytes: &[u8]) -> String {
    let mut content = Sha256::new();
    content.update(bytes);
    let content_hash = content.finalize();

    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update([0]);
    hasher.update(file_name.as_bytes());
    hasher.update([0]);
    hasher.update(content_hash);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_is_deterministic() {
        let a = file_id_for_upload("p1", "device.log", b"abc");
        let b = file_id_for_upload("p1", "device.log", b"abc");
        assert_eq!(a, b);
    }

    #[test]
    fn file_id_varies_with_project_name_and_content() {
        let base = file_id_for_upload("p1", "device.log", b"abc");
        assert_ne!(base, file_id_for_upload("p2", "device.log", b"abc"));
        assert_ne!(base, file_id_for_upload("p1", "other.log", b"abc"));
        assert_ne!(base, file_id_for_upload("p1", "device.log", b"abcd"));
    }
}
