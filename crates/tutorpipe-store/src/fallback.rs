//! Append-only JSONL fallback so ingestion survives store outages.
//!
//! Each line is `{"ts": <unix>, "kind": <kind>, "row": {...}}` with kind in
//! {channel, message, delete, run_start, run_finish, progress}.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct JsonlFallback {
    path: PathBuf,
}

impl JsonlFallback {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort append; failures are logged, never propagated.
    pub fn append(&self, kind: &str, row: &Value) {
        if let Err(e) = self.try_append(kind, row) {
            tracing::debug!(path = %self.path.display(), error = %e, "raw fallback write failed");
        }
    }

    fn try_append(&self, kind: &str, row: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::json!({
            "ts": Utc::now().timestamp(),
            "kind": kind,
            "row": row,
        });
        writeln!(file, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_line_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let fb = JsonlFallback::new(dir.path().join("raw.jsonl"));
        fb.append("message", &serde_json::json!({"message_id": "1"}));
        fb.append("delete", &serde_json::json!({"message_id": "1"}));

        let content = std::fs::read_to_string(fb.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "message");
        assert_eq!(first["row"]["message_id"], "1");
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "delete");
    }
}
