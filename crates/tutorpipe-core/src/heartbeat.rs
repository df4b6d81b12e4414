//! Heartbeat files for external stall detection.
//!
//! Consumers only read the file timestamp and the JSON counters, so the write
//! must be atomic: write to a temp file in the same directory, then rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatDoc {
    /// Unix seconds of the write.
    pub ts: i64,
    /// Same instant, ISO-8601, for humans reading the file.
    pub iso: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    pub pipeline_version: String,
    pub pid: u32,
}

/// Writes one heartbeat document to a fixed path on every handled event and
/// on idle ticks.
#[derive(Debug, Clone)]
pub struct HeartbeatWriter {
    path: PathBuf,
    pipeline_version: String,
}

impl HeartbeatWriter {
    pub fn new(path: impl Into<PathBuf>, pipeline_version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pipeline_version: pipeline_version.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort write. Failures are logged at warn and never propagate to
    /// the event handlers that call this.
    pub fn beat(&self, status: &str, last_event: Option<&str>, counts: &BTreeMap<String, u64>) {
        if let Err(e) = self.write(status, last_event, counts) {
            tracing::warn!(path = %self.path.display(), error = %e, "heartbeat write failed");
        }
    }

    fn write(
        &self,
        status: &str,
        last_event: Option<&str>,
        counts: &BTreeMap<String, u64>,
    ) -> Result<()> {
        let now = Utc::now();
        let doc = HeartbeatDoc {
            ts: now.timestamp(),
            iso: now.to_rfc3339(),
            status: status.to_string(),
            last_event: last_event.map(str::to_string),
            counts: counts.clone(),
            pipeline_version: self.pipeline_version.clone(),
            pid: std::process::id(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_writes_parseable_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let hb = HeartbeatWriter::new(&path, "v-test");

        let mut counts = BTreeMap::new();
        counts.insert("scanned".to_string(), 3u64);
        hb.beat("running", Some("tail_new"), &counts);

        let doc: HeartbeatDoc =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc.status, "running");
        assert_eq!(doc.last_event.as_deref(), Some("tail_new"));
        assert_eq!(doc.counts.get("scanned"), Some(&3));
        assert_eq!(doc.pipeline_version, "v-test");
        assert!(doc.ts > 0);
    }

    #[test]
    fn beat_replaces_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.json");
        let hb = HeartbeatWriter::new(&path, "v-test");
        hb.beat("running", None, &BTreeMap::new());
        hb.beat("idle", None, &BTreeMap::new());
        let doc: HeartbeatDoc =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc.status, "idle");
        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "hb.json")
            .collect();
        assert!(leftovers.is_empty());
    }
}
