//! Shared state for every collector subcommand.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::warn;

use tutorpipe_core::heartbeat::HeartbeatWriter;
use tutorpipe_core::PipeConfig;
use tutorpipe_observe::PipeMetrics;
use tutorpipe_store::{ExtractionQueue, RawStore, SupabaseRest};
use tutorpipe_telegram::types::normalize_channel_ref;

pub struct CollectorContext {
    pub cfg: PipeConfig,
    pub store: RawStore,
    pub queue: Option<ExtractionQueue>,
    pub metrics: Arc<PipeMetrics>,
    pub heartbeat: HeartbeatWriter,
}

impl CollectorContext {
    pub fn new(cfg: PipeConfig) -> Self {
        let store = RawStore::new(&cfg);
        let queue = SupabaseRest::new(&cfg.supabase)
            .ok()
            .map(|rest| ExtractionQueue::new(rest, cfg.supabase.extractions_table.clone()));
        let metrics = PipeMetrics::new(&cfg.pipeline_version);
        let heartbeat =
            HeartbeatWriter::new(cfg.heartbeat.collector_file.clone(), cfg.pipeline_version.clone());
        Self {
            cfg,
            store,
            queue,
            metrics,
            heartbeat,
        }
    }

    /// Enqueue extraction jobs after a successful raw write. Failures are
    /// logged and swallowed: losing an enqueue never aborts collection (the
    /// enqueue-from-raw tool can recover it later).
    pub async fn enqueue_jobs(&self, channel_link: &str, message_ids: &[String], force: bool) {
        let Some(queue) = &self.queue else {
            return;
        };
        if message_ids.is_empty() {
            return;
        }
        if let Err(e) = queue
            .enqueue(&self.cfg.pipeline_version, channel_link, message_ids, force)
            .await
        {
            warn!(error = %e, channel = channel_link, count = message_ids.len(), "enqueue failed");
        }
    }

    pub fn beat(&self, status: &str, last_event: &str, counts: &BTreeMap<String, u64>) {
        self.heartbeat.beat(status, Some(last_event), counts);
    }
}

/// Resolve the channel list: CLI argument (comma separated) first, else the
/// configured default set. Refs are normalized to `t.me/<name>`.
pub fn resolve_channels(cfg: &PipeConfig, arg: Option<&str>) -> Vec<String> {
    let raw: Vec<String> = match arg {
        Some(s) if !s.trim().is_empty() => s.split(',').map(str::to_string).collect(),
        _ => cfg.telegram.channels.clone(),
    };
    let mut out = Vec::new();
    for ch in raw {
        let normalized = normalize_channel_ref(&ch);
        if normalized != "t.me/" && !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

/// Parse `--since`/`--until` values: RFC 3339 instants or bare dates
/// (midnight UTC).
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instants_and_dates() {
        assert!(parse_instant("2026-07-01T10:00:00Z").is_some());
        let midnight = parse_instant("2026-07-01").unwrap();
        assert_eq!(midnight.to_rfc3339(), "2026-07-01T00:00:00+00:00");
        assert!(parse_instant("yesterday").is_none());
    }

    #[test]
    fn channel_resolution_prefers_cli_and_normalizes() {
        let mut cfg = PipeConfig::default();
        cfg.telegram.channels = vec!["configured".to_string()];
        assert_eq!(
            resolve_channels(&cfg, Some("@a, t.me/b,a")),
            vec!["t.me/a", "t.me/b"]
        );
        assert_eq!(resolve_channels(&cfg, None), vec!["t.me/configured"]);
    }
}
