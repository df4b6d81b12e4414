//! Raw store: every observed message, channel metadata, ingestion runs and
//! per-run progress.
//!
//! Writes are idempotent upserts on natural keys. A disabled store (no
//! credentials) degrades to the JSONL fallback so the collector keeps
//! running through outages; read operations then return empty results.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use tutorpipe_core::config::PipeConfig;
use tutorpipe_core::types::{ChannelInfo, RawMessage, RunProgress, RunStatus, RunType};

use crate::fallback::JsonlFallback;
use crate::rest::{quote, SupabaseRest};

#[derive(Debug, Clone)]
pub struct RawStore {
    rest: Option<SupabaseRest>,
    fallback: Option<JsonlFallback>,
    channels_table: String,
    messages_table: String,
    runs_table: String,
    progress_table: String,
}

impl RawStore {
    pub fn new(cfg: &PipeConfig) -> Self {
        let rest = SupabaseRest::new(&cfg.supabase).ok();
        let fallback = cfg
            .raw_fallback_file
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(JsonlFallback::new);
        Self {
            rest,
            fallback,
            channels_table: cfg.supabase.channels_table.clone(),
            messages_table: cfg.supabase.messages_table.clone(),
            runs_table: cfg.supabase.runs_table.clone(),
            progress_table: cfg.supabase.progress_table.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.rest.is_some()
    }

    pub fn rest(&self) -> Option<&SupabaseRest> {
        self.rest.as_ref()
    }

    fn fall_back(&self, kind: &str, row: &Value) {
        if let Some(fb) = &self.fallback {
            fb.append(kind, row);
        }
    }

    /// Upsert channel metadata; called on every sight of the channel.
    pub async fn upsert_channel(&self, info: &ChannelInfo) -> bool {
        let mut row = json!({"channel_link": info.channel_link});
        if let Some(id) = &info.channel_id {
            row["channel_id"] = json!(id);
        }
        if let Some(title) = &info.title {
            row["title"] = json!(title);
        }
        let Some(rest) = &self.rest else {
            self.fall_back("channel", &row);
            return false;
        };
        let path = format!("{}?on_conflict=channel_link", self.channels_table);
        match rest
            .post(&path, &json!([row]), Some("resolution=merge-duplicates,return=minimal"))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, channel = %info.channel_link, "channel upsert failed");
                self.fall_back("channel", &row);
                false
            }
        }
    }

    /// Batch upsert of raw rows. Returns (attempted, written).
    ///
    /// PostgREST requires identical key sets across a bulk insert, so rows
    /// are homogenized with explicit nulls. Rows missing any of
    /// {channel_link, message_id, message_date, message_json} are dropped
    /// and counted; the API cannot distinguish insert from update, so
    /// `written` is simply the accepted row count.
    pub async fn upsert_messages_batch(&self, rows: &[RawMessage]) -> (usize, usize) {
        if rows.is_empty() {
            return (0, 0);
        }

        let mut objects: Vec<serde_json::Map<String, Value>> = Vec::new();
        let mut dropped = 0usize;
        for row in rows {
            if row.channel_link.trim().is_empty()
                || row.message_id.trim().is_empty()
                || row.message_json.is_none()
            {
                dropped += 1;
                continue;
            }
            let Ok(Value::Object(mut obj)) = serde_json::to_value(row) else {
                dropped += 1;
                continue;
            };
            // Server assigns row ids.
            obj.remove("id");
            objects.push(obj);
        }
        if dropped > 0 {
            warn!(dropped, attempted = rows.len(), "raw rows dropped from batch");
        }
        if objects.is_empty() {
            return (rows.len(), 0);
        }

        let mut all_keys: Vec<String> = Vec::new();
        for obj in &objects {
            for k in obj.keys() {
                if !all_keys.contains(k) {
                    all_keys.push(k.clone());
                }
            }
        }
        for obj in &mut objects {
            for k in &all_keys {
                obj.entry(k.clone()).or_insert(Value::Null);
            }
        }
        let body = Value::Array(objects.into_iter().map(Value::Object).collect());

        let Some(rest) = &self.rest else {
            if let Value::Array(items) = &body {
                for item in items {
                    self.fall_back("message", item);
                }
            }
            return (rows.len(), 0);
        };

        let path = format!(
            "{}?on_conflict=channel_link,message_id",
            self.messages_table
        );
        match rest
            .post(&path, &body, Some("resolution=merge-duplicates,return=minimal"))
            .await
        {
            Ok(_) => {
                let written = body.as_array().map(Vec::len).unwrap_or(0);
                (rows.len(), written)
            }
            Err(e) => {
                warn!(error = %e, attempted = rows.len(), "raw batch upsert failed");
                if let Value::Array(items) = &body {
                    for item in items {
                        self.fall_back("message", item);
                    }
                }
                (rows.len(), 0)
            }
        }
    }

    /// Tombstone deleted messages; text is preserved. Returns patched count.
    pub async fn mark_deleted(&self, channel_link: &str, message_ids: &[String]) -> usize {
        let now = Utc::now().to_rfc3339();
        let ids: Vec<&str> = message_ids
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let Some(rest) = &self.rest else {
            for id in &ids {
                self.fall_back(
                    "delete",
                    &json!({"channel_link": channel_link, "message_id": id, "deleted_at": now}),
                );
            }
            return 0;
        };

        // One PATCH per message keeps the predicate simple; deletions are rare.
        let mut patched = 0usize;
        for id in ids {
            let path = format!(
                "{}?channel_link=eq.{}&message_id=eq.{}",
                self.messages_table,
                quote(channel_link),
                quote(id)
            );
            let body = json!({"deleted_at": now, "last_seen_at": now});
            match rest.patch(&path, &body, None).await {
                Ok(()) => patched += 1,
                Err(e) => {
                    tracing::debug!(error = %e, message_id = id, "delete patch failed");
                }
            }
        }
        patched
    }

    pub async fn create_run(
        &self,
        run_type: RunType,
        channels: &[String],
        meta: Value,
    ) -> Option<i64> {
        let row = json!({
            "run_type": run_type.as_str(),
            "status": RunStatus::Running.as_str(),
            "channels": channels,
            "meta": meta,
        });
        let Some(rest) = &self.rest else {
            self.fall_back("run_start", &row);
            return None;
        };
        match rest
            .post(&self.runs_table, &json!([row]), Some("return=representation"))
            .await
        {
            Ok(Value::Array(items)) => items.first().and_then(|r| r.get("id")).and_then(Value::as_i64),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "run create failed");
                None
            }
        }
    }

    pub async fn finish_run(
        &self,
        run_id: Option<i64>,
        status: RunStatus,
        meta_patch: Option<Value>,
    ) -> bool {
        let Some(run_id) = run_id else {
            self.fall_back(
                "run_finish",
                &json!({"run_id": null, "status": status.as_str(), "meta_patch": meta_patch}),
            );
            return false;
        };
        let Some(rest) = &self.rest else {
            self.fall_back(
                "run_finish",
                &json!({"run_id": run_id, "status": status.as_str(), "meta_patch": meta_patch}),
            );
            return false;
        };
        let mut body = json!({
            "status": status.as_str(),
            "finished_at": Utc::now().to_rfc3339(),
        });
        if let Some(meta) = meta_patch {
            body["meta"] = meta;
        }
        let path = format!("{}?id=eq.{run_id}", self.runs_table);
        match rest.patch(&path, &body, None).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, run_id, "run finish failed");
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_progress(
        &self,
        run_id: Option<i64>,
        channel_link: &str,
        last_message_id: Option<&str>,
        last_message_date_iso: Option<&str>,
        scanned: i64,
        inserted: i64,
        updated: i64,
        errors: i64,
    ) -> bool {
        let mut row = json!({
            "channel_link": channel_link,
            "updated_at": Utc::now().to_rfc3339(),
            "scanned_count": scanned,
            "inserted_count": inserted,
            "updated_count": updated,
            "error_count": errors,
        });
        if let Some(id) = last_message_id {
            row["last_message_id"] = json!(id);
        }
        if let Some(date) = last_message_date_iso {
            row["last_message_date"] = json!(date);
        }

        let (Some(rest), Some(run_id)) = (&self.rest, run_id) else {
            row["run_id"] = json!(run_id);
            self.fall_back("progress", &row);
            return false;
        };
        row["run_id"] = json!(run_id);
        let path = format!("{}?on_conflict=run_id,channel_link", self.progress_table);
        match rest
            .post(&path, &json!([row]), Some("resolution=merge-duplicates,return=minimal"))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, channel = channel_link, "progress upsert failed");
                false
            }
        }
    }

    /// Latest (message_date, message_id) seen for a channel; drives the
    /// recovery-catchup initial cursors.
    pub async fn latest_cursor(&self, channel_link: &str) -> Option<(DateTime<Utc>, String)> {
        let rest = self.rest.as_ref()?;
        let path = format!(
            "{}?select=message_date,message_id&channel_link=eq.{}&order=message_date.desc&limit=1",
            self.messages_table,
            quote(channel_link)
        );
        let rows: Vec<Value> = rest.get_json(&path).await.ok()?;
        let row = rows.first()?;
        let date = row
            .get("message_date")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))?;
        let id = row.get("message_id").and_then(Value::as_str)?.to_string();
        Some((date, id))
    }

    pub async fn fetch_raw(&self, raw_id: i64) -> Option<RawMessage> {
        let rest = self.rest.as_ref()?;
        let path = format!("{}?select=*&id=eq.{raw_id}&limit=1", self.messages_table);
        let rows: Vec<RawMessage> = rest.get_json(&path).await.ok()?;
        rows.into_iter().next()
    }

    pub async fn fetch_channel(&self, channel_link: &str) -> Option<ChannelInfo> {
        let rest = self.rest.as_ref()?;
        let path = format!(
            "{}?select=channel_link,channel_id,title&channel_link=eq.{}&limit=1",
            self.channels_table,
            quote(channel_link)
        );
        let rows: Vec<ChannelInfo> = rest.get_json(&path).await.ok()?;
        rows.into_iter().next()
    }

    /// Raw rows in a time window, ordered oldest first. Used by the
    /// enqueue-from-raw tool and `reprocess-recent`.
    pub async fn list_raw_window(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Vec<RawMessage> {
        let Some(rest) = &self.rest else {
            return Vec::new();
        };
        let path = format!(
            "{}?select=*&message_date=gte.{}&message_date=lte.{}&order=message_date.asc&limit={limit}&offset={offset}",
            self.messages_table,
            quote(&since.to_rfc3339()),
            quote(&until.to_rfc3339()),
        );
        rest.get_json(&path).await.unwrap_or_default()
    }

    pub async fn latest_run_id(&self, run_type: Option<RunType>) -> Option<i64> {
        let rest = self.rest.as_ref()?;
        let filter = run_type
            .map(|t| format!("&run_type=eq.{}", t.as_str()))
            .unwrap_or_default();
        let path = format!(
            "{}?select=id,run_type,started_at{filter}&order=started_at.desc&limit=1",
            self.runs_table
        );
        let rows: Vec<Value> = rest.get_json(&path).await.ok()?;
        rows.first()?.get("id").and_then(Value::as_i64)
    }

    pub async fn get_run(&self, run_id: i64) -> Option<Value> {
        let rest = self.rest.as_ref()?;
        let path = format!("{}?select=*&id=eq.{run_id}&limit=1", self.runs_table);
        let rows: Vec<Value> = rest.get_json(&path).await.ok()?;
        rows.into_iter().next()
    }

    pub async fn list_progress(&self, run_id: i64) -> Vec<RunProgress> {
        let Some(rest) = &self.rest else {
            return Vec::new();
        };
        let path = format!(
            "{}?select=channel_link,last_message_id,last_message_date,scanned_count,inserted_count,updated_count,error_count,updated_at&run_id=eq.{run_id}&order=channel_link.asc",
            self.progress_table
        );
        rest.get_json(&path).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorpipe_core::config::PipeConfig;

    fn disabled_store(dir: &std::path::Path) -> RawStore {
        let mut cfg = PipeConfig::default();
        cfg.raw_fallback_file = Some(dir.join("fallback.jsonl").display().to_string());
        RawStore::new(&cfg)
    }

    fn sample_raw(message_id: &str) -> RawMessage {
        RawMessage {
            id: None,
            channel_link: "t.me/testchannel".to_string(),
            channel_id: Some("123".to_string()),
            message_id: message_id.to_string(),
            message_date: Utc::now(),
            edit_date: None,
            sender_id: None,
            is_forward: false,
            is_reply: false,
            raw_text: Some("hello".to_string()),
            entities_json: None,
            media_json: None,
            views: None,
            forwards: None,
            reply_count: None,
            deleted_at: None,
            last_seen_at: Some(Utc::now()),
            message_json: Some(serde_json::json!({"id": message_id})),
        }
    }

    #[tokio::test]
    async fn disabled_store_writes_fallback_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = disabled_store(dir.path());
        assert!(!store.enabled());

        let (attempted, written) = store
            .upsert_messages_batch(&[sample_raw("1"), sample_raw("2")])
            .await;
        assert_eq!(attempted, 2);
        assert_eq!(written, 0);
        store
            .mark_deleted("t.me/testchannel", &["1".to_string()])
            .await;

        let content =
            std::fs::read_to_string(dir.path().join("fallback.jsonl")).unwrap();
        let kinds: Vec<String> = content
            .lines()
            .map(|l| {
                serde_json::from_str::<Value>(l).unwrap()["kind"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(kinds, vec!["message", "message", "delete"]);
    }

    #[tokio::test]
    async fn rows_missing_required_fields_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = disabled_store(dir.path());
        let mut bad = sample_raw("3");
        bad.message_json = None;
        let (attempted, written) = store.upsert_messages_batch(&[bad]).await;
        assert_eq!(attempted, 1);
        assert_eq!(written, 0);
        // nothing written to fallback either: the row is invalid
        let content =
            std::fs::read_to_string(dir.path().join("fallback.jsonl")).unwrap_or_default();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn disabled_reads_return_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = disabled_store(dir.path());
        assert!(store.latest_cursor("t.me/x").await.is_none());
        assert!(store.fetch_raw(1).await.is_none());
        assert!(store
            .list_raw_window(Utc::now(), Utc::now(), 10, 0)
            .await
            .is_empty());
    }
}
