//! Extraction work queue, keyed by (pipeline_version, raw_id).
//!
//! The claim path goes through a database RPC using SKIP LOCKED so two
//! workers never hold the same job; enqueue is an upsert that leaves
//! terminal rows alone unless `force` is set (edits force reprocessing).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

use tutorpipe_core::types::{ExtractionJob, JobStatus};

use crate::error::Result;
use crate::rest::{quote, SupabaseRest};

#[derive(Debug, Clone)]
pub struct ExtractionQueue {
    rest: SupabaseRest,
    table: String,
}

impl ExtractionQueue {
    pub fn new(rest: SupabaseRest, table: impl Into<String>) -> Self {
        Self {
            rest,
            table: table.into(),
        }
    }

    /// Upsert pending rows for the given message ids. With `force` false,
    /// rows already ok/failed/skipped for this pipeline version are left
    /// untouched; with `force` true they reset to pending with the attempt
    /// counter incremented. Returns the number of rows enqueued.
    pub async fn enqueue(
        &self,
        pipeline_version: &str,
        channel_link: &str,
        message_ids: &[String],
        force: bool,
    ) -> Result<i64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let count: i64 = self
            .rest
            .rpc(
                "enqueue_extractions",
                &json!({
                    "p_pipeline_version": pipeline_version,
                    "p_channel_link": channel_link,
                    "p_message_ids": message_ids,
                    "p_force": force,
                }),
            )
            .await?;
        debug!(
            channel = channel_link,
            requested = message_ids.len(),
            enqueued = count,
            force,
            "extractions enqueued"
        );
        Ok(count)
    }

    /// Atomically claim up to `limit` pending jobs (flipped to processing
    /// server-side with SKIP LOCKED).
    pub async fn claim(&self, pipeline_version: &str, limit: u32) -> Result<Vec<ExtractionJob>> {
        let jobs: Vec<ExtractionJob> = self
            .rest
            .rpc(
                "claim_extractions",
                &json!({
                    "p_pipeline_version": pipeline_version,
                    "p_limit": limit.max(1),
                }),
            )
            .await?;
        Ok(jobs)
    }

    /// Return stuck `processing` rows to `pending`, attempt incremented and
    /// `requeued_at` stamped into meta by the RPC. Returns the count.
    pub async fn requeue_stale(&self, older_than_seconds: u64) -> Result<i64> {
        let result: Value = self
            .rest
            .rpc(
                "requeue_stale_extractions",
                &json!({"p_older_than_seconds": older_than_seconds}),
            )
            .await?;
        let count = result.get("count").and_then(Value::as_i64).unwrap_or(0);
        if count > 0 {
            info!(count, older_than_seconds, "stale processing jobs requeued");
        }
        Ok(count)
    }

    /// Per-status row counts for one pipeline version.
    pub async fn counts(
        &self,
        pipeline_version: &str,
        statuses: &[JobStatus],
    ) -> BTreeMap<&'static str, u64> {
        let mut out = BTreeMap::new();
        for status in statuses {
            let path = format!(
                "{}?select=id&pipeline_version=eq.{}&status=eq.{}",
                self.table,
                quote(pipeline_version),
                status.as_str()
            );
            let n = self.rest.count(&path).await.unwrap_or(0);
            out.insert(status.as_str(), n);
        }
        out
    }

    /// Pending + processing backlog; the recovery loop defers above the
    /// low-water mark.
    pub async fn backlog(&self, pipeline_version: &str) -> u64 {
        let counts = self
            .counts(pipeline_version, &[JobStatus::Pending, JobStatus::Processing])
            .await;
        counts.values().sum()
    }

    /// Age in seconds of the oldest row in the given status, if any.
    pub async fn oldest_age_seconds(
        &self,
        pipeline_version: &str,
        status: JobStatus,
    ) -> Option<f64> {
        let path = format!(
            "{}?select=created_at&pipeline_version=eq.{}&status=eq.{}&order=created_at.asc&limit=1",
            self.table,
            quote(pipeline_version),
            status.as_str()
        );
        let rows: Vec<Value> = self.rest.get_json(&path).await.ok()?;
        let created = rows
            .first()?
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))?;
        Some((Utc::now() - created).num_milliseconds() as f64 / 1000.0)
    }

    /// Write a job's terminal (or requeued) state. `meta` must already be
    /// the merged meta object; `error` and `canonical` are optional columns.
    pub async fn mark(
        &self,
        extraction_id: i64,
        status: JobStatus,
        canonical: Option<&Value>,
        error: Option<&Value>,
        meta: Option<&Value>,
    ) -> Result<()> {
        let mut body = json!({"status": status.as_str()});
        if let Some(c) = canonical {
            body["canonical_json"] = c.clone();
        }
        if let Some(e) = error {
            body["error_json"] = e.clone();
        }
        if let Some(m) = meta {
            body["meta"] = m.clone();
        }
        let path = format!("{}?id=eq.{extraction_id}", self.table);
        self.rest.patch(&path, &body, None).await
    }
}
