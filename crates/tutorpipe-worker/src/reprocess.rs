//! `reprocess-recent`: re-extract and re-persist raw messages from a recent
//! window without touching the queue or fanning out to collaborators. Used
//! after prompt or pipeline changes to refresh recent records.

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{info, warn};

use tutorpipe_core::types::{build_message_link, AssignmentPayload};
use tutorpipe_extract::{non_assignment, normalize_text, schema};

use crate::context::WorkerContext;
use crate::enrich::enrich_llm_output;
use crate::job::llm_guarded;

const PAGE: usize = 200;

#[derive(Debug, Default)]
pub struct ReprocessStats {
    pub scanned: u64,
    pub skipped: u64,
    pub persisted: u64,
    pub failed: u64,
}

pub async fn run_reprocess_recent(
    ctx: &WorkerContext,
    days: i64,
    hours: i64,
) -> anyhow::Result<ReprocessStats> {
    let window = Duration::days(days.max(0)) + Duration::hours(hours.max(0));
    if window.is_zero() {
        anyhow::bail!("reprocess window is empty; pass --days and/or --hours");
    }
    let until = Utc::now();
    let since = until - window;
    info!(since = %since.to_rfc3339(), until = %until.to_rfc3339(), "reprocess-recent start");

    let mut stats = ReprocessStats::default();
    let mut offset = 0usize;
    loop {
        let page = ctx.store.list_raw_window(since, until, PAGE, offset).await;
        if page.is_empty() {
            break;
        }
        offset += page.len();

        for raw in &page {
            stats.scanned += 1;
            if raw.deleted_at.is_some() || raw.is_forward || raw.is_reply {
                stats.skipped += 1;
                continue;
            }
            let raw_text = raw.raw_text.as_deref().map(str::trim).unwrap_or("");
            if raw_text.is_empty() || non_assignment::detect(raw_text).is_some() {
                stats.skipped += 1;
                continue;
            }

            let cid = format!("reprocess:{}:{}", raw.channel_link, raw.message_id);
            let llm_output: Value =
                match llm_guarded(ctx, raw_text, &raw.channel_link, &cid).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(cid = %cid, error = %e, "reprocess extraction failed");
                        stats.failed += 1;
                        continue;
                    }
                };

            let normalized = normalize_text(raw_text);
            let agency = raw.channel_link.strip_prefix("t.me/");
            let enriched = enrich_llm_output(ctx, &llm_output, raw_text, &normalized, agency).await;
            let (ok, _) = schema::validate_parsed_assignment(&enriched.parsed);
            if !ok {
                stats.skipped += 1;
                continue;
            }

            let payload = AssignmentPayload {
                cid,
                pipeline_version: ctx.pipeline_version().to_string(),
                channel_link: raw.channel_link.clone(),
                channel_id: raw.channel_id.clone(),
                channel_title: None,
                channel_username: raw.channel_link.strip_prefix("t.me/").map(str::to_string),
                message_id: Some(raw.message_id.clone()),
                message_link: build_message_link(&raw.channel_link, &raw.message_id),
                date: Some(raw.message_date),
                source_last_seen: Some(raw.edit_date.unwrap_or(raw.message_date)),
                raw_text: raw_text.to_string(),
                parsed: enriched.parsed,
            };
            // Persist only: reprocessing never re-broadcasts.
            let outcome = ctx.assignments.persist(&payload).await;
            if outcome.ok {
                stats.persisted += 1;
            } else {
                stats.failed += 1;
            }
        }

        if page.len() < PAGE {
            break;
        }
    }

    info!(
        scanned = stats.scanned,
        skipped = stats.skipped,
        persisted = stats.persisted,
        failed = stats.failed,
        "reprocess-recent done"
    );
    Ok(stats)
}
