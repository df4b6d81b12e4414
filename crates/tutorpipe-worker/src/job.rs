//! Per-job orchestration: guards, filters and dispatch into the standard or
//! compilation pipeline. Every job runs to a terminal status (or back to
//! pending) independently of its batch mates.

use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use tutorpipe_core::types::{ExtractionJob, JobMeta, JobStatus, ParsedAssignment, RawMessage};
use tutorpipe_extract::compilation::{self, CompilationThresholds};
use tutorpipe_extract::{non_assignment, normalize_text};
use tutorpipe_llm::{prompt, LlmError};

use crate::context::WorkerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Ok,
    Failed,
    Skipped,
    Requeued,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Ok => "ok",
            JobOutcome::Failed => "failed",
            JobOutcome::Skipped => "skipped",
            JobOutcome::Requeued => "requeued",
        }
    }
}

/// Per-job handle: identity, meta merging and queue write-backs.
pub struct JobCtx<'a> {
    pub ctx: &'a WorkerContext,
    pub job: &'a ExtractionJob,
    pub cid: String,
    pub channel_link: String,
}

impl<'a> JobCtx<'a> {
    pub fn new(ctx: &'a WorkerContext, job: &'a ExtractionJob) -> Self {
        let channel_link = job.channel_link_or_unknown();
        let message_id = job.message_id.clone().unwrap_or_default();
        let cid = format!("worker:{channel_link}:{message_id}:{}", job.id);
        Self {
            ctx,
            job,
            cid,
            channel_link,
        }
    }

    fn merged_meta(&self, mut patch: Map<String, Value>) -> Value {
        patch
            .entry("prompt_fingerprint".to_string())
            .or_insert_with(|| json!(prompt::prompt_fingerprint()));
        patch
            .entry("llm_model".to_string())
            .or_insert_with(|| json!(self.ctx.llm.model_name()));
        let merged = JobMeta::from_value(self.job.meta.as_ref()).merged_with(patch);
        serde_json::to_value(merged).unwrap_or(Value::Null)
    }

    /// Write the job's new status. Queue write failures are logged only: the
    /// stale-row sweeper will eventually recover the job.
    pub async fn mark(
        &self,
        status: JobStatus,
        canonical: Option<&ParsedAssignment>,
        error: Option<Value>,
        patch: Map<String, Value>,
    ) {
        let meta = self.merged_meta(patch);
        let canonical_value = canonical.and_then(|p| serde_json::to_value(p).ok());
        if let Err(e) = self
            .ctx
            .queue
            .mark(
                self.job.id,
                status,
                canonical_value.as_ref(),
                error.as_ref(),
                Some(&meta),
            )
            .await
        {
            warn!(error = %e, extraction_id = self.job.id, "mark extraction failed");
        }
    }

    pub fn count_failure(&self, reason: &str) {
        self.ctx
            .metrics
            .worker_parse_failure_total
            .with_label_values(&[
                self.channel_link.as_str(),
                reason,
                self.ctx.pipeline_version(),
            ])
            .inc();
    }

    pub fn observe_stage(&self, stage: &str, started: Instant) {
        self.ctx
            .metrics
            .worker_job_stage_latency_seconds
            .with_label_values(&[stage, self.ctx.pipeline_version()])
            .observe(started.elapsed().as_secs_f64());
    }
}

pub fn patch(entries: Value) -> Map<String, Value> {
    entries.as_object().cloned().unwrap_or_default()
}

fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub fn normalization_meta(normalized: &str) -> Value {
    json!({
        "sha256": sha256_hex(normalized),
        "chars": normalized.chars().count(),
        "preview": normalized.chars().take(200).collect::<String>(),
    })
}

/// LLM extraction guarded by the circuit breaker.
pub async fn guarded_extract(jc: &JobCtx<'_>, text: &str) -> Result<Value, LlmError> {
    llm_guarded(jc.ctx, text, &jc.channel_link, &jc.cid).await
}

/// Breaker-guarded extraction without a queue job (reprocess tooling).
pub async fn llm_guarded(
    ctx: &WorkerContext,
    text: &str,
    channel_link: &str,
    cid: &str,
) -> Result<Value, LlmError> {
    if let Err(retry_in) = ctx.breaker.admit() {
        ctx.metrics
            .llm_calls_total
            .with_label_values(&["circuit_open", ctx.pipeline_version()])
            .inc();
        ctx.metrics
            .llm_circuit_open
            .with_label_values(&[ctx.pipeline_version()])
            .set(1);
        return Err(LlmError::CircuitOpen {
            retry_in_seconds: retry_in,
        });
    }
    let result = ctx.llm.extract(text, channel_link, cid).await;
    match &result {
        Ok(_) => {
            ctx.breaker.on_success();
            ctx.metrics
                .llm_calls_total
                .with_label_values(&["ok", ctx.pipeline_version()])
                .inc();
        }
        Err(e) => {
            ctx.breaker.on_failure();
            ctx.metrics
                .llm_calls_total
                .with_label_values(&[e.code(), ctx.pipeline_version()])
                .inc();
        }
    }
    ctx.metrics
        .llm_circuit_open
        .with_label_values(&[ctx.pipeline_version()])
        .set(ctx.breaker.is_open() as i64);
    result
}

fn preserved_max_attempts_error(job: &ExtractionJob, attempt: u32) -> Value {
    // Keep the original cause visible even when the final condition is
    // exhausted attempts.
    match job.error_json.clone() {
        Some(Value::Object(mut prior)) => {
            prior.insert("attempt".to_string(), json!(attempt));
            prior.insert("final_error".to_string(), json!("max_attempts"));
            Value::Object(prior)
        }
        _ => json!({"error": "max_attempts", "attempt": attempt}),
    }
}

async fn handle_forwarded(jc: &JobCtx<'_>, raw: &RawMessage, raw_text: &str) -> JobOutcome {
    let last_seen = raw.edit_date.unwrap_or(raw.message_date);
    let candidates = compilation::extract_identifier_candidates(raw_text);
    let Some(code) = candidates.first() else {
        jc.mark(
            JobStatus::Skipped,
            None,
            None,
            patch(json!({"reason": "forwarded_no_code", "ts": Utc::now().to_rfc3339()})),
        )
        .await;
        return JobOutcome::Skipped;
    };

    // A forward re-announces an assignment posted elsewhere; bump it rather
    // than creating a new record. The bump never inserts, so racing normal
    // ingest of the same code stays consistent.
    let bump = jc
        .ctx
        .assignments
        .bump_by_external_id(code, None, last_seen)
        .await;
    let reason = if bump.bumped > 0 {
        "forwarded_bumped"
    } else {
        "forwarded"
    };
    info!(cid = %jc.cid, code, bumped = bump.bumped, "forwarded message handled");
    jc.mark(
        JobStatus::Skipped,
        None,
        None,
        patch(json!({
            "reason": reason,
            "code": code,
            "bump_res": serde_json::to_value(&bump).unwrap_or(Value::Null),
            "ts": Utc::now().to_rfc3339(),
        })),
    )
    .await;
    JobOutcome::Skipped
}

async fn handle_reply(jc: &JobCtx<'_>, raw: &RawMessage) -> JobOutcome {
    let last_seen = raw.edit_date.unwrap_or(raw.message_date);
    let bump_res = match raw.reply_to_msg_id() {
        Some(parent_id) => {
            let bump = jc
                .ctx
                .assignments
                .bump_by_message_ref(&jc.channel_link, &parent_id, last_seen)
                .await;
            serde_json::to_value(&bump).unwrap_or(Value::Null)
        }
        None => json!({"ok": false, "reason": "no reply_to_msg_id in message_json"}),
    };
    jc.mark(
        JobStatus::Skipped,
        None,
        None,
        patch(json!({
            "reason": "reply",
            "bump_res": bump_res,
            "ts": Utc::now().to_rfc3339(),
        })),
    )
    .await;
    JobOutcome::Skipped
}

async fn handle_deleted(jc: &JobCtx<'_>, raw: &RawMessage) -> JobOutcome {
    let payload = crate::standard::build_payload(
        jc,
        raw,
        &jc.ctx.channel_info(&jc.channel_link).await,
        raw.raw_text.clone().unwrap_or_default(),
        ParsedAssignment::default(),
    );
    let close_res = match jc.ctx.assignments.mark_closed(&payload).await {
        Ok(changed) => json!({"ok": true, "changed": changed}),
        Err(e) => json!({"ok": false, "error": e.to_string()}),
    };
    jc.mark(
        JobStatus::Skipped,
        None,
        None,
        patch(json!({
            "reason": "deleted",
            "close_res": close_res,
            "ts": Utc::now().to_rfc3339(),
        })),
    )
    .await;
    JobOutcome::Skipped
}

/// Compilation confirm step: LLM-enumerated identifier candidates filtered
/// through the policy grammar and verified as verbatim substrings. At least
/// two verified identifiers confirm a bundle.
async fn confirm_compilation(
    jc: &JobCtx<'_>,
    raw_text: &str,
) -> (bool, Vec<String>, Value) {
    let enumerated = match jc.ctx.breaker.admit() {
        Err(_) => Err(LlmError::CircuitOpen { retry_in_seconds: 0 }),
        Ok(()) => {
            let r = jc.ctx.llm.enumerate_identifiers(raw_text, &jc.cid).await;
            match &r {
                Ok(_) => jc.ctx.breaker.on_success(),
                Err(_) => jc.ctx.breaker.on_failure(),
            }
            r
        }
    };

    let candidates = match enumerated {
        Ok(c) => c,
        Err(e) => {
            // Without a confirm signal the message is processed as a single
            // assignment; a wrong downgrade is recoverable via reprocess.
            return (
                false,
                Vec::new(),
                json!({"ok": false, "parse_error": e.code()}),
            );
        }
    };

    let policy_filtered: Vec<String> = candidates
        .iter()
        .filter(|c| jc.ctx.identifier_re.is_match(c))
        .cloned()
        .collect();
    let (verified, dropped) = compilation::verify_identifiers(raw_text, &policy_filtered);
    let ordered = compilation::order_verified_identifiers(raw_text, &verified);
    let confirmed = ordered.len() >= 2;
    let audit = json!({
        "ok": true,
        "candidates": candidates,
        "policy_filtered": policy_filtered.len(),
        "verified": verified,
        "dropped": dropped,
        "confirmed": confirmed,
    });
    (confirmed, ordered, audit)
}

/// Process one claimed job end to end.
pub async fn work_one(ctx: &WorkerContext, job: &ExtractionJob) -> JobOutcome {
    let jc = JobCtx::new(ctx, job);
    let toggles = &ctx.cfg.worker;

    let attempt = job.attempt();
    if attempt >= toggles.max_attempts {
        jc.count_failure("max_attempts");
        jc.mark(
            JobStatus::Failed,
            None,
            Some(preserved_max_attempts_error(job, attempt)),
            patch(json!({"reason": "max_attempts", "ts": Utc::now().to_rfc3339()})),
        )
        .await;
        return JobOutcome::Failed;
    }
    if attempt > 1 && toggles.backoff_base_seconds > 0.0 {
        let delay = (toggles.backoff_base_seconds * 2f64.powi(attempt.saturating_sub(1) as i32))
            .min(toggles.backoff_max_seconds);
        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
    }

    let t_load = Instant::now();
    let ch_info = ctx.channel_info(&jc.channel_link).await;
    let raw = ctx.store.fetch_raw(job.raw_id).await;
    jc.observe_stage("load_raw", t_load);

    let Some(raw) = raw else {
        jc.count_failure("raw_missing");
        jc.mark(
            JobStatus::Failed,
            None,
            Some(json!({"error": "raw_missing"})),
            patch(json!({"ts": Utc::now().to_rfc3339()})),
        )
        .await;
        return JobOutcome::Failed;
    };

    // Guard order: deleted, forwarded, reply, empty.
    if raw.deleted_at.is_some() {
        return handle_deleted(&jc, &raw).await;
    }
    if raw.is_forward {
        let text = raw.raw_text.clone().unwrap_or_default();
        return handle_forwarded(&jc, &raw, &text).await;
    }
    if raw.is_reply {
        return handle_reply(&jc, &raw).await;
    }
    let raw_text = raw
        .raw_text
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if raw_text.is_empty() {
        jc.mark(
            JobStatus::Skipped,
            None,
            None,
            patch(json!({"reason": "empty_text", "ts": Utc::now().to_rfc3339()})),
        )
        .await;
        return JobOutcome::Skipped;
    }

    // Pre-LLM classifier: status-only / redirect / administrative posts.
    if let Some(detection) = non_assignment::detect(&raw_text) {
        jc.mark(
            JobStatus::Skipped,
            None,
            None,
            patch(json!({
                "reason": "non_assignment",
                "non_assignment_detection": {
                    "ok": true,
                    "is_non_assignment": true,
                    "message_type": detection.kind.as_str(),
                    "details": detection.details,
                },
                "ts": Utc::now().to_rfc3339(),
            })),
        )
        .await;
        ctx.delivery
            .triage(
                "non_assignment",
                &jc.channel_link,
                &raw_text,
                &format!("non_assignment: {} - {}", detection.kind.as_str(), detection.details),
                "pre_extraction_filter",
                &[],
            )
            .await;
        return JobOutcome::Skipped;
    }

    let normalized_text = normalize_text(&raw_text);
    let norm_meta = normalization_meta(&normalized_text);

    let thresholds = CompilationThresholds {
        code_hits: ctx.cfg.compilation.code_hits,
        label_hits: ctx.cfg.compilation.label_hits,
        postal_hits: ctx.cfg.compilation.postal_hits,
        url_hits: ctx.cfg.compilation.url_hits,
        block_count: ctx.cfg.compilation.block_count,
    };
    let (is_comp, triggers) = compilation::is_compilation(&raw_text, &thresholds);
    if is_comp {
        let (confirmed, ordered, audit) = confirm_compilation(&jc, &raw_text).await;
        info!(
            cid = %jc.cid,
            triggers = triggers.len(),
            verified = ordered.len(),
            confirmed,
            "compilation suspected"
        );
        ctx.delivery
            .triage(
                "compilation",
                &jc.channel_link,
                &raw_text,
                &format!(
                    "compilation_suspected: triggers=[{}]; verified_ids={}",
                    triggers.join("; ").chars().take(300).collect::<String>(),
                    ordered.len()
                ),
                "compilation_identifiers",
                &ordered,
            )
            .await;

        if confirmed {
            return crate::compilation::process_confirmed(
                &jc, &raw, &ch_info, &raw_text, &norm_meta, &triggers, &audit, &ordered, attempt,
            )
            .await;
        }
        info!(cid = %jc.cid, "compilation downgraded to standard path");
    }

    crate::standard::process_standard(&jc, &raw, &ch_info, &raw_text, &normalized_text, &norm_meta, attempt)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_error_preserves_original_cause() {
        let job = ExtractionJob {
            id: 1,
            pipeline_version: "v".to_string(),
            raw_id: 10,
            channel_link: Some("t.me/x".to_string()),
            message_id: Some("42".to_string()),
            status: None,
            meta: Some(json!({"attempt": 3})),
            error_json: Some(json!({"error": "persist_failed", "details": {"status": 500}})),
            created_at: None,
            updated_at: None,
        };
        let err = preserved_max_attempts_error(&job, 3);
        assert_eq!(err["error"], "persist_failed");
        assert_eq!(err["final_error"], "max_attempts");
        assert_eq!(err["attempt"], 3);

        let bare = ExtractionJob {
            error_json: None,
            ..job
        };
        let err = preserved_max_attempts_error(&bare, 3);
        assert_eq!(err["error"], "max_attempts");
    }

    #[test]
    fn normalization_meta_shape() {
        let meta = normalization_meta("hello world");
        assert_eq!(meta["chars"], 11);
        assert_eq!(meta["preview"], "hello world");
        assert_eq!(meta["sha256"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn patch_builder_tolerates_non_objects() {
        assert!(patch(json!(["not", "an", "object"])).is_empty());
        let p = patch(json!({"reason": "deleted"}));
        assert_eq!(p.get("reason").unwrap(), "deleted");
    }
}
