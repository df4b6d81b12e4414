//! Confirmed-compilation path: split the bundle into (identifier, segment)
//! pairs and run the standard pipeline per segment, aggregating results on
//! the parent job.

use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use tutorpipe_core::types::{ChannelInfo, JobStatus, RawMessage};
use tutorpipe_extract::{compilation, normalize_text, schema};

use crate::enrich::enrich_llm_output;
use crate::job::{guarded_extract, patch, JobCtx, JobOutcome};
use crate::standard::build_payload;

#[allow(clippy::too_many_arguments)]
pub async fn process_confirmed(
    jc: &JobCtx<'_>,
    raw: &RawMessage,
    ch_info: &ChannelInfo,
    raw_text: &str,
    norm_meta: &Value,
    triggers: &[String],
    audit: &Value,
    ordered: &[String],
    attempt: u32,
) -> JobOutcome {
    let ctx = jc.ctx;
    let toggles = &ctx.cfg.worker;
    let segments = compilation::split_by_identifiers(raw_text, ordered);

    let mut results: Vec<Value> = Vec::new();
    let mut any_failed = false;
    let mut any_requeueable_persist_fail = false;

    for (identifier, segment_text) in &segments {
        let identifier_norm = identifier.trim().to_uppercase();
        let normalized_segment = normalize_text(segment_text);
        let llm_input = if toggles.use_normalized_text_for_llm {
            normalized_segment.as_str()
        } else {
            segment_text.as_str()
        };

        let t_llm = Instant::now();
        let llm_result = guarded_extract(jc, llm_input).await;
        jc.observe_stage("llm", t_llm);

        let llm_output = match llm_result {
            Ok(v) => v,
            Err(e) => {
                any_failed = true;
                jc.count_failure(e.code());
                ctx.delivery
                    .triage(
                        "extraction_error",
                        &jc.channel_link,
                        segment_text,
                        &format!("compilation_segment_llm_failed: {e}"),
                        "compilation_llm",
                        std::slice::from_ref(&identifier_norm),
                    )
                    .await;
                results.push(json!({
                    "ok": false,
                    "identifier_verbatim": identifier,
                    "identifier_normalized": identifier_norm,
                    "segment_chars": segment_text.chars().count(),
                    "llm_error": e.code(),
                }));
                continue;
            }
        };

        let agency = jc.channel_link.strip_prefix("t.me/");
        let enriched =
            enrich_llm_output(ctx, &llm_output, segment_text, &normalized_segment, agency).await;
        let mut parsed = enriched.parsed;
        // The segment's identifier is authoritative: without it, every
        // segment of the bundle would collide on the synthetic message id.
        if parsed.assignment_code.is_none() {
            parsed.assignment_code = Some(identifier.clone());
        }
        let mut payload = build_payload(jc, raw, ch_info, segment_text.clone(), parsed);
        payload.cid = format!("{}:seg:{identifier_norm}", jc.cid);

        let (schema_ok, schema_errors) = schema::validate_parsed_assignment(&payload.parsed);
        if !schema_ok {
            any_failed = true;
            jc.count_failure("schema_validation_failed");
            ctx.delivery
                .triage(
                    "extraction_error",
                    &jc.channel_link,
                    segment_text,
                    &format!("compilation_segment_validation_failed: {schema_errors:?}"),
                    "compilation_validation",
                    std::slice::from_ref(&identifier_norm),
                )
                .await;
            results.push(json!({
                "ok": false,
                "identifier_verbatim": identifier,
                "identifier_normalized": identifier_norm,
                "segment_chars": segment_text.chars().count(),
                "validation_errors": schema_errors,
                "enrichment": enriched.meta,
            }));
            continue;
        }

        let t_persist = Instant::now();
        let persist_res = ctx.assignments.persist(&payload).await;
        jc.observe_stage("persist", t_persist);

        let is_insert = persist_res.is_insert();
        let broadcast_res = if is_insert && toggles.enable_broadcast {
            ctx.delivery.broadcast(&payload).await
        } else {
            None
        };
        let dm_res = if is_insert && toggles.enable_dms {
            ctx.delivery.send_dms(&payload).await
        } else {
            None
        };

        if !persist_res.ok {
            if attempt + 1 < toggles.max_attempts {
                any_requeueable_persist_fail = true;
            } else {
                any_failed = true;
            }
        }
        results.push(json!({
            "ok": persist_res.ok,
            "identifier_verbatim": identifier,
            "identifier_normalized": identifier_norm,
            "segment_chars": segment_text.chars().count(),
            "persist": serde_json::to_value(&persist_res).unwrap_or(Value::Null),
            "broadcast": broadcast_res,
            "dm": dm_res,
            "enrichment": enriched.meta,
        }));
    }

    if any_requeueable_persist_fail {
        jc.count_failure("persist_failed");
        jc.mark(
            JobStatus::Pending,
            None,
            Some(json!({"error": "persist_failed", "details": {"compilation_segments": results.clone()}})),
            patch(json!({
                "attempt": attempt + 1,
                "reason": "compilation_persist_failed",
                "compilation": {"triggers": triggers, "identifiers": audit, "segments": results},
            })),
        )
        .await;
        return JobOutcome::Requeued;
    }

    let ok = !segments.is_empty() && !any_failed;
    info!(
        cid = %jc.cid,
        segments = segments.len(),
        ok,
        "compilation processed"
    );
    jc.mark(
        if ok { JobStatus::Ok } else { JobStatus::Failed },
        None,
        (!ok).then(|| json!({"error": "compilation_failed", "segments": results.len()})),
        patch(json!({
            "ts": Utc::now().to_rfc3339(),
            "reason": "compilation_processed",
            "compilation_details": triggers,
            "compilation": {"identifiers": audit, "segments": results},
            "normalization": norm_meta,
        })),
    )
    .await;

    if ok {
        JobOutcome::Ok
    } else {
        ctx.delivery
            .triage(
                "extraction_error",
                &jc.channel_link,
                raw_text,
                "compilation_failed",
                "compilation",
                ordered,
            )
            .await;
        JobOutcome::Failed
    }
}
