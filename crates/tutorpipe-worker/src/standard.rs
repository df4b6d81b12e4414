//! The standard (single-assignment) pipeline: LLM extract → enrichment →
//! schema validation → persist → fan-out.

use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;

use tutorpipe_core::types::{
    build_message_link, AssignmentPayload, ChannelInfo, JobStatus, ParsedAssignment, RawMessage,
};
use tutorpipe_extract::schema;

use crate::enrich::enrich_llm_output;
use crate::job::{guarded_extract, patch, JobCtx, JobOutcome};

/// Assemble the canonical payload handed to the persister and collaborators.
pub fn build_payload(
    jc: &JobCtx<'_>,
    raw: &RawMessage,
    ch_info: &ChannelInfo,
    raw_text: String,
    parsed: ParsedAssignment,
) -> AssignmentPayload {
    let channel_link = jc.channel_link.clone();
    let channel_username = channel_link
        .strip_prefix("t.me/")
        .map(str::to_string);
    AssignmentPayload {
        cid: jc.cid.clone(),
        pipeline_version: jc.ctx.pipeline_version().to_string(),
        channel_id: raw.channel_id.clone().or_else(|| ch_info.channel_id.clone()),
        channel_title: ch_info.title.clone(),
        channel_username,
        message_id: Some(raw.message_id.clone()),
        message_link: build_message_link(&channel_link, &raw.message_id),
        channel_link,
        date: Some(raw.message_date),
        source_last_seen: Some(raw.edit_date.unwrap_or(raw.message_date)),
        raw_text,
        parsed,
    }
}

pub async fn process_standard(
    jc: &JobCtx<'_>,
    raw: &RawMessage,
    ch_info: &ChannelInfo,
    raw_text: &str,
    normalized_text: &str,
    norm_meta: &Value,
    attempt: u32,
) -> JobOutcome {
    let ctx = jc.ctx;
    let toggles = &ctx.cfg.worker;
    let llm_input = if toggles.use_normalized_text_for_llm {
        normalized_text
    } else {
        raw_text
    };
    let llm_input_kind = if toggles.use_normalized_text_for_llm {
        "normalized"
    } else {
        "raw"
    };

    let t_llm = Instant::now();
    let llm_result = guarded_extract(jc, llm_input).await;
    jc.observe_stage("llm", t_llm);

    let llm_output = match llm_result {
        Ok(v) => v,
        Err(e) => {
            jc.count_failure(e.code());
            if e.is_transient() && attempt + 1 < toggles.max_attempts {
                jc.mark(
                    JobStatus::Pending,
                    None,
                    Some(json!({"error": e.code(), "detail": e.to_string()})),
                    patch(json!({
                        "attempt": attempt + 1,
                        "stage": "llm",
                        "llm_input": llm_input_kind,
                        "normalization": norm_meta,
                    })),
                )
                .await;
                return JobOutcome::Requeued;
            }
            jc.mark(
                JobStatus::Failed,
                None,
                Some(json!({"error": e.code(), "detail": e.to_string()})),
                patch(json!({
                    "stage": "llm",
                    "ts": Utc::now().to_rfc3339(),
                    "llm_input": llm_input_kind,
                    "normalization": norm_meta,
                })),
            )
            .await;
            ctx.delivery
                .triage(
                    "extraction_error",
                    &jc.channel_link,
                    raw_text,
                    &e.to_string(),
                    "llm",
                    &[],
                )
                .await;
            return JobOutcome::Failed;
        }
    };

    let agency = jc.channel_link.strip_prefix("t.me/");
    let enriched = enrich_llm_output(ctx, &llm_output, raw_text, normalized_text, agency).await;
    let payload = build_payload(jc, raw, ch_info, raw_text.to_string(), enriched.parsed);

    let t_validate = Instant::now();
    let (schema_ok, schema_errors) = schema::validate_parsed_assignment(&payload.parsed);
    jc.observe_stage("validate", t_validate);
    if !schema_ok {
        jc.count_failure("schema_validation_failed");
        let extracted_code = payload.parsed.assignment_code.clone();
        jc.mark(
            JobStatus::Failed,
            None,
            Some(json!({"error": "validation_failed", "errors": schema_errors.clone()})),
            patch(json!({
                "stage": "validation",
                "errors": schema_errors,
                "ts": Utc::now().to_rfc3339(),
                "llm_input": llm_input_kind,
                "normalization": norm_meta,
                "enrichment": enriched.meta,
            })),
        )
        .await;
        ctx.delivery
            .triage(
                "extraction_error",
                &jc.channel_link,
                raw_text,
                &format!("validation_failed: {schema_errors:?}"),
                "validation",
                &extracted_code.map(|c| vec![c]).unwrap_or_default(),
            )
            .await;
        return JobOutcome::Failed;
    }

    persist_and_finalize(jc, raw_text, &payload, norm_meta, llm_input_kind, &enriched.meta, attempt)
        .await
}

pub async fn persist_and_finalize(
    jc: &JobCtx<'_>,
    raw_text: &str,
    payload: &AssignmentPayload,
    norm_meta: &Value,
    llm_input_kind: &str,
    enrichment_meta: &Value,
    attempt: u32,
) -> JobOutcome {
    let ctx = jc.ctx;
    let toggles = &ctx.cfg.worker;

    let t_persist = Instant::now();
    let persist_res = ctx.assignments.persist(payload).await;
    jc.observe_stage("persist", t_persist);

    // Transient persist failures go back to pending while attempts remain.
    if !persist_res.ok && attempt + 1 < toggles.max_attempts {
        jc.count_failure("persist_failed");
        jc.mark(
            JobStatus::Pending,
            None,
            Some(json!({
                "error": "persist_failed",
                "details": serde_json::to_value(&persist_res).unwrap_or(Value::Null),
            })),
            patch(json!({
                "attempt": attempt + 1,
                "persist_error": serde_json::to_value(&persist_res).unwrap_or(Value::Null),
            })),
        )
        .await;
        return JobOutcome::Requeued;
    }

    // Fan-out happens on fresh inserts only: bumps and edits stay quiet.
    let is_insert = persist_res.is_insert();
    let broadcast_res = if is_insert && toggles.enable_broadcast {
        ctx.delivery.broadcast(payload).await
    } else {
        None
    };
    let dm_res = if is_insert && toggles.enable_dms {
        ctx.delivery.send_dms(payload).await
    } else {
        None
    };

    let ok = persist_res.ok;
    let meta = patch(json!({
        "ts": Utc::now().to_rfc3339(),
        "persist": serde_json::to_value(&persist_res).unwrap_or(Value::Null),
        "broadcast": broadcast_res,
        "dm": dm_res,
        "normalization": norm_meta,
        "llm_input": llm_input_kind,
        "enrichment": enrichment_meta,
    }));
    jc.mark(
        if ok { JobStatus::Ok } else { JobStatus::Failed },
        Some(&payload.parsed),
        (!ok).then(|| {
            json!({
                "error": "persist_failed",
                "details": serde_json::to_value(&persist_res).unwrap_or(Value::Null),
            })
        }),
        meta,
    )
    .await;

    if ok {
        ctx.metrics
            .worker_parse_success_total
            .with_label_values(&[jc.channel_link.as_str(), ctx.pipeline_version()])
            .inc();
        info!(cid = %jc.cid, action = ?persist_res.action, "assignment persisted");
        JobOutcome::Ok
    } else {
        jc.count_failure("persist_failed_final");
        ctx.delivery
            .triage(
                "extraction_error",
                &jc.channel_link,
                raw_text,
                &format!(
                    "persist_failed_final: {}",
                    persist_res.error.as_deref().unwrap_or("unknown")
                ),
                "persist",
                &[],
            )
            .await;
        JobOutcome::Failed
    }
}
