//! Deterministic enrichment between the LLM call and schema validation:
//! postal fill → postal estimation → deterministic time → hard validation →
//! signals. Every step records its metadata; none of them abort the job.

use serde_json::{json, Value};
use tracing::debug;

use tutorpipe_core::config::HardValidateMode;
use tutorpipe_core::types::ParsedAssignment;
use tutorpipe_extract::{hard, postal, signals, time};

use crate::context::WorkerContext;

pub struct Enriched {
    pub parsed: ParsedAssignment,
    pub meta: Value,
}

/// Run the full enrichment pipeline over the raw LLM output.
pub async fn enrich_llm_output(
    ctx: &WorkerContext,
    llm_output: &Value,
    raw_text: &str,
    normalized_text: &str,
    agency: Option<&str>,
) -> Enriched {
    let toggles = &ctx.cfg.worker;
    let mut parsed = hard::coerce(llm_output);

    // 1. Explicit postal codes from the text, always.
    postal::fill_postal_code_from_text(&mut parsed, raw_text);

    // 2. Geocoder estimation when still empty and an address exists.
    let postal_estimated_meta = if toggles.enable_postal_code_estimated {
        Some(estimate_postal(ctx, &mut parsed, raw_text).await)
    } else {
        None
    };

    // 3. Deterministic time availability overwrites the LLM's fields.
    let time_meta = if toggles.use_deterministic_time {
        let (availability, meta) = time::extract_time_availability(raw_text, normalized_text);
        parsed.time_availability = availability;
        let spans = meta.matched_spans.len();
        Some(json!({
            "ok": true,
            "rules_fired": meta.rules_fired,
            "parse_warnings": meta.parse_warnings,
            "matched_spans": serde_json::to_value(
                meta.matched_spans.iter().take(50).collect::<Vec<_>>()
            ).unwrap_or(Value::Null),
            "matched_span_count": spans,
        }))
    } else {
        None
    };

    // 4. Hard validation per configured mode.
    let hard_meta = match toggles.hard_validate_mode {
        HardValidateMode::Off => None,
        mode => {
            let value = serde_json::to_value(&parsed).unwrap_or(Value::Null);
            let (cleaned, violations) = hard::hard_validate(&value, raw_text);
            let meta = json!({
                "mode": match mode { HardValidateMode::Report => "report", _ => "enforce" },
                "violations_count": violations.len(),
                "violations": serde_json::to_value(violations.iter().take(50).collect::<Vec<_>>())
                    .unwrap_or(Value::Null),
            });
            if mode == HardValidateMode::Enforce {
                parsed = cleaned;
            }
            Some(meta)
        }
    };

    // 5. Deterministic matching signals, meta only.
    let signals_meta = if toggles.enable_deterministic_signals {
        let s = signals::build_signals(&parsed, raw_text, normalized_text, agency);
        Some(json!({
            "ok": true,
            "summary": {
                "subjects": s.subjects.len(),
                "levels": s.levels.len(),
                "tutor_types": s.tutor_types.len(),
            },
            "signals": serde_json::to_value(&s).unwrap_or(Value::Null),
        }))
    } else {
        None
    };

    let meta = json!({
        "postal_code_estimated": postal_estimated_meta,
        "time_deterministic": time_meta,
        "hard_validation": hard_meta,
        "signals": signals_meta,
    });
    Enriched { parsed, meta }
}

async fn estimate_postal(ctx: &WorkerContext, parsed: &mut ParsedAssignment, raw_text: &str) -> Value {
    if parsed
        .postal_code
        .as_ref()
        .is_some_and(|codes| !codes.is_empty())
    {
        return json!({"ok": true, "skipped": "postal_present"});
    }
    if !ctx.geocoder.enabled() {
        return json!({"ok": true, "skipped": "geocoder_disabled"});
    }
    let candidates = postal::address_candidates(parsed, raw_text);
    if candidates.is_empty() {
        parsed.postal_code_estimated = None;
        return json!({"ok": true, "skipped": "missing_address"});
    }

    let mut estimated: Vec<String> = Vec::new();
    for address in &candidates {
        if let Some(code) = ctx.geocoder.estimate_postal(address).await {
            if !estimated.contains(&code) {
                estimated.push(code);
            }
        }
    }
    debug!(addresses = candidates.len(), estimated = estimated.len(), "postal estimation done");
    let found = estimated.len();
    parsed.postal_code_estimated = (!estimated.is_empty()).then_some(estimated);
    json!({"ok": true, "addresses": candidates.len(), "estimated": found})
}
