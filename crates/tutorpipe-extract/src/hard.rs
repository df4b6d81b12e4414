//! Hard validator over the raw LLM output.
//!
//! Takes the untyped JSON the extractor produced and returns a typed,
//! cleaned [`ParsedAssignment`] plus the list of violations. Invalid values
//! are nulled or dropped, never "fixed up": the cleaned record must
//! revalidate with zero violations.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tutorpipe_core::types::{
    LearningMode, LearningModeField, ParsedAssignment, Rate, RateBreakdownEntry, TimeAvailability,
    TutorType,
};

use crate::taxonomy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub path: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

fn violation(path: &str, code: &str, message: &str, evidence: Option<&str>) -> Violation {
    Violation {
        path: path.to_string(),
        code: code.to_string(),
        message: message.to_string(),
        evidence: evidence.map(|e| e.chars().take(200).collect()),
    }
}

// --- support checks --------------------------------------------------------

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static REMARKS_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(remarks|remark|notes|note|additional\s+requirement|additional\s+requirements|comment|comments)\s*:")
        .unwrap()
});

/// Whitespace-fold and lowercase for substring-support comparisons.
pub fn normalize_ws_for_match(text: &str) -> String {
    WS_RE.replace_all(text, " ").trim().to_lowercase()
}

pub fn has_remarks_marker(raw_text: &str) -> bool {
    REMARKS_MARKER_RE.is_match(raw_text)
}

/// A value is supported when, whitespace-folded and lowercased, it is a
/// substring of the raw text treated the same way.
pub fn substring_supported(raw_text: &str, value: &str) -> bool {
    let needle = normalize_ws_for_match(value);
    if needle.is_empty() {
        return true;
    }
    normalize_ws_for_match(raw_text).contains(&needle)
}

/// "tutor to quote", "market rate", "tbc" and friends: a rate whose text asks
/// for a quote carries no usable min/max.
pub fn rate_is_quote_like(rate_raw_text: Option<&str>) -> bool {
    let s = normalize_ws_for_match(rate_raw_text.unwrap_or(""));
    if s.is_empty() {
        return false;
    }
    const STRONG: &[&str] = &[
        "tutor to quote",
        "please quote",
        "pls quote",
        "market rate",
        "mkt rate",
        "quote",
        "tbc",
    ];
    if STRONG.iter().any(|x| s.contains(x)) {
        return true;
    }
    // "negotiable" only counts when the text is obviously about the rate.
    s.contains("negotiable")
        && (s.contains("rate") || s.contains('$') || s.contains("per hour") || s.contains("/hr") || s.contains("p/h"))
}

// --- scalar coercion helpers -----------------------------------------------

fn safe_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        _ => None,
    }
}

static NUMERIC_STR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").unwrap());

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let t = s.trim();
            NUMERIC_STR_RE.is_match(t).then(|| t.parse().ok()).flatten()
        }
        _ => None,
    }
}

static TIME_SLOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}:\d{2}-\d{2}:\d{2}$").unwrap());
static SLOT_DASH_WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*-\s*").unwrap());

/// Returns (cleaned_slot, error_code).
fn validate_time_slot(slot: &Value) -> (Option<String>, Option<&'static str>) {
    let s = match slot {
        Value::Null => return (None, Some("null_slot")),
        Value::String(s) => s,
        _ => return (None, Some("non_string_slot")),
    };
    let s = s.trim();
    if s.is_empty() {
        return (None, Some("empty_slot"));
    }
    let s = crate::normalize::fold_dashes(s);
    let s = SLOT_DASH_WS_RE.replace_all(&s, "-").to_string();

    if !TIME_SLOT_RE.is_match(&s) {
        return (None, Some("format"));
    }
    let (start, end) = s.split_once('-').expect("slot shape checked");
    let parse = |t: &str| -> Option<(u32, u32)> {
        let (h, m) = t.split_once(':')?;
        Some((h.parse().ok()?, m.parse().ok()?))
    };
    match (parse(start), parse(end)) {
        (Some((sh, sm)), Some((eh, em))) => {
            if sh > 23 || eh > 23 || sm > 59 || em > 59 {
                (None, Some("clock"))
            } else if (sh, sm) > (eh, em) {
                (None, Some("start_after_end"))
            } else {
                (Some(s), None)
            }
        }
        _ => (None, Some("parse")),
    }
}

// --- field cleaners --------------------------------------------------------

fn clean_str_list(path: &str, v: Option<&Value>, out: &mut Vec<Violation>) -> Option<Vec<String>> {
    let v = v?;
    if v.is_null() {
        return None;
    }
    let Some(arr) = v.as_array() else {
        out.push(violation(path, "TYPE", "Expected list of strings or null", None));
        return None;
    };
    let mut items = Vec::new();
    for (i, item) in arr.iter().enumerate() {
        match item {
            Value::String(s) => {
                let t = s.trim();
                if !t.is_empty() {
                    items.push(t.to_string());
                }
            }
            _ => out.push(violation(&format!("{path}[{i}]"), "TYPE", "Expected string", None)),
        }
    }
    (!items.is_empty()).then_some(items)
}

fn clean_day_map(
    path: &str,
    v: Option<&Value>,
    out: &mut Vec<Violation>,
) -> tutorpipe_core::types::DayMap {
    use tutorpipe_core::types::{Day, DayMap};
    let mut map = DayMap::default();
    let Some(obj) = v.and_then(|v| v.as_object()) else {
        if v.is_some_and(|v| !v.is_null()) {
            out.push(violation(path, "TYPE", "Expected object", None));
        }
        return map;
    };
    for day in Day::ALL {
        let Some(val) = obj.get(day.as_str()) else { continue };
        if val.is_null() {
            continue;
        }
        let Some(arr) = val.as_array() else {
            out.push(violation(&format!("{path}.{day}"), "TYPE", "Expected list", None));
            continue;
        };
        for (i, slot) in arr.iter().enumerate() {
            let (cleaned, err) = validate_time_slot(slot);
            if let Some(code) = err {
                out.push(violation(
                    &format!("{path}.{day}[{i}]"),
                    "TIME",
                    &format!("Invalid time slot ({code})"),
                    Some(&slot.to_string()),
                ));
                continue;
            }
            if let Some(s) = cleaned {
                map.push_unique(day, &s);
            }
        }
    }
    map
}

fn clean_scalar_string(
    data: &Value,
    key: &str,
    out: &mut Vec<Violation>,
) -> Option<String> {
    let v = data.get(key)?;
    if v.is_null() {
        return None;
    }
    if !v.is_string() {
        out.push(violation(key, "TYPE", "Expected string or null", None));
        return None;
    }
    safe_str(v)
}

fn clean_learning_mode(data: &Value, out: &mut Vec<Violation>) -> LearningModeField {
    let lm = data.get("learning_mode");
    let Some(obj) = lm.and_then(|v| v.as_object()) else {
        if lm.is_some_and(|v| !v.is_null()) {
            out.push(violation("learning_mode", "TYPE", "Expected object", None));
        }
        return LearningModeField::default();
    };

    let mode = match obj.get("mode") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => match s.as_str() {
            "Online" => Some(LearningMode::Online),
            "Face-to-Face" => Some(LearningMode::FaceToFace),
            "Hybrid" => Some(LearningMode::Hybrid),
            _ => {
                out.push(violation("learning_mode.mode", "ENUM", "Invalid mode", Some(s)));
                None
            }
        },
        Some(_) => {
            out.push(violation("learning_mode.mode", "ENUM", "Invalid mode", None));
            None
        }
    };

    let raw_text = match obj.get("raw_text") {
        None | Some(Value::Null) => None,
        Some(v @ Value::String(_)) => safe_str(v),
        Some(_) => {
            out.push(violation("learning_mode.raw_text", "TYPE", "Expected string or null", None));
            None
        }
    };

    LearningModeField { mode, raw_text }
}

fn clean_rate(data: &Value, raw_missing_rule: bool, out: &mut Vec<Violation>) -> Rate {
    let rate = data.get("rate");
    let Some(obj) = rate.and_then(|v| v.as_object()) else {
        if rate.is_some_and(|v| !v.is_null()) {
            out.push(violation("rate", "TYPE", "Expected object", None));
        }
        return Rate::default();
    };

    let raw_text = match obj.get("raw_text") {
        None | Some(Value::Null) => None,
        Some(v @ Value::String(_)) => safe_str(v),
        Some(_) => {
            out.push(violation("rate.raw_text", "TYPE", "Expected string or null", None));
            None
        }
    };

    let mut coerce_bound = |key: &str| -> Option<f64> {
        match obj.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = coerce_number(v);
                if n.is_none() {
                    out.push(violation(
                        &format!("rate.{key}"),
                        "TYPE",
                        "Expected number or numeric string",
                        None,
                    ));
                }
                n
            }
        }
    };
    let mut min = coerce_bound("min");
    let mut max = coerce_bound("max");

    if raw_missing_rule {
        if (min.is_some() || max.is_some()) && raw_text.is_none() {
            out.push(violation("rate", "RATE", "min/max present but raw_text is null", None));
            min = None;
            max = None;
        }
        if rate_is_quote_like(raw_text.as_deref()) {
            if min.is_some() || max.is_some() {
                out.push(violation("rate", "RATE", "Quote-like raw_text; forcing min/max null", None));
            }
            min = None;
            max = None;
        }
        if let (Some(a), Some(b)) = (min, max) {
            if a > b {
                out.push(violation("rate", "RATE", "min > max; forcing both null", None));
                min = None;
                max = None;
            }
        }
    }

    Rate { min, max, raw_text }
}

fn clean_tutor_types(data: &Value, out: &mut Vec<Violation>) -> Option<Vec<TutorType>> {
    let tt = data.get("tutor_types")?;
    if tt.is_null() {
        return None;
    }
    let Some(arr) = tt.as_array() else {
        out.push(violation("tutor_types", "TYPE", "Expected list or null", None));
        return None;
    };
    let mut items = Vec::new();
    for (i, item) in arr.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            out.push(violation(&format!("tutor_types[{i}]"), "TYPE", "Expected object", None));
            continue;
        };
        let canonical = obj.get("canonical").and_then(safe_str);
        let original = obj.get("original").and_then(safe_str);
        let agency = obj.get("agency").and_then(safe_str);
        let mut confidence = obj.get("confidence").and_then(coerce_number);
        let Some(canonical) = canonical else {
            out.push(violation(
                &format!("tutor_types[{i}].canonical"),
                "REQUIRED",
                "Missing canonical",
                None,
            ));
            continue;
        };
        if confidence.is_some_and(|c| !(0.0..=1.0).contains(&c)) {
            out.push(violation(
                &format!("tutor_types[{i}].confidence"),
                "RANGE",
                "Expected 0.0-1.0",
                None,
            ));
            confidence = None;
        }
        items.push(TutorType {
            canonical,
            original,
            agency,
            confidence,
        });
    }
    (!items.is_empty()).then_some(items)
}

fn clean_rate_breakdown(
    data: &Value,
    out: &mut Vec<Violation>,
) -> Option<BTreeMap<String, RateBreakdownEntry>> {
    let rb = data.get("rate_breakdown")?;
    if rb.is_null() {
        return None;
    }
    let Some(obj) = rb.as_object() else {
        out.push(violation("rate_breakdown", "TYPE", "Expected object or null", None));
        return None;
    };
    let mut map = BTreeMap::new();
    for (k, v) in obj {
        let Some(entry) = v.as_object() else {
            out.push(violation(&format!("rate_breakdown.{k}"), "TYPE", "Expected object", None));
            continue;
        };
        let mut bound = |key: &str| -> Option<i64> {
            match entry.get(key) {
                None | Some(Value::Null) => None,
                Some(v) => {
                    let n = coerce_number(v).map(|f| f.round() as i64);
                    if n.is_none() {
                        out.push(violation(
                            &format!("rate_breakdown.{k}.{key}"),
                            "TYPE",
                            "Expected number or null",
                            None,
                        ));
                    }
                    n
                }
            }
        };
        let mut min = bound("min");
        let mut max = bound("max");
        let mut confidence = entry.get("confidence").and_then(coerce_number);
        if confidence.is_some_and(|c| !(0.0..=1.0).contains(&c)) {
            out.push(violation(
                &format!("rate_breakdown.{k}.confidence"),
                "RANGE",
                "Expected 0.0-1.0",
                None,
            ));
            confidence = None;
        }
        if let (Some(a), Some(b)) = (min, max) {
            if a > b {
                out.push(violation(&format!("rate_breakdown.{k}"), "RATE", "min>max; forcing null", None));
                min = None;
                max = None;
            }
        }
        map.insert(
            k.clone(),
            RateBreakdownEntry {
                min,
                max,
                original_text: entry.get("original_text").and_then(safe_str),
                currency: entry.get("currency").and_then(safe_str),
                unit: entry.get("unit").and_then(safe_str),
                confidence,
            },
        );
    }
    (!map.is_empty()).then_some(map)
}

// --- canonicalization ------------------------------------------------------

fn dedupe_list(v: &mut Option<Vec<String>>) {
    if let Some(items) = v {
        let mut seen: Vec<String> = Vec::new();
        items.retain(|s| {
            let key = s.to_lowercase();
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
        if items.is_empty() {
            *v = None;
        }
    }
}

/// Deterministic canonicalization: de-dupe arrays and re-normalize tutor-type
/// labels through the shared taxonomy. Does not infer new values.
pub fn canonicalize(parsed: &mut ParsedAssignment) {
    dedupe_list(&mut parsed.address);
    dedupe_list(&mut parsed.postal_code);
    dedupe_list(&mut parsed.postal_code_estimated);
    dedupe_list(&mut parsed.nearest_mrt);
    dedupe_list(&mut parsed.lesson_schedule);

    if let Some(types) = parsed.tutor_types.take() {
        let mut out: Vec<TutorType> = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for t in types {
            let (canon, conf) = match t.original.as_deref() {
                Some(orig) => {
                    let (c, _, cf) = taxonomy::normalize_label(orig, t.agency.as_deref());
                    if c == taxonomy::UNKNOWN && !t.canonical.trim().is_empty() {
                        (t.canonical.clone(), t.confidence)
                    } else {
                        (c, Some(cf))
                    }
                }
                None => (t.canonical.clone(), t.confidence),
            };
            let canon = if canon.trim().is_empty() {
                taxonomy::UNKNOWN.to_string()
            } else {
                canon
            };
            let key = canon.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            out.push(TutorType {
                canonical: canon,
                original: t.original,
                agency: t.agency,
                confidence: conf,
            });
        }
        parsed.tutor_types = (!out.is_empty()).then_some(out);
    }
}

// --- entry points ----------------------------------------------------------

fn clean(parsed: &Value, raw_text: &str, enforce: bool) -> (ParsedAssignment, Vec<Violation>) {
    let mut violations = Vec::new();
    let data = parsed;

    let mut out = ParsedAssignment {
        assignment_code: clean_scalar_string(data, "assignment_code", &mut violations),
        academic_display_text: clean_scalar_string(data, "academic_display_text", &mut violations),
        start_date: clean_scalar_string(data, "start_date", &mut violations),
        learning_mode: clean_learning_mode(data, &mut violations),
        address: clean_str_list("address", data.get("address"), &mut violations),
        postal_code: clean_str_list("postal_code", data.get("postal_code"), &mut violations),
        postal_code_estimated: clean_str_list(
            "postal_code_estimated",
            data.get("postal_code_estimated"),
            &mut violations,
        ),
        nearest_mrt: clean_str_list("nearest_mrt", data.get("nearest_mrt"), &mut violations),
        lesson_schedule: clean_str_list("lesson_schedule", data.get("lesson_schedule"), &mut violations),
        rate: clean_rate(data, enforce, &mut violations),
        tutor_types: clean_tutor_types(data, &mut violations),
        rate_breakdown: clean_rate_breakdown(data, &mut violations),
        ..ParsedAssignment::default()
    };

    // time_availability
    let ta = data.get("time_availability");
    if ta.is_some_and(|v| !v.is_null() && !v.is_object()) {
        violations.push(violation("time_availability", "TYPE", "Expected object", None));
    }
    let note = match ta.and_then(|v| v.get("note")) {
        None | Some(Value::Null) => None,
        Some(v @ Value::String(_)) => safe_str(v),
        Some(_) => {
            violations.push(violation("time_availability.note", "TYPE", "Expected string or null", None));
            None
        }
    };
    out.time_availability = TimeAvailability {
        explicit: clean_day_map(
            "time_availability.explicit",
            ta.and_then(|v| v.get("explicit")),
            &mut violations,
        ),
        estimated: clean_day_map(
            "time_availability.estimated",
            ta.and_then(|v| v.get("estimated")),
            &mut violations,
        ),
        note,
    };

    // additional_remarks must be marker-introduced and substring-supported.
    let ar = match data.get("additional_remarks") {
        None | Some(Value::Null) => None,
        Some(v @ Value::String(_)) => safe_str(v),
        Some(_) => {
            violations.push(violation("additional_remarks", "TYPE", "Expected string or null", None));
            None
        }
    };
    out.additional_remarks = match ar {
        Some(text) if enforce => {
            if !has_remarks_marker(raw_text) {
                violations.push(violation(
                    "additional_remarks",
                    "SUPPORT",
                    "No remarks marker in raw; forcing null",
                    Some(&text),
                ));
                None
            } else if !substring_supported(raw_text, &text) {
                violations.push(violation(
                    "additional_remarks",
                    "SUPPORT",
                    "Not supported by raw text; forcing null",
                    Some(&text),
                ));
                None
            } else {
                Some(text)
            }
        }
        other => other,
    };

    canonicalize(&mut out);
    (out, violations)
}

/// Full validation: cleaned record + violations. The cleaned record always
/// revalidates with zero violations.
pub fn hard_validate(parsed: &Value, raw_text: &str) -> (ParsedAssignment, Vec<Violation>) {
    clean(parsed, raw_text, true)
}

/// Lenient coercion for `off`/`report` modes: type-level cleaning only, no
/// rule-based nulling (quote-like rates and unsupported remarks survive).
pub fn coerce(parsed: &Value) -> ParsedAssignment {
    clean(parsed, "", false).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quote_like_rate_forces_null_minmax() {
        let input = json!({
            "rate": {"min": 40, "max": 60, "raw_text": "pls quote"}
        });
        let (cleaned, violations) = hard_validate(&input, "Rate: pls quote");
        assert_eq!(cleaned.rate.min, None);
        assert_eq!(cleaned.rate.max, None);
        assert_eq!(cleaned.rate.raw_text.as_deref(), Some("pls quote"));
        assert!(violations.iter().any(|v| v.code == "RATE"));
    }

    #[test]
    fn rate_without_raw_text_forces_null() {
        let input = json!({"rate": {"min": 40, "max": 60, "raw_text": null}});
        let (cleaned, violations) = hard_validate(&input, "");
        assert_eq!(cleaned.rate.min, None);
        assert_eq!(cleaned.rate.max, None);
        assert!(violations.iter().any(|v| v.code == "RATE"));
    }

    #[test]
    fn min_greater_than_max_nulls_both() {
        let input = json!({"rate": {"min": 90, "max": 60, "raw_text": "$90-60"}});
        let (cleaned, _) = hard_validate(&input, "");
        assert_eq!(cleaned.rate.min, None);
        assert_eq!(cleaned.rate.max, None);
    }

    #[test]
    fn numeric_strings_coerce() {
        let input = json!({"rate": {"min": "40", "max": "60.5", "raw_text": "$40-60"}});
        let (cleaned, violations) = hard_validate(&input, "");
        assert_eq!(cleaned.rate.min, Some(40.0));
        assert_eq!(cleaned.rate.max, Some(60.5));
        assert!(violations.is_empty());
    }

    #[test]
    fn unknown_learning_mode_becomes_null() {
        let input = json!({"learning_mode": {"mode": "Remote", "raw_text": "remote ok"}});
        let (cleaned, violations) = hard_validate(&input, "");
        assert_eq!(cleaned.learning_mode.mode, None);
        assert_eq!(cleaned.learning_mode.raw_text.as_deref(), Some("remote ok"));
        assert!(violations.iter().any(|v| v.code == "ENUM"));
    }

    #[test]
    fn non_string_list_entries_dropped() {
        let input = json!({"address": ["Blk 1", 42, null, "  ", "Blk 1"]});
        let (cleaned, violations) = hard_validate(&input, "");
        assert_eq!(cleaned.address, Some(vec!["Blk 1".to_string()]));
        assert_eq!(violations.iter().filter(|v| v.code == "TYPE").count(), 2);
    }

    #[test]
    fn bad_time_slots_dropped_good_ones_kept() {
        let input = json!({
            "time_availability": {
                "explicit": {
                    "monday": ["19:00-21:00", "25:00-26:00", "21:00-19:00", "7pm-9pm", "19:00 - 21:00"],
                    "tuesday": null
                },
                "estimated": {},
                "note": "  flexible  "
            }
        });
        let (cleaned, violations) = hard_validate(&input, "");
        assert_eq!(cleaned.time_availability.explicit.monday, vec!["19:00-21:00"]);
        assert!(cleaned.time_availability.explicit.tuesday.is_empty());
        assert_eq!(cleaned.time_availability.note.as_deref(), Some("flexible"));
        let time_violations: Vec<_> =
            violations.iter().filter(|v| v.code == "TIME").collect();
        assert_eq!(time_violations.len(), 3);
    }

    #[test]
    fn remarks_need_marker_and_substring_support() {
        let input = json!({"additional_remarks": "prefers female tutor"});
        // no marker in raw text
        let (cleaned, violations) = hard_validate(&input, "some post with no marker");
        assert_eq!(cleaned.additional_remarks, None);
        assert!(violations.iter().any(|v| v.code == "SUPPORT"));

        // marker but remark not in text
        let (cleaned, _) = hard_validate(&input, "Remarks: something else entirely");
        assert_eq!(cleaned.additional_remarks, None);

        // marker and supported (whitespace-folded, case-insensitive)
        let raw = "Remarks:  Prefers   FEMALE tutor please";
        let (cleaned, violations) = hard_validate(&input, raw);
        assert_eq!(cleaned.additional_remarks.as_deref(), Some("prefers female tutor"));
        assert!(!violations.iter().any(|v| v.code == "SUPPORT"));
    }

    #[test]
    fn tutor_types_canonicalized_and_deduped() {
        let input = json!({
            "tutor_types": [
                {"canonical": "whatever", "original": "PT"},
                {"canonical": "part-timer", "original": "part time"},
                {"original": "no canonical here"}
            ]
        });
        let (cleaned, violations) = hard_validate(&input, "");
        let types = cleaned.tutor_types.expect("types kept");
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].canonical, "part-timer");
        assert!(violations.iter().any(|v| v.code == "REQUIRED"));
    }

    #[test]
    fn validator_output_is_a_fixed_point() {
        let raw = "Remarks: prefers female tutor\nRate: pls quote";
        let input = json!({
            "assignment_code": "  A123 ",
            "learning_mode": {"mode": "Bad", "raw_text": 5},
            "address": ["Blk 5", "blk 5", 9],
            "postal_code": ["529123", "529123"],
            "time_availability": {
                "explicit": {"monday": ["9pm", "19:00-21:00"]},
                "estimated": {"sunday": ["08:00-15:00"]},
                "note": 4
            },
            "rate": {"min": 40, "max": "60", "raw_text": "pls quote"},
            "additional_remarks": "prefers female tutor",
            "tutor_types": [{"canonical": "x", "original": "FT"}],
            "rate_breakdown": {"full-timer": {"min": 50, "max": 40}}
        });
        let (cleaned, first_violations) = hard_validate(&input, raw);
        assert!(!first_violations.is_empty());

        let reencoded = serde_json::to_value(&cleaned).unwrap();
        let (cleaned2, second_violations) = hard_validate(&reencoded, raw);
        assert_eq!(cleaned, cleaned2, "second pass must not change the record");
        assert!(
            second_violations.is_empty(),
            "clean output revalidated with violations: {second_violations:?}"
        );
    }

    #[test]
    fn coerce_keeps_rule_level_values() {
        let input = json!({
            "rate": {"min": 40, "max": 60, "raw_text": "pls quote"},
            "additional_remarks": "unsupported remark"
        });
        let lenient = coerce(&input);
        assert_eq!(lenient.rate.min, Some(40.0));
        assert_eq!(lenient.additional_remarks.as_deref(), Some("unsupported remark"));
    }
}
