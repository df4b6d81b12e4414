//! The extraction prompt.
//!
//! The system message pins the output schema; the user message carries only
//! the post text. A sha256 fingerprint of the system prompt is attached to
//! job meta so reprocessing runs can tell which prompt produced a record.

use sha2::{Digest, Sha256};

pub const SYSTEM_PROMPT: &str = r#"You are an extractor that receives an unstructured tuition assignment post (English). Extract the keys below and normalize values.

Schema (output JSON):
{
    "assignment_code": string or null,          # Alphanumeric code if present, else null
    "academic_display_text": string or null,    # Raw academic tags from the post (e.g., "Sec 3 Express A Maths")
    "learning_mode": {
        "mode": "Online" | "Face-to-Face" | "Hybrid" | null,
        "raw_text": string or null
    },
    "address": [string] or null,                # Do not include nearest MRT here (multiple locations allowed)
    "postal_code": [string] or null,            # 6-digit codes, multiple allowed (match addresses when applicable)
    "nearest_mrt": [string] or null,
    "lesson_schedule": [string] or null,        # Raw schedule snippets, e.g. "1.5 Hr, 1x A Week"
    "start_date": string or null,               # Earliest start date mentioned, YYYY-MM-DD if possible else raw text
    "time_availability": {
        "explicit": { "monday": [string], ..., "sunday": [string] },   # "HH:MM-HH:MM" ranges stated in the post
        "estimated": { "monday": [string], ..., "sunday": [string] },  # estimated from fuzzy wording
        "note": string or null                                         # verbatim snippet for ambiguous timing
    },
    "rate": {
        "min": number or null,
        "max": number or null,
        "raw_text": string or null              # Raw rate text from the post
    },
    "additional_remarks": string or null,
    "tutor_types": [
        { "canonical": string, "original": string, "agency": string or null, "confidence": number }
    ] or null,
    "rate_breakdown": {
        "<tutor type>": { "min": number, "max": number, "original_text": string, "currency": string or null, "unit": string or null, "confidence": number }
    } or null
}

Normalization rules:
1. time_availability: include all 7 days in both maps even when empty. Explicit is only for timings stated in the post; a single time with no range becomes "HH:MM-HH:MM" with start == end.
2. Estimated windows: "after HH:MM" extends to 23:00; "before HH:MM" starts at 08:00; morning = 08:00-12:00, afternoon = 12:00-17:00, evening = 16:00-21:00, night = 19:00-23:00; weekdays/weekends with no time = 08:00-23:00 for the affected days.
3. rate: extract numeric min/max only when parsable; keep the raw text verbatim in raw_text.
4. Treat each field independently (atomic extraction); do not guess missing fields, use null.
5. Respond with a single JSON object only, stopping immediately after the last closing brace."#;

const USER_PROMPT_FOOTER: &str = "Now extract JSON from the following message. Return JSON only.\n\nMessage:\n\"\"\"\n{message}\n\"\"\"\n\nJSON:";

/// System prompt used by the compilation confirm step: enumerate the
/// identifier candidates in a bundle message.
pub const IDENTIFIER_PROMPT: &str = r#"You receive one message that may contain several tuition assignments. List every assignment identifier (job/assignment code) that appears, exactly as written in the message. Respond with a single JSON object: {"identifiers": [string]}. Do not invent identifiers; copy them verbatim. Respond with JSON only."#;

pub fn build_user_prompt(message: &str) -> String {
    USER_PROMPT_FOOTER.replace("{message}", message)
}

/// Stable fingerprint of the system prompt, recorded in job meta.
pub fn prompt_fingerprint() -> String {
    let digest = Sha256::digest(SYSTEM_PROMPT.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_embeds_message() {
        let p = build_user_prompt("hello post");
        assert!(p.contains("hello post"));
        assert!(p.ends_with("JSON:"));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        assert_eq!(prompt_fingerprint(), prompt_fingerprint());
        assert_eq!(prompt_fingerprint().len(), 16);
    }
}
