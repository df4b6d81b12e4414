//! Compilation (multi-post bundle) detection and splitting.
//!
//! Detection is a cheap heuristic over the raw text. Splitting only happens
//! after the worker's confirm step has verified every identifier as a
//! verbatim substring of the message.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Thresholds for the heuristic. Mirrors the config surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationThresholds {
    pub code_hits: usize,
    pub label_hits: usize,
    pub postal_hits: usize,
    pub url_hits: usize,
    pub block_count: usize,
}

impl Default for CompilationThresholds {
    fn default() -> Self {
        Self {
            code_hits: 3,
            label_hits: 5,
            postal_hits: 3,
            url_hits: 3,
            block_count: 12,
        }
    }
}

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*(Subject|Rate|Address|Location):").unwrap());
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(code|assignment|job|id)\s*[:#]\s*\w+").unwrap());
static POSTAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{6}\b").unwrap());
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://|t\.me/|www\.").unwrap());
static BLOCK_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());

// Identifier candidate shapes. The hint form accepts anything after a code
// label; the hashtag/token forms follow the policy grammar (leading letter +
// digits + short suffix). Bare 6-digit postal-like tokens are always dropped.
static CODE_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:code\s*id|assignment\s*code|assignment|job|code|id)\s*[:#]\s*([A-Za-z0-9][A-Za-z0-9_-]{2,24})").unwrap()
});
static HASHTAG_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#([A-Za-z]\d{3,10}[A-Za-z0-9]{0,6})\b").unwrap());
static TOKEN_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z]\d{3,10}[A-Za-z0-9]{0,6})\b").unwrap());

/// Heuristic compilation check. Returns the list of triggered rules so the
/// worker can log and triage them.
pub fn is_compilation(text: &str, thresholds: &CompilationThresholds) -> (bool, Vec<String>) {
    if text.trim().is_empty() {
        return (false, Vec::new());
    }

    let code_hits = CODE_RE.find_iter(text).count();
    let label_hits = LABEL_RE.find_iter(text).count();
    let postal_hits = {
        let mut codes: Vec<&str> = POSTAL_RE.find_iter(text).map(|m| m.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();
        codes.len()
    };
    let url_hits = URL_RE.find_iter(text).count();
    let block_count = BLOCK_SPLIT_RE
        .split(text)
        .filter(|b| !b.trim().is_empty())
        .count();

    let mut triggered = Vec::new();
    if code_hits >= thresholds.code_hits {
        triggered.push(format!(
            "Multiple assignment codes detected ({code_hits} codes found, threshold: {})",
            thresholds.code_hits
        ));
    }
    if label_hits >= thresholds.label_hits && block_count >= 2 {
        triggered.push(format!(
            "Multiple labeled sections ({label_hits} labels found, threshold: {}, {block_count} blocks)",
            thresholds.label_hits
        ));
    }
    if postal_hits >= thresholds.postal_hits {
        triggered.push(format!(
            "Multiple unique postal codes detected ({postal_hits} unique postal codes found, threshold: {})",
            thresholds.postal_hits
        ));
    }
    if url_hits >= thresholds.url_hits {
        triggered.push(format!(
            "Multiple URLs detected ({url_hits} URLs found, threshold: {})",
            thresholds.url_hits
        ));
    }
    if block_count >= thresholds.block_count && label_hits >= 1 {
        triggered.push(format!(
            "Multiple content blocks ({block_count} blocks found, threshold: {}, with {label_hits} labels)",
            thresholds.block_count
        ));
    }

    (!triggered.is_empty(), triggered)
}

fn push_candidate(out: &mut Vec<String>, seen: &mut Vec<String>, raw: &str) {
    let s = raw.trim().trim_matches(|c: char| ",.()[]{}<>\"'".contains(c));
    if s.is_empty() {
        return;
    }
    // Exclude bare 6-digit tokens: those are postal codes, not job codes.
    if s.len() == 6 && s.chars().all(|c| c.is_ascii_digit()) {
        return;
    }
    let key = s.to_lowercase();
    if seen.iter().any(|k| k == &key) {
        return;
    }
    seen.push(key);
    out.push(s.to_string());
}

/// Deterministic, best-effort extraction of assignment codes from a
/// compilation-like message (hint, hashtag and token forms).
pub fn extract_identifier_candidates(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = Vec::new();
    for caps in CODE_HINT_RE.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            push_candidate(&mut out, &mut seen, m.as_str());
        }
    }
    for caps in HASHTAG_CODE_RE.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            push_candidate(&mut out, &mut seen, m.as_str());
        }
    }
    for caps in TOKEN_CODE_RE.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            push_candidate(&mut out, &mut seen, m.as_str());
        }
    }
    out
}

/// Keep only candidates that occur verbatim in the raw text.
pub fn verify_identifiers(raw: &str, candidates: &[String]) -> (Vec<String>, Vec<String>) {
    let mut verified = Vec::new();
    let mut dropped = Vec::new();
    for c in candidates {
        let c = c.trim();
        if c.is_empty() {
            continue;
        }
        if raw.contains(c) {
            if !verified.iter().any(|v: &String| v == c) {
                verified.push(c.to_string());
            }
        } else {
            dropped.push(c.to_string());
        }
    }
    (verified, dropped)
}

/// Order verified identifiers by where each first appears in the message.
pub fn order_verified_identifiers(raw: &str, verified: &[String]) -> Vec<String> {
    let mut with_pos: Vec<(usize, String)> = verified
        .iter()
        .filter_map(|id| raw.find(id.as_str()).map(|pos| (pos, id.clone())))
        .collect();
    with_pos.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    with_pos.into_iter().map(|(_, id)| id).collect()
}

/// Split the message into (identifier, segment) pairs. Each segment runs from
/// its identifier's first occurrence to the next identifier's occurrence; the
/// first segment absorbs any preamble so no text is lost.
pub fn split_by_identifiers(raw: &str, ordered: &[String]) -> Vec<(String, String)> {
    if ordered.is_empty() {
        return Vec::new();
    }
    let mut starts: Vec<(String, usize)> = Vec::new();
    for id in ordered {
        if let Some(pos) = raw.find(id.as_str()) {
            starts.push((id.clone(), pos));
        }
    }
    if starts.is_empty() {
        return Vec::new();
    }
    starts.sort_by_key(|(_, pos)| *pos);

    let mut out = Vec::with_capacity(starts.len());
    for (i, (id, pos)) in starts.iter().enumerate() {
        let begin = if i == 0 { 0 } else { *pos };
        let end = starts.get(i + 1).map(|(_, p)| *p).unwrap_or(raw.len());
        let segment = raw[begin..end].trim();
        if !segment.is_empty() {
            out.push((id.clone(), segment.to_string()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_BLOCKS: &str = "Code: A101\nSubject: P5 Maths\nRate: $40/hr\nAddress: Blk 1 Tampines, 529123\n\nCode: B202\nSubject: Sec 3 Physics\nRate: $50/hr\nAddress: Blk 2 Bishan, 570456\n\nCode: C303\nSubject: JC1 GP\nRate: $70/hr\nAddress: Blk 3 Yishun, 760789";

    #[test]
    fn three_block_bundle_triggers() {
        let (is_comp, triggers) = is_compilation(THREE_BLOCKS, &CompilationThresholds::default());
        assert!(is_comp, "triggers: {triggers:?}");
        // code hits and unique postal codes both cross their thresholds
        assert!(triggers.iter().any(|t| t.contains("assignment codes")));
        assert!(triggers.iter().any(|t| t.contains("postal codes")));
    }

    #[test]
    fn single_assignment_does_not_trigger() {
        let text = "Code: A101\nSubject: P5 Maths\nRate: $40/hr\nAddress: Blk 1 Tampines, 529123";
        let (is_comp, _) = is_compilation(text, &CompilationThresholds::default());
        assert!(!is_comp);
    }

    #[test]
    fn empty_text_is_not_a_compilation() {
        let (is_comp, triggers) = is_compilation("", &CompilationThresholds::default());
        assert!(!is_comp);
        assert!(triggers.is_empty());
    }

    #[test]
    fn candidates_exclude_postal_codes() {
        let cands = extract_identifier_candidates(THREE_BLOCKS);
        assert!(cands.contains(&"A101".to_string()));
        assert!(cands.contains(&"B202".to_string()));
        assert!(cands.contains(&"C303".to_string()));
        assert!(!cands.iter().any(|c| c == "529123"));
    }

    #[test]
    fn hashtag_codes_are_candidates() {
        let cands = extract_identifier_candidates("#T4821 available, #T4822 taken");
        assert_eq!(cands, vec!["T4821".to_string(), "T4822".to_string()]);
    }

    #[test]
    fn verify_drops_unsupported_candidates() {
        let (verified, dropped) = verify_identifiers(
            THREE_BLOCKS,
            &["A101".to_string(), "Z999".to_string()],
        );
        assert_eq!(verified, vec!["A101".to_string()]);
        assert_eq!(dropped, vec!["Z999".to_string()]);
    }

    #[test]
    fn split_covers_whole_message_in_order() {
        let ordered = order_verified_identifiers(
            THREE_BLOCKS,
            &["C303".to_string(), "A101".to_string(), "B202".to_string()],
        );
        assert_eq!(ordered, vec!["A101", "B202", "C303"]);

        let segments = split_by_identifiers(THREE_BLOCKS, &ordered);
        assert_eq!(segments.len(), 3);
        assert!(segments[0].1.contains("P5 Maths"));
        assert!(segments[1].1.contains("Sec 3 Physics"));
        assert!(segments[2].1.contains("JC1 GP"));
        // segment text never leaks into the neighbour
        assert!(!segments[0].1.contains("B202"));
        assert!(!segments[1].1.contains("C303"));
    }
}
