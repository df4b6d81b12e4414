//! Deterministic matching signals: subjects, student levels, tutor types and
//! the per-type rate breakdown.
//!
//! Signals are metadata for downstream matching and quality checks; they are
//! stored in the job meta and never gate persistence. Text preference order:
//! academic display text, then normalized text, then raw.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use tutorpipe_core::types::{ParsedAssignment, RateBreakdownEntry, TutorType};

use crate::taxonomy::{self, UNKNOWN};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signals {
    pub schema_version: u32,
    /// Which text the signals were parsed from.
    pub source: String,
    pub text_chars: usize,
    pub subjects: Vec<String>,
    pub levels: Vec<String>,
    pub specific_levels: Vec<String>,
    pub tutor_types: Vec<TutorType>,
    pub rate_breakdown: BTreeMap<String, RateBreakdownEntry>,
}

// --- academic parsing ------------------------------------------------------

const SUBJECTS: &[(&str, &str)] = &[
    ("a maths", "A Maths"),
    ("amath", "A Maths"),
    ("e maths", "E Maths"),
    ("emath", "E Maths"),
    ("add maths", "A Maths"),
    ("maths", "Maths"),
    ("math", "Maths"),
    ("general paper", "General Paper"),
    ("gp", "General Paper"),
    ("english", "English"),
    ("higher chinese", "Higher Chinese"),
    ("chinese", "Chinese"),
    ("higher malay", "Higher Malay"),
    ("malay", "Malay"),
    ("higher tamil", "Higher Tamil"),
    ("tamil", "Tamil"),
    ("hindi", "Hindi"),
    ("science", "Science"),
    ("physics", "Physics"),
    ("chemistry", "Chemistry"),
    ("chem", "Chemistry"),
    ("biology", "Biology"),
    ("bio", "Biology"),
    ("economics", "Economics"),
    ("econs", "Economics"),
    ("literature", "Literature"),
    ("history", "History"),
    ("geography", "Geography"),
    ("geog", "Geography"),
    ("social studies", "Social Studies"),
    ("poa", "Accounting (POA)"),
    ("accounting", "Accounting (POA)"),
    ("creative writing", "Creative Writing"),
    ("phonics", "Phonics"),
    ("computing", "Computing"),
    ("piano", "Piano"),
];

static LEVEL_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:(p|pri|primary)\s*([1-6])|(s|sec|secondary)\s*([1-5])|(j|jc)\s*([1-3])|(k)\s*([1-2])|(year)\s*(\d{1,2}))\b")
        .unwrap()
});

static LEVEL_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(pre-?school|kindergarten|primary|secondary|junior\s+college|igcse|ib|poly(?:technic)?|diploma|university|degree)\b")
        .unwrap()
});

fn word_boundary_contains(haystack_lower: &str, needle: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = haystack_lower[start..].find(needle) {
        let abs = start + pos;
        let end = abs + needle.len();
        let before_ok = abs == 0
            || !haystack_lower[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        let after_ok = end >= haystack_lower.len()
            || !haystack_lower[end..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = end;
    }
    false
}

fn parse_subjects(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for (needle, canonical) in SUBJECTS {
        if word_boundary_contains(&lower, needle) && !out.iter().any(|s| s == canonical) {
            out.push((*canonical).to_string());
        }
    }
    out
}

fn parse_levels(text: &str) -> (Vec<String>, Vec<String>) {
    let mut levels: Vec<String> = Vec::new();
    let mut specific: Vec<String> = Vec::new();
    let mut push = |v: &mut Vec<String>, s: String| {
        if !v.contains(&s) {
            v.push(s);
        }
    };

    for caps in LEVEL_TOKEN_RE.captures_iter(text) {
        if let (Some(_), Some(n)) = (caps.get(1), caps.get(2)) {
            push(&mut levels, "Primary".to_string());
            push(&mut specific, format!("Primary {}", n.as_str()));
        } else if let (Some(_), Some(n)) = (caps.get(3), caps.get(4)) {
            push(&mut levels, "Secondary".to_string());
            push(&mut specific, format!("Secondary {}", n.as_str()));
        } else if let (Some(_), Some(n)) = (caps.get(5), caps.get(6)) {
            push(&mut levels, "Junior College".to_string());
            push(&mut specific, format!("JC {}", n.as_str()));
        } else if let (Some(_), Some(n)) = (caps.get(7), caps.get(8)) {
            push(&mut levels, "Pre-School".to_string());
            push(&mut specific, format!("Kindergarten {}", n.as_str()));
        } else if caps.get(9).is_some() {
            // "Year N" appears across IGCSE/IB posts; record the level word only.
            push(&mut levels, "IGCSE".to_string());
        }
    }

    for caps in LEVEL_WORD_RE.captures_iter(text) {
        let word = caps[1].to_lowercase();
        let canon = if word.starts_with("pre") || word.starts_with("kinder") {
            "Pre-School"
        } else if word == "primary" {
            "Primary"
        } else if word == "secondary" {
            "Secondary"
        } else if word.starts_with("junior") {
            "Junior College"
        } else if word == "igcse" {
            "IGCSE"
        } else if word == "ib" {
            "IB"
        } else if word.starts_with("poly") || word == "diploma" {
            "Diploma"
        } else {
            "Degree"
        };
        push(&mut levels, canon.to_string());
    }

    (levels, specific)
}

// --- tutor types and rate breakdown ---------------------------------------

static RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<prefix>\$?)\s*(?P<min>\d+(?:[.,]\d+)?)\s*(?:-\s*(?P<max>\d+(?:[.,]\d+)?))?\s*(?P<unit>/hr|/h|per\s+hour|p/h|p\.h|hr)?")
        .unwrap()
});

fn parse_number(s: &str) -> Option<i64> {
    let normalized = s.trim().replace(',', ".");
    normalized.parse::<f64>().ok().map(|f| f.round() as i64)
}

/// Window (in bytes) searched around a rate span for a tutor-type label.
const TYPE_WINDOW: usize = 40;

fn clamp_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Extract tutor types and the per-type rate breakdown from free text.
pub fn extract_tutor_types(
    text: &str,
    agency: Option<&str>,
) -> (Vec<TutorType>, BTreeMap<String, RateBreakdownEntry>) {
    let mut types: BTreeMap<String, TutorType> = BTreeMap::new();
    let mut breakdown: BTreeMap<String, RateBreakdownEntry> = BTreeMap::new();

    static TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[A-Za-z0-9/-]+").unwrap());

    // Rate-like spans with a nearby type label.
    for caps in RATE_RE.captures_iter(text) {
        let m = caps.get(0).unwrap();
        let prefix = caps.name("prefix").map_or("", |p| p.as_str());
        let unit = caps.name("unit").map_or("", |u| u.as_str());
        if prefix.is_empty() && unit.is_empty() {
            continue;
        }
        let min = caps.name("min").and_then(|v| parse_number(v.as_str()));
        let max = caps
            .name("max")
            .and_then(|v| parse_number(v.as_str()))
            .or(min);
        if min.is_none() {
            continue;
        }

        let window_start = clamp_boundary(text, m.start().saturating_sub(TYPE_WINDOW));
        let window_end = clamp_boundary(text, m.end() + TYPE_WINDOW);
        let window = &text[window_start..window_end];

        // Nearest matching label wins, so "FT $40/hr, PT $25/hr" binds each
        // rate to its own type instead of the first token in the window.
        // Tokens inside the rate span itself are excluded: the digits of
        // "$40-55/hr" must never be folded into a candidate phrase.
        let tokens: Vec<(usize, &str)> = TOKEN_RE
            .find_iter(window)
            .map(|t| (window_start + t.start(), t.as_str()))
            .filter(|(start, t)| {
                let end = start + t.len();
                end <= m.start() || *start >= m.end()
            })
            .collect();
        let mut found: Option<(usize, String, String)> = None;
        for i in 0..tokens.len() {
            for j in i..tokens.len().min(i + 3) {
                let phrase = tokens[i..=j]
                    .iter()
                    .map(|(_, t)| *t)
                    .collect::<Vec<_>>()
                    .join(" ");
                let (canon, orig, _) = taxonomy::normalize_label(&phrase, agency);
                if canon == UNKNOWN {
                    continue;
                }
                let tok_start = tokens[i].0;
                let tok_end = tokens[j].0 + tokens[j].1.len();
                let distance = if tok_end <= m.start() {
                    m.start() - tok_end
                } else if tok_start >= m.end() {
                    tok_start - m.end()
                } else {
                    0
                };
                if found.as_ref().is_none_or(|(d, _, _)| distance < *d) {
                    found = Some((distance, canon, orig));
                }
                break;
            }
        }

        if let Some((_, canon, orig)) = found {
            breakdown.insert(
                canon.clone(),
                RateBreakdownEntry {
                    min,
                    max,
                    original_text: Some(m.as_str().trim().to_string()),
                    currency: (prefix == "$").then(|| "$".to_string()),
                    unit: (!unit.is_empty()).then(|| "hour".to_string()),
                    confidence: Some(0.9),
                },
            );
            types.entry(canon.clone()).or_insert_with(|| TutorType {
                canonical: canon.clone(),
                original: Some(orig),
                agency: agency.map(str::to_string),
                confidence: Some(0.9),
            });
        }
    }

    // Free-standing type mentions anywhere in the text.
    let words: Vec<&str> = TOKEN_RE.find_iter(text).map(|t| t.as_str()).collect();
    for i in 0..words.len() {
        for j in i..words.len().min(i + 4) {
            let phrase = words[i..=j].join(" ");
            let (canon, orig, _) = taxonomy::normalize_label(&phrase, agency);
            if canon != UNKNOWN {
                types.entry(canon.clone()).or_insert_with(|| TutorType {
                    canonical: canon.clone(),
                    original: Some(orig),
                    agency: agency.map(str::to_string),
                    confidence: Some(0.6),
                });
            }
        }
    }

    (types.into_values().collect(), breakdown)
}

/// Build the signals object. Never fails; the worker stores the result (or
/// the error string) in job meta.
pub fn build_signals(
    parsed: &ParsedAssignment,
    raw_text: &str,
    normalized_text: &str,
    agency: Option<&str>,
) -> Signals {
    let display = parsed
        .academic_display_text
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let (source, text) = match display {
        Some(d) => ("academic_display_text", d),
        None if !normalized_text.trim().is_empty() => ("normalized_text", normalized_text),
        None => ("raw_text", raw_text),
    };

    let subjects = parse_subjects(text);
    let (levels, specific_levels) = parse_levels(text);
    let (tutor_types, rate_breakdown) = extract_tutor_types(text, agency);

    Signals {
        schema_version: 1,
        source: source.to_string(),
        text_chars: text.chars().count(),
        subjects,
        levels,
        specific_levels,
        tutor_types,
        rate_breakdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_and_levels_from_display_text() {
        let parsed = ParsedAssignment {
            academic_display_text: Some("Sec 3 Express A Maths and Physics".to_string()),
            ..ParsedAssignment::default()
        };
        let s = build_signals(&parsed, "", "", None);
        assert_eq!(s.source, "academic_display_text");
        assert!(s.subjects.contains(&"A Maths".to_string()));
        assert!(s.subjects.contains(&"Physics".to_string()));
        assert!(s.levels.contains(&"Secondary".to_string()));
        assert!(s.specific_levels.contains(&"Secondary 3".to_string()));
    }

    #[test]
    fn falls_back_to_normalized_then_raw() {
        let parsed = ParsedAssignment::default();
        let s = build_signals(&parsed, "raw P5 Science", "normalized P6 English", None);
        assert_eq!(s.source, "normalized_text");
        assert!(s.specific_levels.contains(&"Primary 6".to_string()));

        let s = build_signals(&parsed, "raw P5 Science", "  ", None);
        assert_eq!(s.source, "raw_text");
        assert!(s.specific_levels.contains(&"Primary 5".to_string()));
    }

    #[test]
    fn maths_does_not_shadow_a_maths() {
        let s = parse_subjects("Sec 4 A Maths");
        assert!(s.contains(&"A Maths".to_string()));
    }

    #[test]
    fn rate_breakdown_associates_nearest_type() {
        let (types, breakdown) =
            extract_tutor_types("FT/EX-MOE $40-55/hr, PT $25-30/hr", None);
        let ft = breakdown.get("full-timer").expect("full-timer entry");
        assert_eq!(ft.min, Some(40));
        assert_eq!(ft.max, Some(55));
        assert_eq!(ft.currency.as_deref(), Some("$"));
        assert_eq!(ft.unit.as_deref(), Some("hour"));
        let pt = breakdown.get("part-timer").expect("part-timer entry");
        assert_eq!(pt.min, Some(25));
        assert_eq!(pt.max, Some(30));
        let canon: Vec<&str> = types.iter().map(|t| t.canonical.as_str()).collect();
        assert!(canon.contains(&"full-timer"));
        assert!(canon.contains(&"part-timer"));
        assert!(canon.contains(&"moe-exmoe"));
    }

    #[test]
    fn bare_numbers_without_currency_or_unit_are_ignored() {
        let (_, breakdown) = extract_tutor_types("PT tutors, 3 lessons of 90 minutes", None);
        assert!(breakdown.is_empty());
    }

    #[test]
    fn single_rate_expands_min_to_max() {
        let (_, breakdown) = extract_tutor_types("MOE $100/hr", None);
        let moe = breakdown.get("moe-exmoe").expect("moe entry");
        assert_eq!(moe.min, Some(100));
        assert_eq!(moe.max, Some(100));
    }
}
