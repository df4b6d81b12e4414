//! Postal-code enrichment (the pure parts).
//!
//! Fills `postal_code` from explicit 6-digit tokens in the raw text when the
//! LLM produced none. The external geocoder fallback for
//! `postal_code_estimated` lives with the worker; this module only prepares
//! the address strings it consumes.

use std::sync::LazyLock;

use regex::Regex;

use tutorpipe_core::types::ParsedAssignment;

static POSTAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{6})\b").unwrap());
static NEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bnear\b").unwrap());
static BRACKETED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\[(][^\])]*[\])]").unwrap());
static ADDRESS_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(address|location)\s*[:：]\s*(.+)$").unwrap());

/// All unique 6-digit tokens in order of first appearance.
pub fn extract_sg_postal_codes(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in POSTAL_RE.captures_iter(text) {
        let code = caps[1].to_string();
        if !out.contains(&code) {
            out.push(code);
        }
    }
    out
}

/// Install explicit postal codes from the raw text when the record has none.
/// Returns true when codes were filled.
pub fn fill_postal_code_from_text(parsed: &mut ParsedAssignment, raw_text: &str) -> bool {
    let existing = parsed
        .postal_code
        .as_ref()
        .is_some_and(|v| v.iter().any(|s| !s.trim().is_empty()));
    if existing {
        // Normalize whatever the LLM produced down to real 6-digit codes.
        let codes: Vec<String> = parsed
            .postal_code
            .as_ref()
            .map(|v| {
                let mut out = Vec::new();
                for item in v {
                    for code in extract_sg_postal_codes(item) {
                        if !out.contains(&code) {
                            out.push(code);
                        }
                    }
                }
                out
            })
            .unwrap_or_default();
        parsed.postal_code = (!codes.is_empty()).then_some(codes);
        if parsed.postal_code.is_some() {
            return false;
        }
    }

    let codes = extract_sg_postal_codes(raw_text);
    if codes.is_empty() {
        parsed.postal_code = None;
        false
    } else {
        parsed.postal_code = Some(codes);
        parsed.postal_code_estimated = None;
        true
    }
}

/// Address candidates for geocoding: the record's addresses, else a
/// pin-or-label line scraped from the raw text.
pub fn address_candidates(parsed: &ParsedAssignment, raw_text: &str) -> Vec<String> {
    let from_record: Vec<String> = parsed
        .address
        .as_ref()
        .map(|v| {
            v.iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if !from_record.is_empty() {
        return from_record;
    }

    for line in raw_text.lines() {
        let ln = line.trim();
        if ln.is_empty() {
            continue;
        }
        if let Some(rest) = ln.strip_prefix('\u{1F4CD}') {
            let candidate = rest.trim();
            if !candidate.is_empty() {
                return vec![candidate.to_string()];
            }
        }
        if let Some(caps) = ADDRESS_LINE_RE.captures(ln) {
            let candidate = caps[2].trim();
            if !candidate.is_empty() {
                return vec![candidate.to_string()];
            }
        }
    }
    Vec::new()
}

/// Clean one address string for the geocoder: strip "near", bracketed text,
/// and extra whitespace.
pub fn clean_address_for_geocoding(address: &str) -> String {
    let s = NEAR_RE.replace_all(address, "");
    let s = BRACKETED_RE.replace_all(&s, "");
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_unique_codes_in_order() {
        let codes = extract_sg_postal_codes("S(529123) then 570456 then 529123 again");
        assert_eq!(codes, vec!["529123", "570456"]);
    }

    #[test]
    fn fills_from_raw_when_missing() {
        let mut p = ParsedAssignment::default();
        let filled = fill_postal_code_from_text(&mut p, "Address: Blk 1, 529123");
        assert!(filled);
        assert_eq!(p.postal_code, Some(vec!["529123".to_string()]));
    }

    #[test]
    fn normalizes_llm_codes_with_noise() {
        let mut p = ParsedAssignment {
            postal_code: Some(vec!["(S)529123".to_string()]),
            ..ParsedAssignment::default()
        };
        let filled = fill_postal_code_from_text(&mut p, "");
        assert!(!filled);
        assert_eq!(p.postal_code, Some(vec!["529123".to_string()]));
    }

    #[test]
    fn invalid_llm_codes_fall_back_to_raw() {
        let mut p = ParsedAssignment {
            postal_code: Some(vec!["no digits".to_string()]),
            ..ParsedAssignment::default()
        };
        fill_postal_code_from_text(&mut p, "somewhere 570456");
        assert_eq!(p.postal_code, Some(vec!["570456".to_string()]));
    }

    #[test]
    fn no_codes_anywhere_is_none() {
        let mut p = ParsedAssignment::default();
        let filled = fill_postal_code_from_text(&mut p, "no codes here");
        assert!(!filled);
        assert_eq!(p.postal_code, None);
    }

    #[test]
    fn address_candidates_prefer_record() {
        let p = ParsedAssignment {
            address: Some(vec!["Blk 5 Ang Mo Kio".to_string()]),
            ..ParsedAssignment::default()
        };
        assert_eq!(address_candidates(&p, "\u{1F4CD} somewhere else"), vec!["Blk 5 Ang Mo Kio"]);
    }

    #[test]
    fn address_candidates_scrape_raw_lines() {
        let p = ParsedAssignment::default();
        assert_eq!(
            address_candidates(&p, "hello\n\u{1F4CD} Marina One Residences\nbye"),
            vec!["Marina One Residences"]
        );
        assert_eq!(
            address_candidates(&p, "Location: Bishan St 22"),
            vec!["Bishan St 22"]
        );
    }

    #[test]
    fn cleans_address_for_geocoding() {
        assert_eq!(
            clean_address_for_geocoding("near Blk 21 (opposite mall) [S]"),
            "Blk 21"
        );
    }
}
