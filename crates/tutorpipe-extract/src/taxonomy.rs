//! Tutor-type taxonomy: maps raw labels (optionally with an agency hint) to
//! a canonical tutor type with a confidence score.
//!
//! The taxonomy file is embedded at build time; unknown labels map to the
//! canonical `"unknown"`.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Deserialize;

const TAXONOMY_YAML: &str = include_str!("taxonomy.yaml");

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    canonical: HashMap<String, CanonicalEntry>,
}

#[derive(Debug, Deserialize)]
struct CanonicalEntry {
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
}

/// Flat alias (lowercased) → canonical key map.
static ALIASES: LazyLock<HashMap<String, String>> = LazyLock::new(|| {
    let file: TaxonomyFile =
        serde_yaml::from_str(TAXONOMY_YAML).expect("embedded taxonomy.yaml must parse");
    let mut map = HashMap::new();
    for (canon, entry) in file.canonical {
        for alias in &entry.aliases {
            map.insert(alias.to_lowercase(), canon.clone());
        }
        if let Some(display) = &entry.display {
            map.insert(display.to_lowercase(), canon.clone());
        }
    }
    map
});

/// Canonical key used when no alias matches.
pub const UNKNOWN: &str = "unknown";

/// Normalize a raw label to (canonical, original, confidence).
///
/// Deterministic alias matches first, then per-token matches, then a
/// substring fallback restricted to longer aliases so two-letter codes never
/// fire inside unrelated words.
pub fn normalize_label(label: &str, _agency: Option<&str>) -> (String, String, f64) {
    let orig = label.trim().to_string();
    if orig.is_empty() {
        return (UNKNOWN.to_string(), orig, 0.0);
    }
    let key = orig.to_lowercase();

    if let Some(canon) = ALIASES.get(&key) {
        return (canon.clone(), orig, 0.99);
    }

    for token in key.split(|c: char| !c.is_ascii_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        if let Some(canon) = ALIASES.get(token) {
            return (canon.clone(), orig, 0.9);
        }
    }

    for (alias, canon) in ALIASES.iter() {
        if alias.len() >= 4 && (key.contains(alias.as_str()) || alias.contains(&key)) {
            return (canon.clone(), orig, 0.7);
        }
    }

    (UNKNOWN.to_string(), orig, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_alias_match() {
        let (canon, orig, conf) = normalize_label("PT", None);
        assert_eq!(canon, "part-timer");
        assert_eq!(orig, "PT");
        assert!(conf > 0.9);
    }

    #[test]
    fn token_match_inside_phrase() {
        let (canon, _, conf) = normalize_label("FT/EX-MOE", None);
        // tokenizes to ["ft", "ex", "moe"]; "ft" wins first
        assert_eq!(canon, "full-timer");
        assert!(conf >= 0.9);
    }

    #[test]
    fn moe_variants() {
        for label in ["MOE", "ex-moe", "Current MOE", "MOE Teacher"] {
            let (canon, _, _) = normalize_label(label, None);
            assert_eq!(canon, "moe-exmoe", "label {label:?}");
        }
    }

    #[test]
    fn fresh_grad_maps_to_graduate() {
        let (canon, _, _) = normalize_label("fresh grad", None);
        assert_eq!(canon, "graduate");
    }

    #[test]
    fn unknown_label_maps_to_unknown() {
        let (canon, orig, conf) = normalize_label("some random words", None);
        assert_eq!(canon, UNKNOWN);
        assert_eq!(orig, "some random words");
        assert_eq!(conf, 0.0);
    }

    #[test]
    fn short_aliases_never_fire_as_substrings() {
        // "lift" contains "ft" but must not be classified
        let (canon, _, _) = normalize_label("lift", None);
        assert_eq!(canon, UNKNOWN);
    }

    #[test]
    fn empty_label() {
        let (canon, orig, conf) = normalize_label("   ", None);
        assert_eq!(canon, UNKNOWN);
        assert_eq!(orig, "");
        assert_eq!(conf, 0.0);
    }
}
