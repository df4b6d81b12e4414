//! Non-assignment message detector.
//!
//! Classifies short-or-administrative posts before any LLM call. Conservative
//! on purpose: when in doubt the message passes through. A false negative
//! costs one LLM call, a false positive loses an assignment.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonAssignmentKind {
    StatusOnly,
    Redirect,
    Administrative,
}

impl NonAssignmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NonAssignmentKind::StatusOnly => "status_only",
            NonAssignmentKind::Redirect => "redirect",
            NonAssignmentKind::Administrative => "administrative",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonAssignment {
    pub kind: NonAssignmentKind,
    pub details: String,
}

static STATUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^\s*assignment\s+(closed|taken|filled|expired)\s*$").unwrap(),
        Regex::new(r"(?i)^\s*(closed|taken|filled|expired)\s*$").unwrap(),
        Regex::new(r"(?i)^\s*status\s*:\s*(closed|taken|filled|expired)\s*$").unwrap(),
    ]
});

static REDIRECT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)has\s+been\s+reposted\s+(below|above)").unwrap(),
        Regex::new(r"(?i)reposted\s+(below|above)").unwrap(),
        Regex::new(r"(?i)see\s+(above|below|message\s+above|message\s+below)").unwrap(),
        Regex::new(r"(?i)refer\s+to\s+(above|below|previous|next)\s+(message|post)").unwrap(),
        Regex::new(r"(?i)assignment\s+\d+\s+has\s+been\s+reposted").unwrap(),
    ]
});

static ADMIN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)calling\s+all\s+tutors").unwrap(),
        Regex::new(r"(?i)new\s+job\s+opportunities").unwrap(),
        Regex::new(r"(?i)many\s+(tuition\s+)?job\s+opportunities").unwrap(),
        Regex::new(r"(?i)important\s+announcement").unwrap(),
        Regex::new(r"(?i)agency\s+(will\s+be\s+)?(closed|opening)").unwrap(),
        Regex::new(r"(?i)(bot|phone\s+number)\s+(has\s+)?changed").unwrap(),
    ]
});

/// Markers that suggest a real assignment rather than an announcement.
const ASSIGNMENT_MARKERS: &[&str] = &[
    "job id:",
    "job code:",
    "assignment code:",
    "hourly rate:",
    "\u{1F53B}", // bullet emoji common in assignment posts
    "lesson per week:",
    "student's gender:",
    "time:",
    "location/area:",
    "level and subject",
];

fn count_assignment_markers(text: &str) -> usize {
    let lower = text.to_lowercase();
    ASSIGNMENT_MARKERS.iter().filter(|m| lower.contains(*m)).count()
}

/// Suspiciously short for an assignment: under 3 non-empty lines or 50 chars.
fn is_very_short(text: &str) -> bool {
    let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
    lines < 3 || text.trim().chars().count() < 50
}

fn detect_status_only(text: &str) -> Option<String> {
    if !is_very_short(text) {
        return None;
    }
    if count_assignment_markers(text) >= 2 {
        return None;
    }
    STATUS_PATTERNS
        .iter()
        .find(|p| p.is_match(text))
        .map(|p| format!("Status-only message detected: {}", p.as_str()))
}

fn detect_redirect(text: &str) -> Option<String> {
    if !is_very_short(text) {
        return None;
    }
    if count_assignment_markers(text) >= 3 {
        return None;
    }
    REDIRECT_PATTERNS
        .iter()
        .find(|p| p.is_match(text))
        .map(|p| format!("Redirect message detected: {}", p.as_str()))
}

fn detect_administrative(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    for pattern in ADMIN_PATTERNS.iter() {
        if !pattern.is_match(text) {
            continue;
        }
        // A promotional message with many items is a compilation-style list.
        let apply_count = lower.matches("apply now").count();
        let checkmark_count = lower.matches('\u{2705}').count();
        let bullet_count = checkmark_count + lower.matches('\u{2022}').count();
        if apply_count >= 3 || checkmark_count >= 3 || bullet_count >= 5 {
            return Some(format!(
                "Promotional list message: {}, {} bullets",
                pattern.as_str(),
                bullet_count
            ));
        }
        // Real assignments typically carry 3+ markers.
        if count_assignment_markers(text) < 3 {
            return Some(format!("Administrative message: {}", pattern.as_str()));
        }
    }
    None
}

/// Classify a message. `None` means "looks like a real assignment, proceed".
pub fn detect(text: &str) -> Option<NonAssignment> {
    let normalized = text.trim();
    if normalized.is_empty() {
        // Empty text is handled by the worker's own guard.
        return None;
    }

    if let Some(details) = detect_status_only(normalized) {
        return Some(NonAssignment {
            kind: NonAssignmentKind::StatusOnly,
            details,
        });
    }
    if let Some(details) = detect_redirect(normalized) {
        return Some(NonAssignment {
            kind: NonAssignmentKind::Redirect,
            details,
        });
    }
    if let Some(details) = detect_administrative(normalized) {
        return Some(NonAssignment {
            kind: NonAssignmentKind::Administrative,
            details,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_closed() {
        let res = detect("ASSIGNMENT CLOSED").expect("should detect");
        assert_eq!(res.kind, NonAssignmentKind::StatusOnly);
    }

    #[test]
    fn status_only_variants() {
        for s in ["TAKEN", "filled", "Status: Expired", "assignment taken"] {
            let res = detect(s).unwrap_or_else(|| panic!("missed {s:?}"));
            assert_eq!(res.kind, NonAssignmentKind::StatusOnly);
        }
    }

    #[test]
    fn redirect_message() {
        let res = detect("Assignment 123 has been reposted below.").expect("should detect");
        assert_eq!(res.kind, NonAssignmentKind::Redirect);
    }

    #[test]
    fn administrative_promotional_bundle() {
        let text = "Calling all tutors!\n\u{2705} P3 English\n\u{2705} Sec 2 Maths\n\u{2705} JC1 GP\nApply now";
        let res = detect(text).expect("should detect");
        assert_eq!(res.kind, NonAssignmentKind::Administrative);
    }

    #[test]
    fn real_assignment_passes_through() {
        let text = "Assignment Code: A123\nHourly Rate: $40\nTime: Mon 7pm\nLocation/Area: Bishan\nStudent's Gender: M";
        assert!(detect(text).is_none());
    }

    #[test]
    fn many_markers_never_non_assignment() {
        // Contains a status word but carries enough structure to be real.
        let text = "CLOSED soon!\nJob ID: 99\nHourly Rate: $50\nTime: 3pm\nLocation/Area: Yishun";
        assert!(detect(text).is_none());
    }

    #[test]
    fn empty_text_is_not_classified_here() {
        assert!(detect("").is_none());
        assert!(detect("   \n ").is_none());
    }
}
