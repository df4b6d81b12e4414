//! Lightweight contract checks over the enriched record before persistence.
//!
//! Intentionally minimal: this catches clearly incomplete outputs that would
//! break downstream consumers, not optional-field gaps.

use tutorpipe_core::types::ParsedAssignment;

fn has_any(list: &Option<Vec<String>>) -> bool {
    list.as_ref().is_some_and(|v| v.iter().any(|s| !s.trim().is_empty()))
}

fn has_schedule_info(parsed: &ParsedAssignment) -> bool {
    if has_any(&parsed.lesson_schedule) {
        return true;
    }
    let ta = &parsed.time_availability;
    if ta.note.as_deref().is_some_and(|n| !n.trim().is_empty()) {
        return true;
    }
    !ta.explicit.is_empty() || !ta.estimated.is_empty()
}

/// Validate the contract. Returns (ok, errors).
///
/// Address fields are optional for online-only lessons; everything else needs
/// at least one address/postal anchor, and every record needs some schedule
/// signal.
pub fn validate_parsed_assignment(parsed: &ParsedAssignment) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    let online_only = parsed.learning_mode.is_online_only();
    let has_location = has_any(&parsed.address)
        || has_any(&parsed.postal_code)
        || has_any(&parsed.postal_code_estimated);
    if !online_only && !has_location {
        errors.push("missing_address_or_postal".to_string());
    }

    if !has_schedule_info(parsed) {
        errors.push("missing_schedule_info".to_string());
    }

    (errors.is_empty(), errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorpipe_core::types::{Day, LearningMode, LearningModeField};

    fn with_schedule() -> ParsedAssignment {
        let mut p = ParsedAssignment::default();
        p.time_availability
            .explicit
            .push_unique(Day::Monday, "19:00-21:00");
        p
    }

    #[test]
    fn offline_without_location_fails() {
        let p = with_schedule();
        let (ok, errors) = validate_parsed_assignment(&p);
        assert!(!ok);
        assert_eq!(errors, vec!["missing_address_or_postal"]);
    }

    #[test]
    fn online_without_location_passes() {
        let mut p = with_schedule();
        p.learning_mode = LearningModeField {
            mode: Some(LearningMode::Online),
            raw_text: Some("online".to_string()),
        };
        let (ok, errors) = validate_parsed_assignment(&p);
        assert!(ok, "errors: {errors:?}");
    }

    #[test]
    fn postal_estimate_counts_as_location() {
        let mut p = with_schedule();
        p.postal_code_estimated = Some(vec!["560123".to_string()]);
        let (ok, _) = validate_parsed_assignment(&p);
        assert!(ok);
    }

    #[test]
    fn missing_schedule_is_an_error() {
        let mut p = ParsedAssignment::default();
        p.address = Some(vec!["Blk 1".to_string()]);
        let (ok, errors) = validate_parsed_assignment(&p);
        assert!(!ok);
        assert_eq!(errors, vec!["missing_schedule_info"]);
    }

    #[test]
    fn note_alone_satisfies_schedule() {
        let mut p = ParsedAssignment::default();
        p.address = Some(vec!["Blk 1".to_string()]);
        p.time_availability.note = Some("tbc".to_string());
        let (ok, _) = validate_parsed_assignment(&p);
        assert!(ok);
    }

    #[test]
    fn lesson_schedule_snippets_satisfy_schedule() {
        let mut p = ParsedAssignment::default();
        p.address = Some(vec!["Blk 1".to_string()]);
        p.lesson_schedule = Some(vec!["1x 1.5h per week".to_string()]);
        let (ok, _) = validate_parsed_assignment(&p);
        assert!(ok);
    }
}
