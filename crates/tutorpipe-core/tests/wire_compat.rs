// Verify wire shapes match what the PostgREST tables and downstream
// collaborators expect. These tests ensure the JSON contract is never broken.

use serde_json::json;

use tutorpipe_core::types::{
    AssignmentStatus, DayMap, ExtractionJob, JobMeta, JobStatus, ParsedAssignment, PersistAction,
    PersistOutcome, RawMessage,
};

#[test]
fn parsed_assignment_carries_all_canonical_keys() {
    let v = serde_json::to_value(ParsedAssignment::default()).unwrap();
    let obj = v.as_object().unwrap();
    for key in [
        "assignment_code",
        "academic_display_text",
        "learning_mode",
        "address",
        "postal_code",
        "postal_code_estimated",
        "nearest_mrt",
        "lesson_schedule",
        "start_date",
        "time_availability",
        "rate",
        "additional_remarks",
        "tutor_types",
        "rate_breakdown",
    ] {
        assert!(obj.contains_key(key), "missing key {key}");
    }
    // the fixed time-availability shape is always present
    assert!(v["time_availability"]["explicit"]["monday"].is_array());
    assert!(v["time_availability"]["estimated"]["sunday"].is_array());
    assert!(v["time_availability"]["note"].is_null());
}

#[test]
fn claim_rpc_row_deserializes() {
    let row = json!({
        "id": 318,
        "pipeline_version": "2026-01-02_det_time_v1",
        "raw_id": 99182,
        "channel_link": "t.me/FTassignments",
        "message_id": "40213",
        "status": "processing",
        "meta": {"attempt": 1, "requeued_at": "2026-07-30T09:15:00Z"},
        "error_json": null,
        "created_at": "2026-07-30T09:00:00Z",
        "updated_at": "2026-07-30T09:15:00Z"
    });
    let job: ExtractionJob = serde_json::from_value(row).unwrap();
    assert_eq!(job.id, 318);
    assert_eq!(job.status, Some(JobStatus::Processing));
    assert_eq!(job.attempt(), 1);
    assert_eq!(job.channel_link_or_unknown(), "t.me/FTassignments");
}

#[test]
fn job_meta_keeps_unknown_fields() {
    let meta: JobMeta = serde_json::from_value(json!({
        "attempt": 2,
        "llm_model": "lfm2-8b-a1b",
        "persist": {"ok": true, "action": "updated"},
        "normalization": {"chars": 120}
    }))
    .unwrap();
    assert_eq!(meta.attempt, 2);
    assert_eq!(meta.extra.get("persist").unwrap()["action"], "updated");

    let back = serde_json::to_value(&meta).unwrap();
    assert_eq!(back["attempt"], 2);
    assert_eq!(back["normalization"]["chars"], 120);
}

#[test]
fn raw_row_round_trips_through_store_shape() {
    let row = json!({
        "id": 7,
        "channel_link": "t.me/chan",
        "channel_id": "1001",
        "message_id": "42",
        "message_date": "2026-07-01T10:00:00Z",
        "edit_date": null,
        "sender_id": null,
        "is_forward": false,
        "is_reply": true,
        "raw_text": "post",
        "views": 120,
        "deleted_at": null,
        "last_seen_at": "2026-07-01T10:05:00Z",
        "message_json": {"id": 42, "reply_to_msg_id": 41}
    });
    let raw: RawMessage = serde_json::from_value(row).unwrap();
    assert_eq!(raw.message_id, "42");
    assert!(raw.is_reply);
    assert_eq!(raw.reply_to_msg_id().as_deref(), Some("41"));
}

#[test]
fn status_strings_match_the_table_enum() {
    assert_eq!(AssignmentStatus::Open.as_str(), "OPEN");
    assert_eq!(AssignmentStatus::parse("closed"), Some(AssignmentStatus::Closed));
    assert_eq!(
        serde_json::to_value(AssignmentStatus::Expired).unwrap(),
        json!("EXPIRED")
    );
}

#[test]
fn persist_outcome_wire_shape() {
    let outcome = PersistOutcome {
        ok: true,
        action: Some(PersistAction::Inserted),
        status_code: Some(201),
        error: None,
    };
    let v = serde_json::to_value(&outcome).unwrap();
    assert_eq!(v, json!({"ok": true, "action": "inserted", "status_code": 201}));
    assert!(outcome.is_insert());
}

#[test]
fn day_map_accepts_partial_objects_from_llm() {
    // The validator fills missing days; deserialization itself must not fail.
    let m: DayMap = serde_json::from_value(json!({"monday": ["19:00-21:00"]})).unwrap();
    assert_eq!(m.monday, vec!["19:00-21:00"]);
    assert!(m.sunday.is_empty());
}
