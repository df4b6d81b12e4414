use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Days and time availability
// ---------------------------------------------------------------------------

/// Weekday key used across time-availability structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    pub const ALL: [Day; 7] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
        Day::Saturday,
        Day::Sunday,
    ];

    pub const WEEKDAYS: [Day; 5] = [
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
        Day::Friday,
    ];

    pub const WEEKEND: [Day; 2] = [Day::Saturday, Day::Sunday];

    pub fn as_str(self) -> &'static str {
        match self {
            Day::Monday => "monday",
            Day::Tuesday => "tuesday",
            Day::Wednesday => "wednesday",
            Day::Thursday => "thursday",
            Day::Friday => "friday",
            Day::Saturday => "saturday",
            Day::Sunday => "sunday",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Day::Monday => 0,
            Day::Tuesday => 1,
            Day::Wednesday => 2,
            Day::Thursday => 3,
            Day::Friday => 4,
            Day::Saturday => 5,
            Day::Sunday => 6,
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One slot list per weekday. A missing day is unrepresentable, which is the
/// point: the wire shape always carries all seven keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayMap {
    #[serde(default)]
    pub monday: Vec<String>,
    #[serde(default)]
    pub tuesday: Vec<String>,
    #[serde(default)]
    pub wednesday: Vec<String>,
    #[serde(default)]
    pub thursday: Vec<String>,
    #[serde(default)]
    pub friday: Vec<String>,
    #[serde(default)]
    pub saturday: Vec<String>,
    #[serde(default)]
    pub sunday: Vec<String>,
}

impl DayMap {
    pub fn get(&self, day: Day) -> &Vec<String> {
        match day {
            Day::Monday => &self.monday,
            Day::Tuesday => &self.tuesday,
            Day::Wednesday => &self.wednesday,
            Day::Thursday => &self.thursday,
            Day::Friday => &self.friday,
            Day::Saturday => &self.saturday,
            Day::Sunday => &self.sunday,
        }
    }

    pub fn get_mut(&mut self, day: Day) -> &mut Vec<String> {
        match day {
            Day::Monday => &mut self.monday,
            Day::Tuesday => &mut self.tuesday,
            Day::Wednesday => &mut self.wednesday,
            Day::Thursday => &mut self.thursday,
            Day::Friday => &mut self.friday,
            Day::Saturday => &mut self.saturday,
            Day::Sunday => &mut self.sunday,
        }
    }

    /// Append a slot, skipping duplicates and empty strings.
    pub fn push_unique(&mut self, day: Day, slot: &str) {
        let v = slot.trim();
        if v.is_empty() {
            return;
        }
        let slots = self.get_mut(day);
        if !slots.iter().any(|s| s == v) {
            slots.push(v.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        Day::ALL.iter().all(|d| self.get(*d).is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Day, &Vec<String>)> {
        Day::ALL.iter().map(move |d| (*d, self.get(*d)))
    }
}

/// Fixed output shape of the time-availability extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAvailability {
    #[serde(default)]
    pub explicit: DayMap,
    #[serde(default)]
    pub estimated: DayMap,
    #[serde(default)]
    pub note: Option<String>,
}

impl TimeAvailability {
    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && self.estimated.is_empty() && self.note.is_none()
    }
}

// ---------------------------------------------------------------------------
// Assignment record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LearningMode {
    Online,
    #[serde(rename = "Face-to-Face")]
    FaceToFace,
    Hybrid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningModeField {
    #[serde(default)]
    pub mode: Option<LearningMode>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

impl LearningModeField {
    pub fn is_online_only(&self) -> bool {
        matches!(self.mode, Some(LearningMode::Online))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TutorType {
    pub canonical: String,
    #[serde(default)]
    pub original: Option<String>,
    #[serde(default)]
    pub agency: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateBreakdownEntry {
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default)]
    pub original_text: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Canonical structured record extracted from a single assignment post.
///
/// This is the shape the LLM is prompted for, the hard validator cleans, and
/// the persister stores as `parsed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedAssignment {
    #[serde(default)]
    pub assignment_code: Option<String>,
    #[serde(default)]
    pub academic_display_text: Option<String>,
    #[serde(default)]
    pub learning_mode: LearningModeField,
    #[serde(default)]
    pub address: Option<Vec<String>>,
    #[serde(default)]
    pub postal_code: Option<Vec<String>>,
    #[serde(default)]
    pub postal_code_estimated: Option<Vec<String>>,
    #[serde(default)]
    pub nearest_mrt: Option<Vec<String>>,
    #[serde(default)]
    pub lesson_schedule: Option<Vec<String>>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub time_availability: TimeAvailability,
    #[serde(default)]
    pub rate: Rate,
    #[serde(default)]
    pub additional_remarks: Option<String>,
    #[serde(default)]
    pub tutor_types: Option<Vec<TutorType>>,
    #[serde(default)]
    pub rate_breakdown: Option<BTreeMap<String, RateBreakdownEntry>>,
}

// ---------------------------------------------------------------------------
// Assignment lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Pending,
    Open,
    Closed,
    Hidden,
    Expired,
    Deleted,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "PENDING",
            AssignmentStatus::Open => "OPEN",
            AssignmentStatus::Closed => "CLOSED",
            AssignmentStatus::Hidden => "HIDDEN",
            AssignmentStatus::Expired => "EXPIRED",
            AssignmentStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(AssignmentStatus::Pending),
            "OPEN" => Some(AssignmentStatus::Open),
            "CLOSED" => Some(AssignmentStatus::Closed),
            "HIDDEN" => Some(AssignmentStatus::Hidden),
            "EXPIRED" => Some(AssignmentStatus::Expired),
            "DELETED" => Some(AssignmentStatus::Deleted),
            _ => None,
        }
    }

    /// State machine: PENDING → OPEN → {CLOSED, HIDDEN, EXPIRED} → DELETED.
    /// Reopens OPEN↔CLOSED and OPEN↔HIDDEN are permitted; DELETED is terminal.
    pub fn can_transition(self, to: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        if self == to {
            return true;
        }
        match (self, to) {
            (Deleted, _) => false,
            (Pending, Open) => true,
            (Open, Closed) | (Open, Hidden) | (Open, Expired) => true,
            (Closed, Open) | (Hidden, Open) => true,
            (Closed, Deleted) | (Hidden, Deleted) | (Expired, Deleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Colored freshness band derived from (now − last_seen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessTier {
    Fresh,
    Recent,
    Aging,
    Stale,
}

impl FreshnessTier {
    pub fn from_age(age: Duration, fresh_minutes: i64, recent_hours: i64, stale_days: i64) -> Self {
        if age <= Duration::minutes(fresh_minutes.max(0)) {
            FreshnessTier::Fresh
        } else if age <= Duration::hours(recent_hours.max(0)) {
            FreshnessTier::Recent
        } else if age <= Duration::days(stale_days.max(0)) {
            FreshnessTier::Aging
        } else {
            FreshnessTier::Stale
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FreshnessTier::Fresh => "fresh",
            FreshnessTier::Recent => "recent",
            FreshnessTier::Aging => "aging",
            FreshnessTier::Stale => "stale",
        }
    }
}

// ---------------------------------------------------------------------------
// Raw store rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_link: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// One observed message. Uniqueness invariant: (channel_link, message_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<i64>,
    pub channel_link: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    pub message_id: String,
    pub message_date: DateTime<Utc>,
    #[serde(default)]
    pub edit_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub is_forward: bool,
    #[serde(default)]
    pub is_reply: bool,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub entities_json: Option<serde_json::Value>,
    #[serde(default)]
    pub media_json: Option<serde_json::Value>,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub forwards: Option<i64>,
    #[serde(default)]
    pub reply_count: Option<i64>,
    /// Tombstone. Once set it never clears; raw_text is preserved.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Full source object kept for replay.
    #[serde(default)]
    pub message_json: Option<serde_json::Value>,
}

impl RawMessage {
    pub fn reply_to_msg_id(&self) -> Option<String> {
        self.message_json
            .as_ref()?
            .get("reply_to_msg_id")
            .and_then(|v| {
                if let Some(n) = v.as_i64() {
                    Some(n.to_string())
                } else {
                    v.as_str().map(str::to_string)
                }
            })
    }
}

// ---------------------------------------------------------------------------
// Ingestion runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Backfill,
    Tail,
    RecoveryCatchup,
    Enqueue,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Backfill => "backfill",
            RunType::Tail => "tail",
            RunType::RecoveryCatchup => "recovery_catchup",
            RunType::Enqueue => "enqueue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: i64,
    pub run_type: RunType,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub channel_link: String,
    #[serde(default)]
    pub last_message_id: Option<String>,
    #[serde(default)]
    pub last_message_date: Option<String>,
    #[serde(default)]
    pub scanned_count: i64,
    #[serde(default)]
    pub inserted_count: i64,
    #[serde(default)]
    pub updated_count: i64,
    #[serde(default)]
    pub error_count: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Extraction queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Ok,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

/// Typed slice of the job meta. The attempt counter must survive the
/// reset-to-pending path, so it is a first-class field; everything else the
/// worker records (timings, filter reasons, persist results) rides in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobMeta {
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Merge a patch object over this meta, keeping typed fields in sync.
    pub fn merged_with(&self, patch: serde_json::Map<String, serde_json::Value>) -> Self {
        let mut base = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        for (k, v) in patch {
            base.insert(k, v);
        }
        serde_json::from_value(serde_json::Value::Object(base)).unwrap_or_default()
    }
}

/// One claimed row from the extraction queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: i64,
    pub pipeline_version: String,
    pub raw_id: i64,
    #[serde(default)]
    pub channel_link: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    #[serde(default)]
    pub error_json: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExtractionJob {
    pub fn attempt(&self) -> u32 {
        JobMeta::from_value(self.meta.as_ref()).attempt
    }

    pub fn channel_link_or_unknown(&self) -> String {
        self.channel_link
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("t.me/unknown")
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Persister results and payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<PersistAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PersistOutcome {
    pub fn is_insert(&self) -> bool {
        self.ok && self.action == Some(PersistAction::Inserted)
    }
}

/// Canonical payload handed to the persister and the downstream
/// broadcast/DM collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentPayload {
    pub cid: String,
    pub pipeline_version: String,
    pub channel_link: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_title: Option<String>,
    #[serde(default)]
    pub channel_username: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message_link: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    /// Edit date when present, else the message date; drives last_seen.
    #[serde(default)]
    pub source_last_seen: Option<DateTime<Utc>>,
    pub raw_text: String,
    pub parsed: ParsedAssignment,
}

/// Builds the public `t.me` message link for a channel ref like `t.me/name`.
pub fn build_message_link(channel_link: &str, message_id: &str) -> Option<String> {
    let ch = channel_link.trim();
    let id = message_id.trim();
    if id.is_empty() {
        return None;
    }
    let username = ch
        .strip_prefix("https://")
        .or_else(|| ch.strip_prefix("http://"))
        .unwrap_or(ch);
    let username = username.strip_prefix("t.me/").unwrap_or(username);
    if username.is_empty() || username.contains('/') {
        return None;
    }
    Some(format!("https://t.me/{username}/{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_map_push_unique_dedupes() {
        let mut m = DayMap::default();
        m.push_unique(Day::Tuesday, "19:00-19:00");
        m.push_unique(Day::Tuesday, "19:00-19:00");
        m.push_unique(Day::Tuesday, "  ");
        assert_eq!(m.tuesday, vec!["19:00-19:00"]);
        assert!(m.monday.is_empty());
    }

    #[test]
    fn day_map_serializes_all_seven_keys() {
        let v = serde_json::to_value(DayMap::default()).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), 7);
        for d in Day::ALL {
            assert!(obj.contains_key(d.as_str()), "missing {d}");
        }
    }

    #[test]
    fn status_machine_allows_reopens_and_blocks_deleted() {
        use AssignmentStatus::*;
        assert!(Pending.can_transition(Open));
        assert!(Open.can_transition(Closed));
        assert!(Closed.can_transition(Open));
        assert!(Open.can_transition(Hidden));
        assert!(Hidden.can_transition(Open));
        assert!(Expired.can_transition(Deleted));
        assert!(!Deleted.can_transition(Open));
        assert!(!Pending.can_transition(Closed));
        assert!(!Expired.can_transition(Open));
    }

    #[test]
    fn learning_mode_wire_names() {
        let v = serde_json::to_value(LearningMode::FaceToFace).unwrap();
        assert_eq!(v, serde_json::json!("Face-to-Face"));
        let m: LearningMode = serde_json::from_value(serde_json::json!("Online")).unwrap();
        assert_eq!(m, LearningMode::Online);
    }

    #[test]
    fn job_meta_attempt_survives_merge() {
        let meta = JobMeta {
            attempt: 2,
            ..JobMeta::default()
        };
        let mut patch = serde_json::Map::new();
        patch.insert("reason".into(), serde_json::json!("persist_failed"));
        patch.insert("attempt".into(), serde_json::json!(3));
        let merged = meta.merged_with(patch);
        assert_eq!(merged.attempt, 3);
        assert_eq!(merged.extra.get("reason").unwrap(), "persist_failed");
    }

    #[test]
    fn freshness_tier_banding() {
        assert_eq!(
            FreshnessTier::from_age(Duration::minutes(5), 60, 24, 7),
            FreshnessTier::Fresh
        );
        assert_eq!(
            FreshnessTier::from_age(Duration::hours(3), 60, 24, 7),
            FreshnessTier::Recent
        );
        assert_eq!(
            FreshnessTier::from_age(Duration::days(3), 60, 24, 7),
            FreshnessTier::Aging
        );
        assert_eq!(
            FreshnessTier::from_age(Duration::days(30), 60, 24, 7),
            FreshnessTier::Stale
        );
    }

    #[test]
    fn message_link_shapes() {
        assert_eq!(
            build_message_link("t.me/FTassignments", "42").as_deref(),
            Some("https://t.me/FTassignments/42")
        );
        assert_eq!(
            build_message_link("https://t.me/foo", "7").as_deref(),
            Some("https://t.me/foo/7")
        );
        assert_eq!(build_message_link("t.me/foo", ""), None);
    }
}
