//! Assignment persister: the only component that writes assignment rows.
//!
//! Deduplication key is (agency_link, external_id). A repost or edit with
//! the same external id advances `last_seen` and increments `bump_count`
//! instead of duplicating; merge-on-hit fills previously-null parsed fields
//! from new non-null values and never overwrites non-null with null.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use tutorpipe_core::types::{
    AssignmentPayload, AssignmentStatus, PersistAction, PersistOutcome,
};

use crate::error::Result;
use crate::rest::{quote, SupabaseRest};

#[derive(Debug, Clone)]
pub struct AssignmentStore {
    rest: SupabaseRest,
    table: String,
}

/// Result of a bump sweep over matching assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BumpResult {
    pub ok: bool,
    pub bumped: u32,
    pub not_found: u32,
    pub errors: u32,
}

#[derive(Debug, Deserialize)]
struct ExistingRow {
    id: i64,
    #[serde(default)]
    bump_count: Option<i64>,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    parsed: Option<Value>,
}

/// external_id precedence: assignment_code, then the synthetic
/// `tg:<channel_id>:<message_id>`, then message_link, then cid.
pub fn derive_external_id(payload: &AssignmentPayload) -> String {
    if let Some(code) = payload
        .parsed
        .assignment_code
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return code.to_string();
    }
    if let (Some(channel_id), Some(message_id)) = (
        payload.channel_id.as_deref().filter(|s| !s.is_empty()),
        payload.message_id.as_deref().filter(|s| !s.is_empty()),
    ) {
        return format!("tg:{channel_id}:{message_id}");
    }
    if let Some(link) = payload.message_link.as_deref().filter(|s| !s.is_empty()) {
        return link.to_string();
    }
    payload.cid.clone()
}

/// Fill-null merge of parsed objects: a new non-null value wins, a new null
/// never clobbers an existing non-null value.
pub fn merge_parsed(existing: &Value, incoming: &Value) -> Value {
    let (Some(old), Some(new)) = (existing.as_object(), incoming.as_object()) else {
        return if incoming.is_null() {
            existing.clone()
        } else {
            incoming.clone()
        };
    };
    let mut merged = old.clone();
    for (k, new_v) in new {
        match merged.get(k) {
            Some(old_v) if new_v.is_null() && !old_v.is_null() => {}
            _ => {
                merged.insert(k.clone(), new_v.clone());
            }
        }
    }
    Value::Object(merged)
}

impl AssignmentStore {
    pub fn new(rest: SupabaseRest, table: impl Into<String>) -> Self {
        Self {
            rest,
            table: table.into(),
        }
    }

    async fn lookup(&self, agency_link: &str, external_id: &str) -> Result<Option<ExistingRow>> {
        let path = format!(
            "{}?select=id,bump_count,last_seen,status,parsed&agency_link=eq.{}&external_id=eq.{}&limit=1",
            self.table,
            quote(agency_link),
            quote(external_id)
        );
        let rows: Vec<ExistingRow> = self.rest.get_json(&path).await?;
        Ok(rows.into_iter().next())
    }

    /// Upsert the canonical record. Insert on first sight (status OPEN,
    /// bump_count 0); on a hit, bump and merge. Racing workers are safe:
    /// the insert upserts on the dedup key, so the loser lands as an update.
    pub async fn persist(&self, payload: &AssignmentPayload) -> PersistOutcome {
        let external_id = derive_external_id(payload);
        let agency_link = payload.channel_link.clone();
        let source_seen = payload.source_last_seen.or(payload.date).unwrap_or_else(Utc::now);

        let existing = match self.lookup(&agency_link, &external_id).await {
            Ok(row) => row,
            Err(e) => {
                return PersistOutcome {
                    ok: false,
                    action: None,
                    status_code: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let parsed_value = match serde_json::to_value(&payload.parsed) {
            Ok(v) => v,
            Err(e) => {
                return PersistOutcome {
                    ok: false,
                    action: None,
                    status_code: None,
                    error: Some(e.to_string()),
                }
            }
        };

        match existing {
            None => {
                let row = json!({
                    "agency_link": agency_link,
                    "external_id": external_id,
                    "assignment_code": payload.parsed.assignment_code,
                    "status": AssignmentStatus::Open.as_str(),
                    "bump_count": 0,
                    "first_seen": source_seen.to_rfc3339(),
                    "last_seen": source_seen.to_rfc3339(),
                    "freshness_tier": "fresh",
                    "channel_id": payload.channel_id,
                    "channel_title": payload.channel_title,
                    "message_id": payload.message_id,
                    "message_link": payload.message_link,
                    "raw_text": payload.raw_text,
                    "parsed": parsed_value,
                    "pipeline_version": payload.pipeline_version,
                });
                let path = format!("{}?on_conflict=agency_link,external_id", self.table);
                match self
                    .rest
                    .post(&path, &json!([row]), Some("resolution=merge-duplicates,return=minimal"))
                    .await
                {
                    Ok(_) => {
                        info!(external_id, agency = %agency_link, "assignment inserted");
                        PersistOutcome {
                            ok: true,
                            action: Some(PersistAction::Inserted),
                            status_code: Some(201),
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, external_id, "assignment insert failed");
                        PersistOutcome {
                            ok: false,
                            action: None,
                            status_code: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            Some(row) => {
                let last_seen = row
                    .last_seen
                    .map(|current| current.max(source_seen))
                    .unwrap_or(source_seen);
                let merged = merge_parsed(row.parsed.as_ref().unwrap_or(&Value::Null), &parsed_value);
                let body = json!({
                    "last_seen": last_seen.to_rfc3339(),
                    "bump_count": row.bump_count.unwrap_or(0) + 1,
                    "freshness_tier": "fresh",
                    "raw_text": payload.raw_text,
                    "parsed": merged,
                    "pipeline_version": payload.pipeline_version,
                });
                let path = format!("{}?id=eq.{}", self.table, row.id);
                match self.rest.patch(&path, &body, None).await {
                    Ok(()) => {
                        debug!(external_id, agency = %agency_link, "assignment bumped");
                        PersistOutcome {
                            ok: true,
                            action: Some(PersistAction::Updated),
                            status_code: Some(204),
                            error: None,
                        }
                    }
                    Err(e) => PersistOutcome {
                        ok: false,
                        action: None,
                        status_code: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        }
    }

    /// Transition an assignment through the state machine. Refused
    /// transitions (e.g. out of DELETED) return false without writing.
    pub async fn transition_status(
        &self,
        agency_link: &str,
        external_id: &str,
        to: AssignmentStatus,
    ) -> Result<bool> {
        let Some(row) = self.lookup(agency_link, external_id).await? else {
            return Ok(false);
        };
        let current = row
            .status
            .as_deref()
            .and_then(AssignmentStatus::parse)
            .unwrap_or(AssignmentStatus::Open);
        if !current.can_transition(to) {
            warn!(
                external_id,
                from = current.as_str(),
                to = to.as_str(),
                "status transition refused"
            );
            return Ok(false);
        }
        if current == to {
            return Ok(true);
        }
        let path = format!("{}?id=eq.{}", self.table, row.id);
        self.rest
            .patch(&path, &json!({"status": to.as_str()}), None)
            .await?;
        info!(external_id, from = current.as_str(), to = to.as_str(), "assignment status changed");
        Ok(true)
    }

    /// Deleted-source events close the assignment.
    pub async fn mark_closed(&self, payload: &AssignmentPayload) -> Result<bool> {
        let external_id = derive_external_id(payload);
        self.transition_status(&payload.channel_link, &external_id, AssignmentStatus::Closed)
            .await
    }

    /// Bump every assignment matching `external_id` (optionally constrained
    /// to one agency): last_seen advances monotonically, bump_count += 1.
    /// Never inserts; a miss is reported in `not_found`.
    pub async fn bump_by_external_id(
        &self,
        external_id: &str,
        agency_link: Option<&str>,
        last_seen: DateTime<Utc>,
    ) -> BumpResult {
        let mut result = BumpResult {
            ok: true,
            ..BumpResult::default()
        };
        let ext = external_id.trim();
        if ext.is_empty() {
            return result;
        }

        let agency_filter = agency_link
            .map(|a| format!("&agency_link=eq.{}", quote(a)))
            .unwrap_or_default();
        let path = format!(
            "{}?select=id,bump_count,last_seen,status,parsed{agency_filter}&external_id=eq.{}&limit=25",
            self.table,
            quote(ext)
        );
        let rows: Vec<ExistingRow> = match self.rest.get_json(&path).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, external_id = ext, "bump lookup failed");
                result.ok = false;
                result.errors = 1;
                return result;
            }
        };
        if rows.is_empty() {
            result.not_found = 1;
            return result;
        }

        for row in rows {
            let advanced = row
                .last_seen
                .map(|current| current.max(last_seen))
                .unwrap_or(last_seen);
            let body = json!({
                "bump_count": row.bump_count.unwrap_or(0) + 1,
                "last_seen": advanced.to_rfc3339(),
                "freshness_tier": "fresh",
            });
            let path = format!("{}?id=eq.{}", self.table, row.id);
            match self.rest.patch(&path, &body, None).await {
                Ok(()) => result.bumped += 1,
                Err(e) => {
                    debug!(error = %e, external_id = ext, "bump patch failed");
                    result.errors += 1;
                    result.ok = false;
                }
            }
        }
        info!(
            external_id = ext,
            bumped = result.bumped,
            errors = result.errors,
            "bump summary"
        );
        result
    }

    /// Reply messages bump the parent assignment identified by
    /// (channel_link, reply_to_msg_id).
    pub async fn bump_by_message_ref(
        &self,
        channel_link: &str,
        message_id: &str,
        last_seen: DateTime<Utc>,
    ) -> BumpResult {
        let mut result = BumpResult {
            ok: true,
            ..BumpResult::default()
        };
        let path = format!(
            "{}?select=id,bump_count,last_seen,status,parsed&agency_link=eq.{}&message_id=eq.{}&limit=1",
            self.table,
            quote(channel_link),
            quote(message_id)
        );
        let rows: Vec<ExistingRow> = match self.rest.get_json(&path).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, message_id, "reply bump lookup failed");
                result.ok = false;
                result.errors = 1;
                return result;
            }
        };
        let Some(row) = rows.into_iter().next() else {
            result.not_found = 1;
            return result;
        };
        let advanced = row
            .last_seen
            .map(|current| current.max(last_seen))
            .unwrap_or(last_seen);
        let body = json!({
            "bump_count": row.bump_count.unwrap_or(0) + 1,
            "last_seen": advanced.to_rfc3339(),
            "freshness_tier": "fresh",
        });
        let path = format!("{}?id=eq.{}", self.table, row.id);
        match self.rest.patch(&path, &body, None).await {
            Ok(()) => result.bumped = 1,
            Err(e) => {
                debug!(error = %e, message_id, "reply bump patch failed");
                result.ok = false;
                result.errors = 1;
            }
        }
        result
    }

    /// Count assignments in one status (read-API/metrics helper).
    pub async fn count_by_status(&self, status: AssignmentStatus) -> Result<u64> {
        let path = format!("{}?select=id&status=eq.{}", self.table, status.as_str());
        self.rest.count(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutorpipe_core::types::ParsedAssignment;

    fn payload(code: Option<&str>) -> AssignmentPayload {
        AssignmentPayload {
            cid: "worker:t.me/x:42:7".to_string(),
            pipeline_version: "v1".to_string(),
            channel_link: "t.me/x".to_string(),
            channel_id: Some("100123".to_string()),
            channel_title: None,
            channel_username: Some("x".to_string()),
            message_id: Some("42".to_string()),
            message_link: Some("https://t.me/x/42".to_string()),
            date: None,
            source_last_seen: None,
            raw_text: "raw".to_string(),
            parsed: ParsedAssignment {
                assignment_code: code.map(str::to_string),
                ..ParsedAssignment::default()
            },
        }
    }

    #[test]
    fn external_id_prefers_assignment_code() {
        assert_eq!(derive_external_id(&payload(Some("A123"))), "A123");
    }

    #[test]
    fn external_id_falls_back_to_synthetic_then_link() {
        let mut p = payload(None);
        assert_eq!(derive_external_id(&p), "tg:100123:42");
        p.channel_id = None;
        assert_eq!(derive_external_id(&p), "https://t.me/x/42");
        p.message_link = None;
        assert_eq!(derive_external_id(&p), "worker:t.me/x:42:7");
    }

    #[test]
    fn merge_fills_nulls_and_keeps_non_null() {
        let existing = serde_json::json!({
            "rate": {"min": 40},
            "address": null,
            "start_date": "2026-01-01"
        });
        let incoming = serde_json::json!({
            "rate": {"min": 50},
            "address": ["Blk 1"],
            "start_date": null
        });
        let merged = merge_parsed(&existing, &incoming);
        // non-null incoming wins
        assert_eq!(merged["rate"]["min"], 50);
        // incoming fills a previously-null field
        assert_eq!(merged["address"][0], "Blk 1");
        // incoming null never clobbers existing non-null
        assert_eq!(merged["start_date"], "2026-01-01");
    }

    #[test]
    fn merge_with_null_existing_takes_incoming() {
        let merged = merge_parsed(&Value::Null, &serde_json::json!({"a": 1}));
        assert_eq!(merged["a"], 1);
    }
}
