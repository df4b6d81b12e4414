use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tutorpipe_core::types::RawMessage;

/// A resolved channel: the stable string ref plus the numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChannel {
    pub channel_link: String,
    pub id: i64,
    pub title: Option<String>,
    pub username: Option<String>,
}

/// One message as observed at the source, already detached from the client
/// library's types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub edit_date: Option<DateTime<Utc>>,
    pub text: String,
    pub sender_id: Option<i64>,
    pub is_forward: bool,
    pub reply_to_msg_id: Option<i64>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub reply_count: Option<i64>,
}

impl SourceMessage {
    /// Build the raw-store row for this message. The full source object is
    /// preserved under `message_json` for replay.
    pub fn to_raw_row(&self, channel: &SourceChannel) -> RawMessage {
        let now = Utc::now();
        RawMessage {
            id: None,
            channel_link: channel.channel_link.clone(),
            channel_id: Some(channel.id.to_string()),
            message_id: self.id.to_string(),
            message_date: self.date,
            edit_date: self.edit_date,
            sender_id: self.sender_id.map(|s| s.to_string()),
            is_forward: self.is_forward,
            is_reply: self.reply_to_msg_id.is_some(),
            raw_text: {
                let t = self.text.trim();
                (!t.is_empty()).then(|| t.to_string())
            },
            entities_json: None,
            media_json: None,
            views: self.views,
            forwards: self.forwards,
            reply_count: self.reply_count,
            deleted_at: None,
            last_seen_at: Some(now),
            message_json: serde_json::to_value(self).ok(),
        }
    }
}

/// Live events from the tail subscription.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    New {
        channel: SourceChannel,
        message: SourceMessage,
    },
    Edited {
        channel: SourceChannel,
        message: SourceMessage,
    },
    Deleted {
        channel_id: Option<i64>,
        message_ids: Vec<i64>,
    },
    /// Updates the pipeline does not consume (callbacks, typing, ...).
    Ignored,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Server-specified wait; honor it (with jitter) before retrying.
    #[error("flood wait for {seconds}s")]
    FloodWait { seconds: u64 },

    #[error("slow mode wait for {seconds}s")]
    SlowMode { seconds: u64 },

    #[error("flood error")]
    Flood,

    #[error("source not authorized: {0}")]
    Unauthorized(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("transient source error: {0}")]
    Transient(String),
}

impl SourceError {
    pub fn code(&self) -> &'static str {
        match self {
            SourceError::FloodWait { .. } | SourceError::SlowMode { .. } | SourceError::Flood => {
                "source_rate_limited"
            }
            SourceError::Unauthorized(_) => "config",
            SourceError::UnknownChannel(_) => "source_transient",
            SourceError::Transient(_) => "source_transient",
        }
    }

    /// Server-dictated wait, when the error carries one.
    pub fn server_wait_seconds(&self) -> Option<u64> {
        match self {
            SourceError::FloodWait { seconds } | SourceError::SlowMode { seconds } => Some(*seconds),
            _ => None,
        }
    }

    /// Non-retriable errors abort instead of backing off.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Unauthorized(_))
    }
}

/// Normalize a channel ref to the stable `t.me/<name>` string form.
pub fn normalize_channel_ref(ch: &str) -> String {
    let s = ch.trim();
    let s = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
        .unwrap_or(s);
    let s = s.strip_prefix("t.me/").unwrap_or(s);
    let s = s.strip_prefix('@').unwrap_or(s);
    format!("t.me/{s}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_channel_refs() {
        for input in ["name", "@name", "t.me/name", "https://t.me/name", " name "] {
            assert_eq!(normalize_channel_ref(input), "t.me/name", "input {input:?}");
        }
    }

    #[test]
    fn raw_row_carries_flags_and_replay_object() {
        let channel = SourceChannel {
            channel_link: "t.me/chan".to_string(),
            id: 999,
            title: Some("Chan".to_string()),
            username: Some("chan".to_string()),
        };
        let msg = SourceMessage {
            id: 42,
            date: Utc::now(),
            edit_date: None,
            text: "  hello  ".to_string(),
            sender_id: Some(7),
            is_forward: true,
            reply_to_msg_id: Some(41),
            views: Some(100),
            forwards: Some(2),
            reply_count: None,
        };
        let row = msg.to_raw_row(&channel);
        assert_eq!(row.channel_link, "t.me/chan");
        assert_eq!(row.channel_id.as_deref(), Some("999"));
        assert_eq!(row.message_id, "42");
        assert!(row.is_forward);
        assert!(row.is_reply);
        assert_eq!(row.raw_text.as_deref(), Some("hello"));
        let replay = row.message_json.expect("message_json kept");
        assert_eq!(replay["id"], 42);
        assert_eq!(replay["reply_to_msg_id"], 41);
    }

    #[test]
    fn error_codes_map_to_taxonomy() {
        assert_eq!(SourceError::FloodWait { seconds: 30 }.code(), "source_rate_limited");
        assert_eq!(SourceError::Transient("x".into()).code(), "source_transient");
        assert!(SourceError::Unauthorized("no session".into()).is_fatal());
        assert_eq!(
            SourceError::FloodWait { seconds: 30 }.server_wait_seconds(),
            Some(30)
        );
    }
}
