//! HTTP clients for the downstream collaborators (broadcast, DM, triage).
//!
//! Each accepts the canonical assignment payload and answers
//! `{ok, action, response}`. Failures are recorded in job meta and never
//! fatal to the job.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use tutorpipe_core::config::DeliveryConfig;
use tutorpipe_core::types::AssignmentPayload;

#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    broadcast_url: Option<String>,
    dm_url: Option<String>,
    triage_url: Option<String>,
    triage_chat_id: Option<i64>,
}

impl DeliveryClient {
    pub fn new(cfg: &DeliveryConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            broadcast_url: cfg.broadcast_api_url.clone(),
            dm_url: cfg.dm_api_url.clone(),
            triage_url: cfg.triage_api_url.clone(),
            triage_chat_id: cfg.triage_chat_id,
        })
    }

    pub fn broadcast_enabled(&self) -> bool {
        self.broadcast_url.is_some()
    }

    pub fn dms_enabled(&self) -> bool {
        self.dm_url.is_some()
    }

    async fn post_payload(&self, url: &str, payload: &AssignmentPayload) -> Value {
        match self.client.post(url).json(payload).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                if status < 400 {
                    json!({"ok": true, "action": body.get("action").cloned().unwrap_or(Value::Null), "response": body})
                } else {
                    json!({"ok": false, "status_code": status, "response": body})
                }
            }
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    }

    /// Broadcast a freshly inserted assignment. Returns the collaborator's
    /// `{ok, action, response}` document.
    pub async fn broadcast(&self, payload: &AssignmentPayload) -> Option<Value> {
        let url = self.broadcast_url.as_deref()?;
        let res = self.post_payload(url, payload).await;
        debug!(cid = %payload.cid, ok = res["ok"].as_bool(), "broadcast result");
        Some(res)
    }

    /// Fan out direct messages for a freshly inserted assignment.
    pub async fn send_dms(&self, payload: &AssignmentPayload) -> Option<Value> {
        let url = self.dm_url.as_deref()?;
        let res = self.post_payload(url, payload).await;
        debug!(cid = %payload.cid, ok = res["ok"].as_bool(), "dm result");
        Some(res)
    }

    /// Best-effort copy of a skipped/failed raw message to the triage chat.
    pub async fn triage(
        &self,
        kind: &str,
        channel_link: &str,
        raw_text: &str,
        summary: &str,
        stage: &str,
        extracted_codes: &[String],
    ) {
        let (Some(url), Some(chat_id)) = (self.triage_url.as_deref(), self.triage_chat_id) else {
            return;
        };
        let body = json!({
            "chat_id": chat_id,
            "kind": kind,
            "channel_link": channel_link,
            "stage": stage,
            "summary": summary.chars().take(500).collect::<String>(),
            "extracted_codes": extracted_codes,
            "raw_text": raw_text.chars().take(3500).collect::<String>(),
        });
        if let Err(e) = self.client.post(url).json(&body).send().await {
            warn!(error = %e, kind, "triage report failed");
        }
    }
}
