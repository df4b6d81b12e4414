//! OpenAI-compatible chat-completions client for the extraction call.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use tutorpipe_core::config::LlmConfig;

use crate::error::LlmError;
use crate::prompt;

pub struct LlmExtractor {
    client: reqwest::Client,
    api_url: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl LlmExtractor {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LlmError::Other(e.to_string()))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.0,
            "max_tokens": self.max_tokens,
        });
        let url = format!("{}/v1/chat/completions", self.api_url);

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "LLM API error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: text.chars().take(400).collect(),
            });
        }

        let api: ApiResponse = resp.json().await.map_err(|e| LlmError::Other(e.to_string()))?;
        api.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content.or(c.message.text))
            .filter(|t| !t.trim().is_empty())
            .ok_or(LlmError::BadResponse)
    }

    /// Single-call extraction: raw (or normalized) post text in, parsed JSON
    /// object out. `channel_hint` and `cid` are logging context only.
    pub async fn extract(
        &self,
        text: &str,
        channel_hint: &str,
        cid: &str,
    ) -> Result<Value, LlmError> {
        let user = prompt::build_user_prompt(text);
        debug!(
            cid,
            channel = channel_hint,
            model = %self.model,
            prompt_chars = user.len(),
            "llm_extract_start"
        );
        let content = self.chat(prompt::SYSTEM_PROMPT, &user).await?;
        let parsed = parse_json_content(&content)?;
        debug!(cid, channel = channel_hint, "llm_extract_ok");
        Ok(parsed)
    }

    /// Compilation confirm step: ask the model to enumerate identifier
    /// candidates found in a bundle message. Verification against the raw
    /// text is the caller's job.
    pub async fn enumerate_identifiers(&self, text: &str, cid: &str) -> Result<Vec<String>, LlmError> {
        let user = prompt::build_user_prompt(text);
        let content = self.chat(prompt::IDENTIFIER_PROMPT, &user).await?;
        let parsed = parse_json_content(&content)?;
        debug!(cid, "llm_identifier_enumeration_ok");
        let ids = parsed
            .get("identifiers")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Locate the outermost `{...}` in model output, repair trailing commas and
/// parse. Tolerates code fences and escaped underscores.
pub fn parse_json_content(content: &str) -> Result<Value, LlmError> {
    let text = content.trim().trim_matches('`').trim();
    let start = text.find('{');
    let end = text.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(LlmError::InvalidJson("no object braces in output".to_string()));
    };
    if end < start {
        return Err(LlmError::InvalidJson("mismatched object braces".to_string()));
    }
    let candidate = text[start..=end].replace("\\_", "_");
    let repaired = TRAILING_COMMA_RE.replace_all(&candidate, "$1");
    serde_json::from_str(&repaired).map_err(|e| {
        warn!(candidate_chars = repaired.len(), "llm_json_parse_failed");
        LlmError::InvalidJson(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_object() {
        let v = parse_json_content(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn strips_fences_and_prose() {
        let v = parse_json_content("```json\nSure thing {\"a\": [1, 2]} done\n```").unwrap();
        assert_eq!(v["a"][1], 2);
    }

    #[test]
    fn repairs_trailing_commas() {
        let v = parse_json_content(r#"{"a": [1, 2,], "b": {"c": 3,},}"#).unwrap();
        assert_eq!(v["a"][0], 1);
        assert_eq!(v["b"]["c"], 3);
    }

    #[test]
    fn unescapes_underscores() {
        let v = parse_json_content(r#"{"assignment\_code": "A1"}"#).unwrap();
        assert_eq!(v["assignment_code"], "A1");
    }

    #[test]
    fn missing_braces_is_invalid_json() {
        let err = parse_json_content("no json here").unwrap_err();
        assert_eq!(err.code(), "llm_invalid_json");
    }

    #[test]
    fn broken_json_is_invalid() {
        let err = parse_json_content(r#"{"a": }"#).unwrap_err();
        assert_eq!(err.code(), "llm_invalid_json");
    }
}
