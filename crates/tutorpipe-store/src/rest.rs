//! Thin PostgREST client: upserts with `on_conflict`, filtered GET/PATCH,
//! RPC calls and exact-count reads.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use tutorpipe_core::config::SupabaseConfig;

use crate::error::{Result, StoreError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct SupabaseRest {
    client: reqwest::Client,
    base: String,
    key: String,
}

/// Percent-encode one value for use in a PostgREST filter (`col=eq.<value>`).
pub fn quote(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

impl SupabaseRest {
    pub fn new(cfg: &SupabaseConfig) -> Result<Self> {
        if !cfg.is_enabled() {
            return Err(StoreError::Disabled);
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base: format!("{}/rest/v1", cfg.base_url()),
            key: cfg.key.clone(),
        })
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}/{}", self.base, path_and_query.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path_and_query: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path_and_query))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header("content-type", "application/json")
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status().as_u16();
        if status == 300 {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::AmbiguousOverload(body.chars().take(400).collect()));
        }
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            warn!(status, body = %body.chars().take(400).collect::<String>(), "postgrest error response");
            return Err(StoreError::Status {
                status,
                body: body.chars().take(400).collect(),
            });
        }
        Ok(resp)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T> {
        let resp = self
            .request(reqwest::Method::GET, path_and_query)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    /// Exact row count for a filter, via `Prefer: count=exact` and the
    /// `content-range` response header (`0-0/123`).
    pub async fn count(&self, path_and_query: &str) -> Result<u64> {
        let resp = self
            .request(reqwest::Method::GET, path_and_query)
            .header("prefer", "count=exact")
            .header("range", "0-0")
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(total)
    }

    /// POST rows (insert/upsert). Returns the response body as JSON when the
    /// prefer header asked for representation, else `Value::Null`.
    pub async fn post(
        &self,
        path_and_query: &str,
        body: &Value,
        prefer: Option<&str>,
    ) -> Result<Value> {
        let mut req = self.request(reqwest::Method::POST, path_and_query).json(body);
        if let Some(p) = prefer {
            req = req.header("prefer", p);
        }
        let resp = Self::check(req.send().await?).await?;
        if prefer.is_some_and(|p| p.contains("return=representation")) {
            resp.json::<Value>()
                .await
                .map_err(|e| StoreError::Decode(e.to_string()))
        } else {
            Ok(Value::Null)
        }
    }

    pub async fn patch(
        &self,
        path_and_query: &str,
        body: &Value,
        prefer: Option<&str>,
    ) -> Result<()> {
        let mut req = self.request(reqwest::Method::PATCH, path_and_query).json(body);
        req = req.header("prefer", prefer.unwrap_or("return=minimal"));
        Self::check(req.send().await?).await?;
        Ok(())
    }

    /// Call a database RPC endpoint and decode its JSON result.
    pub async fn rpc<T: DeserializeOwned>(&self, name: &str, params: &Value) -> Result<T> {
        let resp = self
            .request(reqwest::Method::POST, &format!("rpc/{name}"))
            .json(params)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}
