//! Nominatim-backed postal-code estimation with polite backoff and an
//! in-process cache. Disabled entirely by config.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use tutorpipe_core::config::GeocoderConfig;
use tutorpipe_extract::postal::clean_address_for_geocoding;

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
const MAX_ATTEMPTS: u32 = 3;

pub struct Geocoder {
    client: reqwest::Client,
    enabled: bool,
    cache: Mutex<HashMap<String, Option<String>>>,
}

fn find_six_digits(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut run = 0usize;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() {
            run += 1;
            // Exactly six digits: longer runs are phone numbers, not postals.
            if run == 6 && !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
                return Some(s[i + 1 - 6..=i].to_string());
            }
        } else {
            run = 0;
        }
    }
    None
}

impl Geocoder {
    pub fn new(cfg: &GeocoderConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            enabled: cfg.enabled,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Estimate a 6-digit postal code for an address. A heuristic in-text
    /// match short-circuits the network call; lookups (including misses) are
    /// cached for the process lifetime.
    pub async fn estimate_postal(&self, address: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let cleaned = clean_address_for_geocoding(address);
        if cleaned.is_empty() {
            return None;
        }
        if let Some(code) = find_six_digits(&cleaned) {
            debug!(address_chars = cleaned.len(), "postal heuristic hit");
            return Some(code);
        }

        if let Some(hit) = self.cache.lock().unwrap().get(&cleaned) {
            return hit.clone();
        }
        let result = self.lookup(&cleaned).await;
        self.cache
            .lock()
            .unwrap()
            .insert(cleaned, result.clone());
        result
    }

    async fn lookup(&self, cleaned: &str) -> Option<String> {
        for attempt in 1..=MAX_ATTEMPTS {
            let resp = self
                .client
                .get(NOMINATIM_URL)
                .query(&[
                    ("q", format!("{cleaned}, Singapore")),
                    ("format", "json".to_string()),
                    ("countrycodes", "sg".to_string()),
                    ("addressdetails", "1".to_string()),
                    ("limit", "5".to_string()),
                ])
                .send()
                .await;

            let resp = match resp {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(error = %e, attempt, "nominatim lookup failed");
                    tokio::time::sleep(Duration::from_secs_f64((attempt as f64).min(10.0))).await;
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if status == 429 || status == 503 {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok());
                let sleep_s = retry_after.unwrap_or(2.0 * attempt as f64).min(20.0);
                warn!(status, sleep_s, "nominatim throttled");
                tokio::time::sleep(Duration::from_secs_f64(sleep_s)).await;
                continue;
            }
            if status >= 400 {
                return None;
            }

            let results: Vec<Value> = resp.json().await.unwrap_or_default();
            for r in &results {
                if let Some(postcode) = r
                    .get("address")
                    .and_then(|a| a.get("postcode"))
                    .and_then(Value::as_str)
                {
                    if let Some(code) = find_six_digits(postcode) {
                        return Some(code);
                    }
                }
                if let Some(display) = r.get("display_name").and_then(Value::as_str) {
                    if let Some(code) = find_six_digits(display) {
                        return Some(code);
                    }
                }
            }
            debug!(results = results.len(), "nominatim lookup found no postcode");
            return None;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_exact_six_digit_runs() {
        assert_eq!(find_six_digits("S 529123 SG").as_deref(), Some("529123"));
        assert_eq!(find_six_digits("12345"), None);
        assert_eq!(find_six_digits("1234567"), None);
        assert_eq!(find_six_digits("no digits"), None);
    }

    #[tokio::test]
    async fn disabled_geocoder_returns_none() {
        let g = Geocoder::new(&GeocoderConfig {
            enabled: false,
            ..GeocoderConfig::default()
        })
        .unwrap();
        assert_eq!(g.estimate_postal("Blk 1 Tampines").await, None);
    }

    #[tokio::test]
    async fn heuristic_short_circuits_network() {
        let g = Geocoder::new(&GeocoderConfig::default()).unwrap();
        assert_eq!(
            g.estimate_postal("Blk 21 Marina Way 018978").await.as_deref(),
            Some("018978")
        );
    }
}
