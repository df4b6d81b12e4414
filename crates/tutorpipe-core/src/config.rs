use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Queue partition key. Changing it schedules a full reprocess of raw rows.
pub const DEFAULT_PIPELINE_VERSION: &str = "2026-01-02_det_time_v1";

/// Top-level config (tutorpipe.toml + TUTORPIPE_* env overrides).
///
/// Environment is the canonical surface; CLI flags override individual
/// fields after loading. Nested keys use `__` in env form, e.g.
/// `TUTORPIPE_LLM__API_URL`, `TUTORPIPE_WORKER__CLAIM_BATCH_SIZE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: String,
    #[serde(default)]
    pub supabase: SupabaseConfig,
    /// Append-only JSONL file used when the store is disabled or down.
    /// Empty disables the fallback entirely.
    #[serde(default)]
    pub raw_fallback_file: Option<String>,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub catchup: CatchupConfig,
    #[serde(default)]
    pub compilation: CompilationConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
    #[serde(default)]
    pub observe: ObserveConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            pipeline_version: default_pipeline_version(),
            supabase: SupabaseConfig::default(),
            raw_fallback_file: None,
            llm: LlmConfig::default(),
            breaker: BreakerConfig::default(),
            geocoder: GeocoderConfig::default(),
            worker: WorkerConfig::default(),
            delivery: DeliveryConfig::default(),
            telegram: TelegramConfig::default(),
            catchup: CatchupConfig::default(),
            compilation: CompilationConfig::default(),
            freshness: FreshnessConfig::default(),
            observe: ObserveConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Supabase-style REST endpoint. One canonical URL variable
/// (`TUTORPIPE_SUPABASE__URL`); no host/docker switching heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_channels_table")]
    pub channels_table: String,
    #[serde(default = "default_messages_table")]
    pub messages_table: String,
    #[serde(default = "default_runs_table")]
    pub runs_table: String,
    #[serde(default = "default_progress_table")]
    pub progress_table: String,
    #[serde(default = "default_extractions_table")]
    pub extractions_table: String,
    #[serde(default = "default_assignments_table")]
    pub assignments_table: String,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key: String::new(),
            enabled: false,
            channels_table: default_channels_table(),
            messages_table: default_messages_table(),
            runs_table: default_runs_table(),
            progress_table: default_progress_table(),
            extractions_table: default_extractions_table(),
            assignments_table: default_assignments_table(),
        }
    }
}

impl SupabaseConfig {
    /// Store is usable only with both URL and key present and the flag on.
    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.url.trim().is_empty() && !self.key.trim().is_empty()
    }

    pub fn base_url(&self) -> String {
        self.url.trim().trim_end_matches('/').to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_api_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_llm_api_url(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub timeout_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            timeout_seconds: default_breaker_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_geocoder_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_geocoder_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_agent: default_geocoder_user_agent(),
            timeout_seconds: default_geocoder_timeout_seconds(),
        }
    }
}

/// Mode for the hard validator stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardValidateMode {
    Off,
    Report,
    Enforce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: u32,
    #[serde(default = "default_idle_sleep_seconds")]
    pub idle_sleep_seconds: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: f64,
    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: f64,
    #[serde(default = "default_stale_processing_seconds")]
    pub stale_processing_seconds: u64,
    #[serde(default = "default_hard_validate_mode")]
    pub hard_validate_mode: HardValidateMode,
    #[serde(default)]
    pub use_normalized_text_for_llm: bool,
    #[serde(default = "bool_true")]
    pub enable_deterministic_signals: bool,
    #[serde(default = "bool_true")]
    pub use_deterministic_time: bool,
    #[serde(default = "bool_true")]
    pub enable_postal_code_estimated: bool,
    #[serde(default = "bool_true")]
    pub enable_broadcast: bool,
    #[serde(default = "bool_true")]
    pub enable_dms: bool,
    /// Exit instead of sleeping once the queue drains (test/migration runs).
    #[serde(default)]
    pub oneshot: bool,
    /// Stop after N processed jobs; 0 means unbounded.
    #[serde(default)]
    pub max_jobs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: default_claim_batch_size(),
            idle_sleep_seconds: default_idle_sleep_seconds(),
            max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_max_seconds: default_backoff_max_seconds(),
            stale_processing_seconds: default_stale_processing_seconds(),
            hard_validate_mode: default_hard_validate_mode(),
            use_normalized_text_for_llm: false,
            enable_deterministic_signals: true,
            use_deterministic_time: true,
            enable_postal_code_estimated: true,
            enable_broadcast: true,
            enable_dms: true,
            oneshot: false,
            max_jobs: 0,
        }
    }
}

/// Broadcast/DM collaborators and the triage chat, reached over plain HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeliveryConfig {
    pub broadcast_api_url: Option<String>,
    pub dm_api_url: Option<String>,
    pub triage_api_url: Option<String>,
    pub triage_chat_id: Option<i64>,
    #[serde(default = "default_delivery_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub api_id: i32,
    #[serde(default)]
    pub api_hash: String,
    #[serde(default = "default_session_file")]
    pub session_file: String,
    /// Channel refs (`t.me/<name>` or bare usernames) monitored by default.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_tg_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_tg_initial_delay")]
    pub initial_retry_delay_seconds: f64,
    #[serde(default = "default_tg_max_delay")]
    pub max_retry_delay_seconds: f64,
    #[serde(default = "default_tg_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            session_file: default_session_file(),
            channels: Vec::new(),
            max_retries: default_tg_max_retries(),
            initial_retry_delay_seconds: default_tg_initial_delay(),
            max_retry_delay_seconds: default_tg_max_delay(),
            backoff_multiplier: default_tg_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_target_lag_minutes")]
    pub target_lag_minutes: i64,
    #[serde(default = "default_overlap_minutes")]
    pub overlap_minutes: i64,
    #[serde(default = "default_chunk_hours")]
    pub chunk_hours: i64,
    #[serde(default = "default_low_watermark")]
    pub queue_low_watermark: u64,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: f64,
    #[serde(default = "default_catchup_state_file")]
    pub state_file: String,
    #[serde(default = "default_lookback_hours")]
    pub default_lookback_hours: i64,
    #[serde(default = "default_backfill_max_attempts")]
    pub backfill_max_attempts: u32,
    #[serde(default = "default_backfill_base_backoff")]
    pub backfill_base_backoff_seconds: f64,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_lag_minutes: default_target_lag_minutes(),
            overlap_minutes: default_overlap_minutes(),
            chunk_hours: default_chunk_hours(),
            queue_low_watermark: default_low_watermark(),
            check_interval_seconds: default_check_interval_seconds(),
            state_file: default_catchup_state_file(),
            default_lookback_hours: default_lookback_hours(),
            backfill_max_attempts: default_backfill_max_attempts(),
            backfill_base_backoff_seconds: default_backfill_base_backoff(),
        }
    }
}

impl CatchupConfig {
    /// Clamp tunables to sane operational ranges before use.
    pub fn clamped(&self) -> Self {
        let mut c = self.clone();
        c.target_lag_minutes = c.target_lag_minutes.clamp(0, 60);
        c.overlap_minutes = c.overlap_minutes.clamp(0, 120);
        c.chunk_hours = c.chunk_hours.clamp(1, 72);
        c.check_interval_seconds = c.check_interval_seconds.clamp(5.0, 600.0);
        c
    }
}

/// Thresholds for the compilation detector plus the identifier grammar,
/// which is deployment policy rather than code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationConfig {
    #[serde(default = "default_comp_code_hits")]
    pub code_hits: usize,
    #[serde(default = "default_comp_label_hits")]
    pub label_hits: usize,
    #[serde(default = "default_comp_postal_hits")]
    pub postal_hits: usize,
    #[serde(default = "default_comp_url_hits")]
    pub url_hits: usize,
    #[serde(default = "default_comp_block_count")]
    pub block_count: usize,
    /// Candidate identifier shape; bare 6-digit tokens are always excluded.
    #[serde(default = "default_identifier_pattern")]
    pub identifier_pattern: String,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            code_hits: default_comp_code_hits(),
            label_hits: default_comp_label_hits(),
            postal_hits: default_comp_postal_hits(),
            url_hits: default_comp_url_hits(),
            block_count: default_comp_block_count(),
            identifier_pattern: default_identifier_pattern(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_fresh_minutes")]
    pub fresh_minutes: i64,
    #[serde(default = "default_recent_hours")]
    pub recent_hours: i64,
    #[serde(default = "default_stale_days")]
    pub stale_days: i64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            fresh_minutes: default_fresh_minutes(),
            recent_hours: default_recent_hours(),
            stale_days: default_stale_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveConfig {
    #[serde(default = "default_collector_port")]
    pub collector_port: u16,
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    #[serde(default = "default_observe_bind")]
    pub bind: String,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            collector_port: default_collector_port(),
            worker_port: default_worker_port(),
            bind: default_observe_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_collector_heartbeat")]
    pub collector_file: String,
    #[serde(default = "default_worker_heartbeat")]
    pub worker_file: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            collector_file: default_collector_heartbeat(),
            worker_file: default_worker_heartbeat(),
        }
    }
}

impl PipeConfig {
    /// Load config from an optional TOML file with TUTORPIPE_* env overrides.
    ///
    /// Checks in order: explicit path argument, `TUTORPIPE_CONFIG`, then
    /// `./tutorpipe.toml`. A missing file is fine; env alone is a valid
    /// configuration.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TUTORPIPE_CONFIG").ok())
            .unwrap_or_else(|| "tutorpipe.toml".to_string());

        let config: PipeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TUTORPIPE_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Log the resolved persistence endpoint once at startup so host
    /// connectivity issues are obvious in the logs.
    pub fn log_resolved(&self) {
        tracing::info!(
            supabase_url = %self.supabase.base_url(),
            supabase_enabled = self.supabase.is_enabled(),
            pipeline_version = %self.pipeline_version,
            "config resolved"
        );
    }

    /// Fail fast when the collector is missing required source credentials.
    pub fn validate_for_collector(&self) -> Result<()> {
        if self.telegram.api_id == 0 || self.telegram.api_hash.trim().is_empty() {
            return Err(CoreError::Config(
                "telegram.api_id and telegram.api_hash are required".to_string(),
            ));
        }
        Ok(())
    }

    /// Fail fast when the worker cannot reach its queue.
    pub fn validate_for_worker(&self) -> Result<()> {
        if !self.supabase.is_enabled() {
            return Err(CoreError::Config(
                "supabase.url, supabase.key and supabase.enabled are required for the worker"
                    .to_string(),
            ));
        }
        if self.pipeline_version.trim().is_empty() {
            return Err(CoreError::Config("pipeline_version must be non-empty".to_string()));
        }
        Ok(())
    }
}

fn bool_true() -> bool {
    true
}
fn default_pipeline_version() -> String {
    DEFAULT_PIPELINE_VERSION.to_string()
}
fn default_channels_table() -> String {
    "telegram_channels".to_string()
}
fn default_messages_table() -> String {
    "telegram_messages_raw".to_string()
}
fn default_runs_table() -> String {
    "ingestion_runs".to_string()
}
fn default_progress_table() -> String {
    "ingestion_run_progress".to_string()
}
fn default_extractions_table() -> String {
    "telegram_extractions".to_string()
}
fn default_assignments_table() -> String {
    "assignments".to_string()
}
fn default_llm_api_url() -> String {
    "http://localhost:1234".to_string()
}
fn default_llm_model() -> String {
    "lfm2-8b-a1b".to_string()
}
fn default_llm_max_tokens() -> u32 {
    2048
}
fn default_llm_timeout_seconds() -> u64 {
    200
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_timeout() -> u64 {
    60
}
fn default_geocoder_user_agent() -> String {
    "TutorPipe/1.0".to_string()
}
fn default_geocoder_timeout_seconds() -> u64 {
    30
}
fn default_claim_batch_size() -> u32 {
    10
}
fn default_idle_sleep_seconds() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_seconds() -> f64 {
    1.5
}
fn default_backoff_max_seconds() -> f64 {
    60.0
}
fn default_stale_processing_seconds() -> u64 {
    900
}
fn default_hard_validate_mode() -> HardValidateMode {
    HardValidateMode::Report
}
fn default_delivery_timeout_seconds() -> u64 {
    20
}
fn default_session_file() -> String {
    "tutorpipe.session".to_string()
}
fn default_tg_max_retries() -> u32 {
    5
}
fn default_tg_initial_delay() -> f64 {
    1.0
}
fn default_tg_max_delay() -> f64 {
    300.0
}
fn default_tg_backoff_multiplier() -> f64 {
    2.0
}
fn default_target_lag_minutes() -> i64 {
    10
}
fn default_overlap_minutes() -> i64 {
    30
}
fn default_chunk_hours() -> i64 {
    6
}
fn default_low_watermark() -> u64 {
    50
}
fn default_check_interval_seconds() -> f64 {
    30.0
}
fn default_catchup_state_file() -> String {
    "state/recovery_catchup_state.json".to_string()
}
fn default_lookback_hours() -> i64 {
    168
}
fn default_backfill_max_attempts() -> u32 {
    3
}
fn default_backfill_base_backoff() -> f64 {
    5.0
}
fn default_comp_code_hits() -> usize {
    3
}
fn default_comp_label_hits() -> usize {
    5
}
fn default_comp_postal_hits() -> usize {
    3
}
fn default_comp_url_hits() -> usize {
    3
}
fn default_comp_block_count() -> usize {
    12
}
fn default_identifier_pattern() -> String {
    r"[A-Za-z]\d{3,10}[A-Za-z0-9]{0,6}".to_string()
}
fn default_fresh_minutes() -> i64 {
    60
}
fn default_recent_hours() -> i64 {
    24
}
fn default_stale_days() -> i64 {
    7
}
fn default_collector_port() -> u16 {
    9001
}
fn default_worker_port() -> u16 {
    9002
}
fn default_observe_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_collector_heartbeat() -> String {
    "state/collector_heartbeat.json".to_string()
}
fn default_worker_heartbeat() -> String {
    "state/worker_heartbeat.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = PipeConfig::default();
        assert_eq!(cfg.pipeline_version, DEFAULT_PIPELINE_VERSION);
        assert_eq!(cfg.worker.claim_batch_size, 10);
        assert_eq!(cfg.worker.hard_validate_mode, HardValidateMode::Report);
        assert!(!cfg.supabase.is_enabled());
        assert_eq!(cfg.compilation.block_count, 12);
    }

    #[test]
    fn supabase_enabled_requires_credentials() {
        let mut sb = SupabaseConfig {
            enabled: true,
            ..SupabaseConfig::default()
        };
        assert!(!sb.is_enabled());
        sb.url = "http://localhost:8000/".to_string();
        sb.key = "service-role".to_string();
        assert!(sb.is_enabled());
        assert_eq!(sb.base_url(), "http://localhost:8000");
    }

    #[test]
    fn worker_validation_fails_fast_without_store() {
        let cfg = PipeConfig::default();
        let err = cfg.validate_for_worker().unwrap_err();
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn catchup_clamp_bounds_tunables() {
        let c = CatchupConfig {
            target_lag_minutes: 999,
            chunk_hours: 0,
            check_interval_seconds: 0.1,
            ..CatchupConfig::default()
        }
        .clamped();
        assert_eq!(c.target_lag_minutes, 60);
        assert_eq!(c.chunk_hours, 1);
        assert_eq!(c.check_interval_seconds, 5.0);
    }
}
