//! Shared worker state: stores, LLM client, breaker, delivery clients and
//! the channel-metadata cache.

use std::sync::Arc;

use dashmap::DashMap;

use tutorpipe_core::heartbeat::HeartbeatWriter;
use tutorpipe_core::types::ChannelInfo;
use tutorpipe_core::{CoreError, PipeConfig};
use tutorpipe_llm::{CircuitBreaker, LlmExtractor};
use tutorpipe_observe::PipeMetrics;
use tutorpipe_store::{AssignmentStore, ExtractionQueue, RawStore, SupabaseRest};

use crate::delivery::DeliveryClient;
use crate::geocode::Geocoder;

pub struct WorkerContext {
    pub cfg: PipeConfig,
    pub store: RawStore,
    pub queue: ExtractionQueue,
    pub assignments: AssignmentStore,
    pub llm: LlmExtractor,
    pub breaker: CircuitBreaker,
    pub delivery: DeliveryClient,
    pub geocoder: Geocoder,
    pub metrics: Arc<PipeMetrics>,
    pub heartbeat: HeartbeatWriter,
    /// Channel metadata cache shared across jobs within this process.
    pub channel_cache: DashMap<String, ChannelInfo>,
    /// Policy grammar for compilation identifiers (full-match).
    pub identifier_re: regex::Regex,
}

impl WorkerContext {
    pub fn new(cfg: PipeConfig) -> Result<Self, CoreError> {
        cfg.validate_for_worker()?;
        let rest = SupabaseRest::new(&cfg.supabase)
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let store = RawStore::new(&cfg);
        let queue = ExtractionQueue::new(rest.clone(), cfg.supabase.extractions_table.clone());
        let assignments = AssignmentStore::new(rest, cfg.supabase.assignments_table.clone());
        let llm = LlmExtractor::new(&cfg.llm).map_err(|e| CoreError::Config(e.to_string()))?;
        let breaker = CircuitBreaker::new(cfg.breaker.failure_threshold, cfg.breaker.timeout_seconds);
        let delivery = DeliveryClient::new(&cfg.delivery).map_err(CoreError::Config)?;
        let geocoder = Geocoder::new(&cfg.geocoder).map_err(CoreError::Config)?;
        let metrics = PipeMetrics::new(&cfg.pipeline_version);
        let heartbeat =
            HeartbeatWriter::new(cfg.heartbeat.worker_file.clone(), cfg.pipeline_version.clone());
        let identifier_re = regex::Regex::new(&format!("^(?:{})$", cfg.compilation.identifier_pattern))
            .map_err(|e| CoreError::Config(format!("compilation.identifier_pattern: {e}")))?;
        Ok(Self {
            cfg,
            store,
            queue,
            assignments,
            llm,
            breaker,
            delivery,
            geocoder,
            metrics,
            heartbeat,
            channel_cache: DashMap::new(),
            identifier_re,
        })
    }

    /// Channel metadata with a small in-process cache in front of the store.
    pub async fn channel_info(&self, channel_link: &str) -> ChannelInfo {
        if let Some(hit) = self.channel_cache.get(channel_link) {
            return hit.clone();
        }
        let info = self
            .store
            .fetch_channel(channel_link)
            .await
            .unwrap_or_else(|| ChannelInfo {
                channel_link: channel_link.to_string(),
                channel_id: None,
                title: None,
            });
        self.channel_cache
            .insert(channel_link.to_string(), info.clone());
        info
    }

    pub fn pipeline_version(&self) -> &str {
        &self.cfg.pipeline_version
    }
}
