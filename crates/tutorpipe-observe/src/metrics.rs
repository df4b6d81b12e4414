//! Metric families shared by the collector and the worker. Metric updates
//! must never break the runtime, so registration failures panic at startup
//! (they are programming errors) while updates are plain infallible calls.

use std::sync::Arc;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct PipeMetrics {
    pub registry: Registry,

    // collector
    pub collector_messages_seen_total: IntCounterVec,
    pub collector_messages_upserted_total: IntCounterVec,
    pub collector_errors_total: IntCounterVec,
    pub collector_last_message_timestamp_seconds: IntGaugeVec,

    // queue
    pub queue_jobs: IntGaugeVec,
    pub queue_oldest_age_seconds: IntGaugeVec,

    // worker
    pub worker_jobs_processed_total: IntCounterVec,
    pub worker_job_latency_seconds: HistogramVec,
    pub worker_job_stage_latency_seconds: HistogramVec,
    pub worker_parse_success_total: IntCounterVec,
    pub worker_parse_failure_total: IntCounterVec,
    pub worker_requeued_stale_jobs_total: IntCounterVec,

    // llm
    pub llm_calls_total: IntCounterVec,
    pub llm_circuit_open: IntGaugeVec,
}

impl PipeMetrics {
    pub fn new(pipeline_version: &str) -> Arc<Self> {
        let registry = Registry::new();
        let labels = |name: &str, help: &str, label_names: &[&str]| -> IntCounterVec {
            let c = IntCounterVec::new(Opts::new(name, help), label_names).expect("valid metric");
            registry.register(Box::new(c.clone())).expect("unique metric");
            c
        };
        let gauge = |name: &str, help: &str, label_names: &[&str]| -> IntGaugeVec {
            let g = IntGaugeVec::new(Opts::new(name, help), label_names).expect("valid metric");
            registry.register(Box::new(g.clone())).expect("unique metric");
            g
        };
        let histogram = |name: &str, help: &str, label_names: &[&str]| -> HistogramVec {
            let h = HistogramVec::new(
                HistogramOpts::new(name, help)
                    .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
                label_names,
            )
            .expect("valid metric");
            registry.register(Box::new(h.clone())).expect("unique metric");
            h
        };

        let m = Self {
            registry: registry.clone(),
            collector_messages_seen_total: labels(
                "collector_messages_seen_total",
                "Messages observed by the collector",
                &["channel"],
            ),
            collector_messages_upserted_total: labels(
                "collector_messages_upserted_total",
                "Raw rows written by the collector",
                &["channel"],
            ),
            collector_errors_total: labels(
                "collector_errors_total",
                "Collector per-message errors (fail-soft)",
                &["channel", "reason"],
            ),
            collector_last_message_timestamp_seconds: gauge(
                "collector_last_message_timestamp_seconds",
                "Timestamp of the newest observed message",
                &["channel"],
            ),
            queue_jobs: gauge(
                "queue_jobs",
                "Extraction queue size by status",
                &["status", "pipeline_version"],
            ),
            queue_oldest_age_seconds: gauge(
                "queue_oldest_age_seconds",
                "Age of the oldest row in a status",
                &["status", "pipeline_version"],
            ),
            worker_jobs_processed_total: labels(
                "worker_jobs_processed_total",
                "Jobs finished by terminal status",
                &["status", "pipeline_version"],
            ),
            worker_job_latency_seconds: histogram(
                "worker_job_latency_seconds",
                "End-to-end job latency",
                &["pipeline_version"],
            ),
            worker_job_stage_latency_seconds: histogram(
                "worker_job_stage_latency_seconds",
                "Per-stage latency (load_raw, llm, validate, persist)",
                &["stage", "pipeline_version"],
            ),
            worker_parse_success_total: labels(
                "worker_parse_success_total",
                "Jobs persisted successfully",
                &["channel", "pipeline_version"],
            ),
            worker_parse_failure_total: labels(
                "worker_parse_failure_total",
                "Job failures and skips by reason",
                &["channel", "reason", "pipeline_version"],
            ),
            worker_requeued_stale_jobs_total: labels(
                "worker_requeued_stale_jobs_total",
                "Stale processing rows returned to pending",
                &["pipeline_version"],
            ),
            llm_calls_total: labels(
                "llm_calls_total",
                "LLM extraction calls by outcome",
                &["outcome", "pipeline_version"],
            ),
            llm_circuit_open: gauge(
                "llm_circuit_open",
                "1 when the LLM circuit breaker is open",
                &["pipeline_version"],
            ),
        };
        // Pin the pipeline-version gauge so scrapes see the label early.
        m.llm_circuit_open.with_label_values(&[pipeline_version]).set(0);
        Arc::new(m)
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_renders() {
        let m = PipeMetrics::new("v-test");
        m.collector_messages_seen_total
            .with_label_values(&["t.me/x"])
            .inc();
        m.queue_jobs.with_label_values(&["pending", "v-test"]).set(5);
        m.worker_job_stage_latency_seconds
            .with_label_values(&["llm", "v-test"])
            .observe(0.2);
        let text = m.render();
        assert!(text.contains("collector_messages_seen_total"));
        assert!(text.contains("queue_jobs"));
        assert!(text.contains("worker_job_stage_latency_seconds"));
    }
}
