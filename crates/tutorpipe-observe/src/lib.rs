//! `tutorpipe-observe` — Prometheus metric families and the per-process
//! health/metrics HTTP listener (collector :9001, worker :9002 by default).

pub mod http;
pub mod metrics;

pub use http::{serve, DependencyProbe, ObserveState};
pub use metrics::PipeMetrics;
