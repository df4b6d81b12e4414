//! `tutorpipe-extract` — pure classifiers and enrichers for assignment posts.
//!
//! Everything in this crate is deterministic and I/O-free so the worker can
//! call it per-job without shared state and the rules can be property-tested
//! directly. The stages, in pipeline order:
//!
//! 1. [`normalize`] — canonical text form consumed by the other extractors.
//! 2. [`non_assignment`] — status-only / redirect / administrative filter.
//! 3. [`compilation`] — multi-post bundle detection and splitting.
//! 4. [`time`] — deterministic time-availability windows.
//! 5. [`postal`] / [`signals`] / [`taxonomy`] — deterministic enrichment.
//! 6. [`hard`] — type-and-invariant validator over the LLM output.
//! 7. [`schema`] — the coarse contract gate before persistence.

pub mod compilation;
pub mod hard;
pub mod non_assignment;
pub mod normalize;
pub mod postal;
pub mod schema;
pub mod signals;
pub mod taxonomy;
pub mod time;

pub use normalize::normalize_text;
