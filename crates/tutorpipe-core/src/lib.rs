//! `tutorpipe-core` — shared configuration, errors and domain types for the
//! tuition-assignment ingest pipeline.
//!
//! Everything here is I/O-free except [`heartbeat`], which performs the
//! atomic temp-file-and-rename writes external monitors rely on.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod types;

pub use config::PipeConfig;
pub use error::{CoreError, Result};
