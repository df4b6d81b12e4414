//! `tutorpipe-llm` — the single-call extraction client and its guards.
//!
//! One OpenAI-compatible chat-completions call per message, temperature 0,
//! wrapped by a [`breaker::CircuitBreaker`] so a dead endpoint fails fast
//! instead of burning the queue.

pub mod breaker;
pub mod client;
pub mod error;
pub mod prompt;

pub use breaker::{BreakerStats, CircuitBreaker};
pub use client::LlmExtractor;
pub use error::LlmError;
