//! `tutorpipe-store` — persistence against the Supabase-style REST API.
//!
//! Three stores share one [`rest::SupabaseRest`] client:
//!
//! - [`raw::RawStore`] owns raw rows, tombstones, runs and progress, with an
//!   append-only JSONL fallback for outages;
//! - [`queue::ExtractionQueue`] brokers jobs between collection and
//!   extraction via server-side RPCs (claim uses SKIP LOCKED);
//! - [`assignments::AssignmentStore`] owns the canonical assignment rows and
//!   the bump/merge semantics for reposts.

pub mod assignments;
pub mod error;
pub mod fallback;
pub mod queue;
pub mod raw;
pub mod rest;

pub use assignments::AssignmentStore;
pub use error::{Result, StoreError};
pub use queue::ExtractionQueue;
pub use raw::RawStore;
pub use rest::SupabaseRest;
