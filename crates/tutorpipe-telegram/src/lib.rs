//! `tutorpipe-telegram` — the source-channel seam.
//!
//! The collector and recovery loop are written against [`ChannelSource`];
//! the production implementation is [`telegram::TelegramSource`], an
//! authenticated MTProto user client. Tests drive the pipeline with scripted
//! sources instead.

pub mod backoff;
pub mod telegram;
pub mod types;

use async_trait::async_trait;

pub use types::{SourceChannel, SourceError, SourceEvent, SourceMessage};

/// A source of channel messages: resolve refs, page history, stream events.
///
/// Implementations must be `Send + Sync`; the collector shares one source
/// between the tail task and the recovery-catchup loop (the underlying
/// session is single, which is why both run on one task set).
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Resolve a channel ref (`t.me/<name>` or bare username) to metadata.
    async fn resolve(&self, channel_ref: &str) -> Result<SourceChannel, SourceError>;

    /// One page of history, newest first, strictly older than `before_id`
    /// when given. An empty page means the channel is exhausted.
    async fn history_page(
        &self,
        channel: &SourceChannel,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError>;

    /// Next live event (new/edited/deleted) across all resolved channels.
    async fn next_event(&self) -> Result<SourceEvent, SourceError>;
}
