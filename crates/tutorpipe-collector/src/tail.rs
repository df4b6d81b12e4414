//! Live tail: subscribe to new/edit/delete events and keep the raw store
//! and the extraction queue current.
//!
//! Every handler is fail-soft: a bad event increments a counter and logs at
//! warning; the subscription itself is only abandoned on fatal auth errors
//! or interrupt.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use tutorpipe_core::types::{ChannelInfo, RunStatus, RunType};
use tutorpipe_telegram::backoff::retry_with_backoff;
use tutorpipe_telegram::{ChannelSource, SourceChannel, SourceEvent, SourceMessage};

use crate::backfill::Counters;
use crate::context::CollectorContext;

const IDLE_BEAT_SECONDS: u64 = 30;

pub struct TailState {
    /// Watched channels by numeric id; events from other chats are ignored.
    pub watched: HashMap<i64, SourceChannel>,
    pub counters: HashMap<String, Counters>,
}

impl TailState {
    fn counter(&mut self, channel_link: &str) -> &mut Counters {
        self.counters.entry(channel_link.to_string()).or_default()
    }

    fn heartbeat_counts(&self) -> std::collections::BTreeMap<String, u64> {
        let mut out = std::collections::BTreeMap::new();
        let (mut scanned, mut written, mut errors) = (0u64, 0u64, 0u64);
        for c in self.counters.values() {
            scanned += c.scanned;
            written += c.written;
            errors += c.errors;
        }
        out.insert("scanned".to_string(), scanned);
        out.insert("written".to_string(), written);
        out.insert("errors".to_string(), errors);
        out
    }
}

/// Resolve and register the watched channel set.
pub async fn prepare_channels<S: ChannelSource + ?Sized>(
    source: &S,
    ctx: &CollectorContext,
    channels: &[String],
) -> anyhow::Result<TailState> {
    let mut watched = HashMap::new();
    for ch in channels {
        let resolved = retry_with_backoff(&ctx.cfg.telegram, move || source.resolve(ch))
            .await
            .map_err(|e| anyhow::anyhow!("resolving {ch}: {e}"))?;
        ctx.store
            .upsert_channel(&ChannelInfo {
                channel_link: resolved.channel_link.clone(),
                channel_id: Some(resolved.id.to_string()),
                title: resolved.title.clone(),
            })
            .await;
        watched.insert(resolved.id, resolved);
    }
    Ok(TailState {
        watched,
        counters: HashMap::new(),
    })
}

async fn handle_message(
    ctx: &CollectorContext,
    state: &mut TailState,
    run_id: Option<i64>,
    channel: &SourceChannel,
    message: &SourceMessage,
    force_enqueue: bool,
    event_name: &str,
) {
    let Some(watched) = state.watched.get(&channel.id).cloned() else {
        debug!(channel_id = channel.id, "event from unwatched chat ignored");
        return;
    };
    let link = watched.channel_link.clone();
    let counter = state.counter(&link);
    counter.scanned += 1;

    ctx.metrics
        .collector_messages_seen_total
        .with_label_values(&[link.as_str()])
        .inc();
    ctx.metrics
        .collector_last_message_timestamp_seconds
        .with_label_values(&[link.as_str()])
        .set(message.date.timestamp());

    let row = message.to_raw_row(&watched);
    let (_, written) = ctx.store.upsert_messages_batch(&[row]).await;
    if written > 0 {
        counter.written += written as u64;
        ctx.metrics
            .collector_messages_upserted_total
            .with_label_values(&[link.as_str()])
            .inc_by(written as u64);
        ctx.enqueue_jobs(&link, &[message.id.to_string()], force_enqueue)
            .await;
        counter.last_message_id = Some(message.id.to_string());
        counter.last_message_date = Some(message.date);
    } else {
        counter.errors += 1;
        ctx.metrics
            .collector_errors_total
            .with_label_values(&[link.as_str(), "raw_write_failed"])
            .inc();
    }

    let snapshot = state.counter(&link).clone();
    ctx.store
        .upsert_progress(
            run_id,
            &link,
            snapshot.last_message_id.as_deref(),
            snapshot.last_message_date.map(|d| d.to_rfc3339()).as_deref(),
            snapshot.scanned as i64,
            0,
            0,
            snapshot.errors as i64,
        )
        .await;
    ctx.beat("running", event_name, &state.heartbeat_counts());
}

async fn handle_delete(
    ctx: &CollectorContext,
    state: &mut TailState,
    channel_id: Option<i64>,
    message_ids: &[i64],
) {
    let Some(channel_id) = channel_id else {
        debug!("delete event without channel id ignored");
        return;
    };
    let Some(watched) = state.watched.get(&channel_id).cloned() else {
        return;
    };
    let ids: Vec<String> = message_ids.iter().map(i64::to_string).collect();
    let patched = ctx.store.mark_deleted(&watched.channel_link, &ids).await;
    debug!(
        channel = %watched.channel_link,
        ids = ids.len(),
        patched,
        "delete tombstones applied"
    );
    ctx.beat("running", "tail_delete", &state.heartbeat_counts());
}

/// Drive the event loop until interrupted. Returns cleanly on ctrl-c after
/// flushing a final heartbeat and finishing the run row.
pub async fn run_tail<S: ChannelSource + ?Sized>(
    source: &S,
    ctx: &CollectorContext,
    channels: &[String],
) -> anyhow::Result<()> {
    let mut state = prepare_channels(source, ctx, channels).await?;
    let run_id = ctx
        .store
        .create_run(
            RunType::Tail,
            channels,
            json!({"supabase_enabled": ctx.store.enabled()}),
        )
        .await;
    info!(
        run_id,
        channels = channels.len(),
        supabase_enabled = ctx.store.enabled(),
        "tail started"
    );

    let mut idle = tokio::time::interval(Duration::from_secs(IDLE_BEAT_SECONDS));
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("tail interrupted, shutting down");
                break;
            }
            _ = idle.tick() => {
                ctx.beat("idle", "tick", &state.heartbeat_counts());
            }
            event = source.next_event() => {
                match event {
                    Ok(SourceEvent::New { channel, message }) => {
                        handle_message(ctx, &mut state, run_id, &channel, &message, false, "tail_new").await;
                    }
                    Ok(SourceEvent::Edited { channel, message }) => {
                        // Edits can change extraction output; force reprocessing.
                        handle_message(ctx, &mut state, run_id, &channel, &message, true, "tail_edit").await;
                    }
                    Ok(SourceEvent::Deleted { channel_id, message_ids }) => {
                        handle_delete(ctx, &mut state, channel_id, &message_ids).await;
                    }
                    Ok(SourceEvent::Ignored) => {}
                    Err(e) if e.is_fatal() => {
                        ctx.beat("error", "tail_fatal", &state.heartbeat_counts());
                        ctx.store.finish_run(run_id, RunStatus::Error, Some(json!({"error": e.to_string()}))).await;
                        return Err(anyhow::anyhow!(e));
                    }
                    Err(e) => {
                        warn!(error = %e, "tail event error, continuing");
                        ctx.metrics
                            .collector_errors_total
                            .with_label_values(&["-", "tail_event_failed"])
                            .inc();
                        if let Some(wait) = e.server_wait_seconds() {
                            tokio::time::sleep(Duration::from_secs(wait.min(300))).await;
                        } else {
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    }
                }
            }
        }
    }

    ctx.beat("stopped", "shutdown", &state.heartbeat_counts());
    ctx.store
        .finish_run(run_id, RunStatus::Cancelled, Some(json!({"stopped_at": chrono::Utc::now().to_rfc3339()})))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tutorpipe_core::PipeConfig;
    use tutorpipe_telegram::SourceError;

    struct EventSource {
        channel: SourceChannel,
        events: Mutex<Vec<SourceEvent>>,
    }

    #[async_trait]
    impl ChannelSource for EventSource {
        async fn resolve(&self, _ref: &str) -> Result<SourceChannel, SourceError> {
            Ok(self.channel.clone())
        }
        async fn history_page(
            &self,
            _c: &SourceChannel,
            _b: Option<i64>,
            _l: usize,
        ) -> Result<Vec<SourceMessage>, SourceError> {
            Ok(Vec::new())
        }
        async fn next_event(&self) -> Result<SourceEvent, SourceError> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(SourceEvent::Ignored))
        }
    }

    fn channel() -> SourceChannel {
        SourceChannel {
            channel_link: "t.me/mock".to_string(),
            id: 9,
            title: None,
            username: Some("mock".to_string()),
        }
    }

    fn msg(id: i64) -> SourceMessage {
        SourceMessage {
            id,
            date: Utc::now(),
            edit_date: None,
            text: "post".to_string(),
            sender_id: None,
            is_forward: false,
            reply_to_msg_id: None,
            views: None,
            forwards: None,
            reply_count: None,
        }
    }

    #[tokio::test]
    async fn events_from_unwatched_channels_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = PipeConfig::default();
        cfg.heartbeat.collector_file = dir.path().join("hb.json").display().to_string();
        let ctx = CollectorContext::new(cfg);
        let source = EventSource {
            channel: channel(),
            events: Mutex::new(Vec::new()),
        };
        let mut state = prepare_channels(&source, &ctx, &["t.me/mock".to_string()])
            .await
            .unwrap();

        let other = SourceChannel {
            id: 1234,
            ..channel()
        };
        handle_message(&ctx, &mut state, None, &other, &msg(1), false, "tail_new").await;
        assert!(state.counters.is_empty());

        handle_message(&ctx, &mut state, None, &channel(), &msg(2), false, "tail_new").await;
        let c = state.counters.get("t.me/mock").unwrap();
        assert_eq!(c.scanned, 1);
        // store disabled, so the write failed soft and was counted
        assert_eq!(c.errors, 1);
    }
}
