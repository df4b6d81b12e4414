//! Recovery catchup: cursor-based replay of missed windows from the last
//! known watermark up to a target instant, throttled by queue backlog.
//!
//! Runs alongside tail after a restart and stops once caught up. The
//! checkpoint survives restarts via atomic JSON writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use tutorpipe_core::types::{RunStatus, RunType};
use tutorpipe_telegram::ChannelSource;

use crate::backfill::{backfill_channel, BackfillParams};
use crate::context::CollectorContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupState {
    pub version: u32,
    pub created_at: String,
    pub pipeline_version: String,
    pub target_iso: String,
    /// channel_link -> cursor (ISO instant)
    pub cursors: BTreeMap<String, String>,
    pub status: String,
    pub last_update_at: String,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

fn atomic_write_json(path: &Path, state: &CatchupState) {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, serde_json::to_vec_pretty(state).unwrap_or_default())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    };
    if let Err(e) = write() {
        warn!(path = %path.display(), error = %e, "catchup checkpoint write failed");
    }
}

fn read_state(path: &Path) -> Option<CatchupState> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Build a fresh checkpoint: cursors from the raw store's latest message per
/// channel, falling back to now − default lookback.
pub async fn build_initial_state(
    ctx: &CollectorContext,
    channels: &[String],
) -> CatchupState {
    let catchup = ctx.cfg.catchup.clamped();
    let now = Utc::now();
    let mut cursors = BTreeMap::new();
    for ch in channels {
        let cursor = match ctx.store.latest_cursor(ch).await {
            Some((date, _)) => date,
            None => now - Duration::hours(catchup.default_lookback_hours.max(1)),
        };
        cursors.insert(ch.clone(), cursor.to_rfc3339());
    }
    let target = now - Duration::minutes(catchup.target_lag_minutes);
    CatchupState {
        version: 1,
        created_at: now.to_rfc3339(),
        pipeline_version: ctx.cfg.pipeline_version.clone(),
        target_iso: target.to_rfc3339(),
        cursors,
        status: "running".to_string(),
        last_update_at: now.to_rfc3339(),
        errors: Vec::new(),
    }
}

/// Reuse an existing checkpoint only while it is mid-flight.
pub fn load_or_init_state(path: &Path, initial: CatchupState) -> CatchupState {
    if let Some(existing) = read_state(path) {
        if existing.status == "running" && !existing.cursors.is_empty() {
            return existing;
        }
    }
    atomic_write_json(path, &initial);
    initial
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Run the catchup loop until every cursor reaches the target.
pub async fn run_catchup_until_target<S: ChannelSource + ?Sized>(
    source: &S,
    ctx: &CollectorContext,
    channels: &[String],
) -> anyhow::Result<()> {
    let catchup = ctx.cfg.catchup.clamped();
    if !catchup.enabled || channels.is_empty() {
        return Ok(());
    }
    if !ctx.store.enabled() {
        warn!("recovery catchup disabled: store unavailable");
        return Ok(());
    }

    let state_path = PathBuf::from(&catchup.state_file);
    let initial = build_initial_state(ctx, channels).await;
    let mut state = load_or_init_state(&state_path, initial);

    let target = parse_iso(&state.target_iso)
        .unwrap_or_else(|| Utc::now() - Duration::minutes(catchup.target_lag_minutes));

    let run_id = ctx
        .store
        .create_run(
            RunType::RecoveryCatchup,
            channels,
            json!({
                "pipeline_version": ctx.cfg.pipeline_version,
                "target_iso": target.to_rfc3339(),
                "chunk_hours": catchup.chunk_hours,
                "overlap_minutes": catchup.overlap_minutes,
                "low_watermark": catchup.queue_low_watermark,
            }),
        )
        .await;

    loop {
        // Backpressure: defer while the extraction queue is behind.
        if let Some(queue) = &ctx.queue {
            let backlog = queue.backlog(&ctx.cfg.pipeline_version).await;
            if backlog > catchup.queue_low_watermark {
                info!(backlog, low_watermark = catchup.queue_low_watermark, "catchup waiting for queue");
                tokio::time::sleep(std::time::Duration::from_secs_f64(catchup.check_interval_seconds)).await;
                continue;
            }
        }

        let mut any_progress = false;
        for ch in channels {
            let cursor = state
                .cursors
                .get(ch)
                .and_then(|s| parse_iso(s))
                .unwrap_or(target - Duration::days(7));
            if cursor >= target {
                continue;
            }

            let until = target.min(cursor + Duration::hours(catchup.chunk_hours));
            let since = cursor - Duration::minutes(catchup.overlap_minutes);
            info!(
                channel = %ch,
                since = %since.to_rfc3339(),
                until = %until.to_rfc3339(),
                run_id,
                "catchup window start"
            );

            let params = BackfillParams {
                since: Some(since),
                until: Some(until),
                batch_size: 200,
                max_messages: None,
                force_enqueue: false,
            };

            // Whole-window retry around transient source failures; the inner
            // backfill already retries individual calls.
            let mut attempt = 1u32;
            loop {
                match backfill_channel(source, ctx, run_id, ch, &params).await {
                    Ok(counters) => {
                        info!(
                            channel = %ch,
                            scanned = counters.scanned,
                            written = counters.written,
                            until = %until.to_rfc3339(),
                            run_id,
                            "catchup window done"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(
                            channel = %ch,
                            attempt,
                            max_attempts = catchup.backfill_max_attempts,
                            error = %e,
                            "catchup window attempt failed"
                        );
                        if attempt >= catchup.backfill_max_attempts.max(1) {
                            state.errors.push(json!({
                                "ts": Utc::now().timestamp(),
                                "channel": ch,
                                "error": e.to_string(),
                            }));
                            state.last_update_at = Utc::now().to_rfc3339();
                            atomic_write_json(&state_path, &state);
                            ctx.store
                                .finish_run(run_id, RunStatus::Error, Some(json!({"error": e.to_string()})))
                                .await;
                            return Err(anyhow::anyhow!(e));
                        }
                        let wait = (catchup.backfill_base_backoff_seconds
                            * 2f64.powi(attempt as i32 - 1))
                        .min(300.0);
                        tokio::time::sleep(std::time::Duration::from_secs_f64(wait + 0.1 * attempt as f64))
                            .await;
                        attempt += 1;
                    }
                }
            }

            state.cursors.insert(ch.clone(), until.to_rfc3339());
            state.last_update_at = Utc::now().to_rfc3339();
            atomic_write_json(&state_path, &state);
            any_progress = true;
        }

        if !any_progress {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs_f64(catchup.check_interval_seconds)).await;
    }

    state.status = "ok".to_string();
    state.last_update_at = Utc::now().to_rfc3339();
    atomic_write_json(&state_path, &state);
    ctx.store
        .finish_run(run_id, RunStatus::Ok, Some(json!({"finished_at": Utc::now().to_rfc3339()})))
        .await;
    info!(target = %target.to_rfc3339(), "recovery catchup done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(status: &str) -> CatchupState {
        let now = Utc::now();
        let mut cursors = BTreeMap::new();
        cursors.insert("t.me/a".to_string(), now.to_rfc3339());
        CatchupState {
            version: 1,
            created_at: now.to_rfc3339(),
            pipeline_version: "v".to_string(),
            target_iso: now.to_rfc3339(),
            cursors,
            status: status.to_string(),
            last_update_at: now.to_rfc3339(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn checkpoint_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("catchup.json");
        let state = state_with("running");
        atomic_write_json(&path, &state);
        let loaded = read_state(&path).expect("state readable");
        assert_eq!(loaded.cursors, state.cursors);
        assert_eq!(loaded.status, "running");
    }

    #[test]
    fn running_checkpoint_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catchup.json");
        let existing = state_with("running");
        atomic_write_json(&path, &existing);

        let fresh = state_with("running");
        let loaded = load_or_init_state(&path, fresh);
        assert_eq!(loaded.created_at, existing.created_at);
    }

    #[test]
    fn finished_checkpoint_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catchup.json");
        atomic_write_json(&path, &state_with("ok"));

        let fresh = state_with("running");
        let loaded = load_or_init_state(&path, fresh.clone());
        assert_eq!(loaded.created_at, fresh.created_at);
        // and the replacement is persisted
        assert_eq!(read_state(&path).unwrap().status, "running");
    }
}
