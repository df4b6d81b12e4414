//! Extraction worker binary.
//!
//! Long-running, env-driven: claims jobs in small batches, requeues stale
//! `processing` rows, exports queue and stage metrics. Exit codes: 0 success,
//! 2 configuration error, 1 any other unhandled failure.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use futures_util::FutureExt;
use serde_json::json;
use tracing::{error, info, warn};

use tutorpipe_core::types::JobStatus;
use tutorpipe_core::PipeConfig;
use tutorpipe_observe::{DependencyProbe, ObserveState};
use tutorpipe_store::SupabaseRest;

mod compilation;
mod context;
mod delivery;
mod enrich;
mod geocode;
mod job;
mod reprocess;
mod standard;

use context::WorkerContext;
use job::work_one;

const REQUEUE_INTERVAL: Duration = Duration::from_secs(60);
const METRICS_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "tutorpipe-worker", about = "Tuition-assignment extraction worker")]
struct Cli {
    /// Path to tutorpipe.toml (defaults to TUTORPIPE_CONFIG or ./tutorpipe.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Re-extract and re-persist a recent raw window (no broadcast/DMs)
    ReprocessRecent {
        #[arg(long, default_value_t = 0)]
        days: i64,
        #[arg(long, default_value_t = 0)]
        hours: i64,
    },
}

fn dependency_probe(cfg: &PipeConfig) -> Option<DependencyProbe> {
    let rest = SupabaseRest::new(&cfg.supabase).ok()?;
    let table = cfg.supabase.extractions_table.clone();
    Some(Arc::new(move || {
        let rest = rest.clone();
        let table = table.clone();
        async move {
            match rest.count(&format!("{table}?select=id")).await {
                Ok(n) => (true, json!({"extraction_rows": n})),
                Err(e) => (false, json!({"error": e.to_string()})),
            }
        }
        .boxed()
    }))
}

async fn refresh_queue_metrics(ctx: &WorkerContext) {
    let pv = ctx.pipeline_version();
    let counts = ctx
        .queue
        .counts(
            pv,
            &[JobStatus::Pending, JobStatus::Processing, JobStatus::Ok, JobStatus::Failed],
        )
        .await;
    for (status, n) in counts {
        ctx.metrics
            .queue_jobs
            .with_label_values(&[status, pv])
            .set(n as i64);
    }
    for status in [JobStatus::Pending, JobStatus::Processing] {
        let age = ctx
            .queue
            .oldest_age_seconds(pv, status)
            .await
            .unwrap_or(0.0);
        ctx.metrics
            .queue_oldest_age_seconds
            .with_label_values(&[status.as_str(), pv])
            .set(age as i64);
    }
}

async fn run_worker_loop(ctx: Arc<WorkerContext>) -> anyhow::Result<()> {
    let toggles = ctx.cfg.worker.clone();
    info!(
        pipeline_version = ctx.pipeline_version(),
        batch_size = toggles.claim_batch_size,
        max_attempts = toggles.max_attempts,
        stale_processing_s = toggles.stale_processing_seconds,
        hard_validate_mode = ?toggles.hard_validate_mode,
        use_normalized_text_for_llm = toggles.use_normalized_text_for_llm,
        use_deterministic_time = toggles.use_deterministic_time,
        enable_deterministic_signals = toggles.enable_deterministic_signals,
        enable_postal_code_estimated = toggles.enable_postal_code_estimated,
        broadcast = toggles.enable_broadcast && ctx.delivery.broadcast_enabled(),
        dms = toggles.enable_dms && ctx.delivery.dms_enabled(),
        oneshot = toggles.oneshot,
        max_jobs = toggles.max_jobs,
        "worker started"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finishing current batch");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut processed: u64 = 0;
    let mut last_requeue: Option<Instant> = None;
    let mut last_metrics: Option<Instant> = None;

    'outer: while !shutdown.load(Ordering::SeqCst) {
        let requeue_due = last_requeue.is_none_or(|t| t.elapsed() >= REQUEUE_INTERVAL);
        if toggles.stale_processing_seconds > 0 && requeue_due {
            last_requeue = Some(Instant::now());
            match ctx.queue.requeue_stale(toggles.stale_processing_seconds).await {
                Ok(count) if count > 0 => {
                    ctx.metrics
                        .worker_requeued_stale_jobs_total
                        .with_label_values(&[ctx.pipeline_version()])
                        .inc_by(count as u64);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "stale requeue failed"),
            }
        }

        if last_metrics.is_none_or(|t| t.elapsed() >= METRICS_INTERVAL) {
            last_metrics = Some(Instant::now());
            refresh_queue_metrics(&ctx).await;
        }

        let mut counts = std::collections::BTreeMap::new();
        counts.insert("processed".to_string(), processed);
        ctx.heartbeat.beat("running", Some("loop_tick"), &counts);

        let jobs = match ctx
            .queue
            .claim(ctx.pipeline_version(), toggles.claim_batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "claim failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        if jobs.is_empty() {
            if toggles.oneshot {
                info!(processed, "oneshot queue drained");
                break;
            }
            tokio::time::sleep(Duration::from_secs_f64(toggles.idle_sleep_seconds.max(0.25))).await;
            continue;
        }

        info!(count = jobs.len(), "claimed jobs");
        for claimed in &jobs {
            let t0 = Instant::now();
            // Each job runs on its own task so a panic in one job is
            // recorded as unhandled_exception instead of taking the loop
            // (and its batch mates) down with it.
            let task = {
                let ctx = Arc::clone(&ctx);
                let job = claimed.clone();
                tokio::spawn(async move { work_one(&ctx, &job).await })
            };
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let detail: String = join_err.to_string().chars().take(500).collect();
                    error!(extraction_id = claimed.id, detail = %detail, "job panicked");
                    let err = json!({"error": "unhandled_exception", "detail": detail});
                    if let Err(e) = ctx
                        .queue
                        .mark(claimed.id, JobStatus::Failed, None, Some(&err), None)
                        .await
                    {
                        warn!(error = %e, extraction_id = claimed.id, "mark after panic failed");
                    }
                    job::JobOutcome::Failed
                }
            };
            processed += 1;
            ctx.metrics
                .worker_job_latency_seconds
                .with_label_values(&[ctx.pipeline_version()])
                .observe(t0.elapsed().as_secs_f64());
            ctx.metrics
                .worker_jobs_processed_total
                .with_label_values(&[outcome.as_str(), ctx.pipeline_version()])
                .inc();
            info!(
                extraction_id = claimed.id,
                outcome = outcome.as_str(),
                dt_ms = t0.elapsed().as_millis() as u64,
                "job finished"
            );
            if toggles.max_jobs > 0 && processed >= toggles.max_jobs {
                info!(processed, max_jobs = toggles.max_jobs, "max jobs reached");
                break 'outer;
            }
            if shutdown.load(Ordering::SeqCst) {
                break 'outer;
            }
        }
    }

    let mut counts = std::collections::BTreeMap::new();
    counts.insert("processed".to_string(), processed);
    ctx.heartbeat.beat("stopped", Some("shutdown"), &counts);
    info!(processed, "worker stopped");
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = match PipeConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "configuration error");
            return Ok(ExitCode::from(2));
        }
    };
    cfg.log_resolved();

    let probe = dependency_probe(&cfg);
    let ctx = match WorkerContext::new(cfg) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(error = %e, "configuration error");
            return Ok(ExitCode::from(2));
        }
    };

    let state = ObserveState {
        component: "worker",
        pipeline_version: ctx.pipeline_version().to_string(),
        metrics: Arc::clone(&ctx.metrics),
        dependency_probe: probe,
    };
    let bind = ctx.cfg.observe.bind.clone();
    let port = ctx.cfg.observe.worker_port;
    tokio::spawn(async move {
        if let Err(e) = tutorpipe_observe::serve(&bind, port, state).await {
            error!(error = %e, "observability listener failed");
        }
    });

    match cli.command {
        None => run_worker_loop(ctx).await?,
        Some(Command::ReprocessRecent { days, hours }) => {
            reprocess::run_reprocess_recent(&ctx, days, hours).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tutorpipe_worker=info,tutorpipe_store=info,tutorpipe_llm=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "worker failed");
            ExitCode::FAILURE
        }
    }
}
