//! Collector binary: backfill / tail / live / enqueue / status.
//!
//! Environment is the canonical configuration surface; CLI flags override.
//! Exit codes: 0 success, 2 configuration error, 1 any other failure.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use tutorpipe_core::PipeConfig;
use tutorpipe_observe::{ObserveState, PipeMetrics};
use tutorpipe_telegram::telegram::TelegramSource;

mod backfill;
mod catchup;
mod context;
mod enqueue;
mod live;
mod status;
mod tail;

use backfill::BackfillParams;
use context::{parse_instant, resolve_channels, CollectorContext};

#[derive(Parser)]
#[command(name = "tutorpipe-collector", about = "Tuition-assignment channel collector")]
struct Cli {
    /// Path to tutorpipe.toml (defaults to TUTORPIPE_CONFIG or ./tutorpipe.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Historical backfill over a time window
    Backfill {
        #[arg(long)]
        channels: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        max_messages: Option<u64>,
        #[arg(long, default_value_t = 200)]
        batch_size: usize,
        /// Reset already-processed extractions back to pending
        #[arg(long)]
        force_enqueue: bool,
    },
    /// Live stream of new/edited/deleted events
    Tail {
        #[arg(long)]
        channels: Option<String>,
    },
    /// Tail plus recovery catchup (recommended for production)
    Live {
        #[arg(long)]
        channels: Option<String>,
    },
    /// Enqueue extractions from existing raw rows (no source reads)
    Enqueue {
        #[arg(long)]
        channels: Option<String>,
        #[arg(long)]
        since: String,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Show a run and its per-channel progress
    Status {
        #[arg(long)]
        run_id: Option<i64>,
        #[arg(long)]
        run_type: Option<String>,
    },
}

fn spawn_observe(ctx: &CollectorContext, metrics: Arc<PipeMetrics>) {
    let state = ObserveState {
        component: "collector",
        pipeline_version: ctx.cfg.pipeline_version.clone(),
        metrics,
        dependency_probe: None,
    };
    let bind = ctx.cfg.observe.bind.clone();
    let port = ctx.cfg.observe.collector_port;
    tokio::spawn(async move {
        if let Err(e) = tutorpipe_observe::serve(&bind, port, state).await {
            error!(error = %e, "observability listener failed");
        }
    });
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

    // Status and enqueue read only the store; everything else needs the source.
    match cli.command {
        Command::Status { run_id, run_type } => {
            let ctx = CollectorContext::new(cfg);
            status::run_status(&ctx, run_id, run_type.as_deref()).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Enqueue {
            channels,
            since,
            until,
            force,
        } => {
            let ctx = CollectorContext::new(cfg);
            let chans = resolve_channels(&ctx.cfg, channels.as_deref());
            let since = parse_instant(&since)
                .ok_or_else(|| anyhow::anyhow!("invalid --since {since:?}"))?;
            let until = match until {
                Some(u) => parse_instant(&u)
                    .ok_or_else(|| anyhow::anyhow!("invalid --until {u:?}"))?,
                None => chrono::Utc::now(),
            };
            enqueue::run_enqueue_from_raw(&ctx, &chans, since, until, force).await?;
            return Ok(ExitCode::SUCCESS);
        }
        command => {
            if let Err(e) = cfg.validate_for_collector() {
                error!(error = %e, "configuration error");
                return Ok(ExitCode::from(2));
            }
            let ctx = CollectorContext::new(cfg);
            spawn_observe(&ctx, Arc::clone(&ctx.metrics));
            let source = TelegramSource::connect(&ctx.cfg.telegram)
                .await
                .map_err(|e| anyhow::anyhow!("source connect: {e}"))?;

            match command {
                Command::Backfill {
                    channels,
                    since,
                    until,
                    max_messages,
                    batch_size,
                    force_enqueue,
                } => {
                    let chans = resolve_channels(&ctx.cfg, channels.as_deref());
                    if chans.is_empty() {
                        anyhow::bail!("no channels provided (set telegram.channels or pass --channels)");
                    }
                    let params = BackfillParams {
                        since: since.as_deref().and_then(parse_instant),
                        until: until.as_deref().and_then(parse_instant),
                        batch_size,
                        max_messages,
                        force_enqueue,
                    };
                    backfill::run_backfill(&source, &ctx, &chans, &params).await?;
                }
                Command::Tail { channels } => {
                    let chans = resolve_channels(&ctx.cfg, channels.as_deref());
                    if chans.is_empty() {
                        anyhow::bail!("no channels provided (set telegram.channels or pass --channels)");
                    }
                    tail::run_tail(&source, &ctx, &chans).await?;
                }
                Command::Live { channels } => {
                    let chans = resolve_channels(&ctx.cfg, channels.as_deref());
                    if chans.is_empty() {
                        anyhow::bail!("no channels provided (set telegram.channels or pass --channels)");
                    }
                    live::run_live(Arc::new(source), Arc::new(ctx), Arc::new(chans)).await?;
                }
                Command::Status { .. } | Command::Enqueue { .. } => unreachable!(),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutorpipe_collector=info,tutorpipe_store=info,tutorpipe_telegram=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "collector failed");
            ExitCode::FAILURE
        }
    }
}
