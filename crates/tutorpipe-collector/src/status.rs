//! `collector status`: inspect a run and its per-channel progress.

use serde_json::json;

use tutorpipe_core::types::RunType;

use crate::context::CollectorContext;

fn parse_run_type(s: &str) -> Option<RunType> {
    match s.trim() {
        "backfill" => Some(RunType::Backfill),
        "tail" => Some(RunType::Tail),
        "recovery_catchup" => Some(RunType::RecoveryCatchup),
        "enqueue" => Some(RunType::Enqueue),
        _ => None,
    }
}

pub async fn run_status(
    ctx: &CollectorContext,
    run_id: Option<i64>,
    run_type: Option<&str>,
) -> anyhow::Result<()> {
    let resolved_id = match run_id {
        Some(id) => Some(id),
        None => {
            let rt = match run_type {
                Some(s) => Some(
                    parse_run_type(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown run type {s:?}"))?,
                ),
                None => None,
            };
            ctx.store.latest_run_id(rt).await
        }
    };

    let Some(id) = resolved_id else {
        println!("{}", json!({"ok": false, "error": "no matching run"}));
        return Ok(());
    };

    let run = ctx.store.get_run(id).await;
    let progress = ctx.store.list_progress(id).await;
    let doc = json!({
        "ok": run.is_some(),
        "run": run,
        "progress": progress,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
