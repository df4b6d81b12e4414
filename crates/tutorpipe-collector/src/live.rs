//! `collector live`: tail plus the recovery-catchup loop, sharing one
//! authenticated source session on one task set.

use std::sync::Arc;

use tracing::{info, warn};

use tutorpipe_telegram::ChannelSource;

use crate::catchup::run_catchup_until_target;
use crate::context::CollectorContext;
use crate::tail::run_tail;

pub async fn run_live<S: ChannelSource + ?Sized>(
    source: Arc<S>,
    ctx: Arc<CollectorContext>,
    channels: Arc<Vec<String>>,
) -> anyhow::Result<()> {
    info!(channels = channels.len(), "live supervisor starting (tail + catchup)");

    let tail = {
        let source = Arc::clone(&source);
        let ctx = Arc::clone(&ctx);
        let channels = Arc::clone(&channels);
        async move { run_tail(source.as_ref(), ctx.as_ref(), &channels).await }
    };
    let catchup = {
        let source = Arc::clone(&source);
        let ctx = Arc::clone(&ctx);
        let channels = Arc::clone(&channels);
        async move {
            // The catchup loop ending (caught up or failed) must not stop tail.
            if let Err(e) = run_catchup_until_target(source.as_ref(), ctx.as_ref(), &channels).await
            {
                warn!(error = %e, "recovery catchup failed; tail keeps running");
            }
        }
    };

    let (tail_result, ()) = tokio::join!(tail, catchup);
    tail_result
}
