use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::PipelineContext;
use crate::scheduler::{self, Delivery};

/// Long-running mode: check the schedule every `schedule.check_interval` until
/// SIGINT/SIGTERM. A batch in flight is asked to stop; URLs not yet started are skipped.
pub async fn run(ctx: PipelineContext, delivery: Delivery) -> Result<()> {
    let interval = ctx.config.check_interval()?;
    let pool = ctx.pool.clone();
    let cancel = CancellationToken::new();

    let scheduler_handle = tokio::spawn(scheduler::scheduler_loop(ctx, delivery, interval, cancel.clone()));

    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    // URLs already running get this long to finish.
    let shutdown_timeout = std::time::Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, scheduler_handle).await.is_err() {
        warn!(timeout_secs = shutdown_timeout.as_secs(), "scheduler did not stop in time");
    }

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, waiting for Ctrl-C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
