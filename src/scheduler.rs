use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::mailer::Mailer;
use crate::models::{AggregatedReport, Period};
use crate::period::today_in;
use crate::pipeline::{self, BatchResult, PipelineContext};
use crate::report::{self, ReportHeader};
use crate::{sitemap, store};

/// Where a finished report goes.
#[derive(Default)]
pub struct Delivery {
    pub mailer: Option<Arc<Mailer>>,
    pub output: Option<PathBuf>,
}

/// Run one batch if the schedule says a new period is due (or `force` is set),
/// then deliver the report. Returns `None` when nothing was due.
pub async fn run_once(
    ctx: &PipelineContext,
    delivery: &Delivery,
    force: bool,
    cancel: CancellationToken,
) -> Result<Option<BatchResult>> {
    let today = today_in(ctx.config.timezone()?, Utc::now());
    let periods = ctx.config.periods();
    let last = store::last_processing_date(&ctx.pool)
        .await
        .context("reading last processing date")?;

    if !force && !periods.is_due(today, last) {
        debug!(today = %today, last_processed = ?last, "no new period due");
        return Ok(None);
    }

    let urls = sitemap::resolve_urls(&ctx.config.urls).await.context("resolving URLs")?;
    let result = pipeline::run_batch(ctx, &urls, today, cancel.clone()).await?;

    if cancel.is_cancelled() {
        warn!("batch interrupted by shutdown, report not delivered");
        return Ok(Some(result));
    }

    deliver(ctx, delivery, &result.report, &result.current).await?;
    Ok(Some(result))
}

/// Write the report to the output file (if any) and email it (if a mailer is set).
/// Mail failures are logged; file write failures are returned.
pub async fn deliver(
    ctx: &PipelineContext,
    delivery: &Delivery,
    report: &AggregatedReport,
    period: &Period,
) -> Result<()> {
    let header = ReportHeader {
        title: &ctx.config.report.subject,
        period,
    };

    if let Some(path) = &delivery.output {
        report::write_report(path, &header, report).await?;
        info!(path = %path.display(), "report written");
    }

    match &delivery.mailer {
        Some(mailer) => {
            let subject = format!("{} ({})", ctx.config.report.subject, period.label());
            let html = report::render_html(&header, report);
            // Already logged by the mailer.
            let _ = mailer.send(&subject, &html).await;
        }
        None => warn!("no [email] section configured, report not emailed"),
    }
    Ok(())
}

/// Check the schedule immediately, then every `interval`, until cancelled.
pub async fn scheduler_loop(ctx: PipelineContext, delivery: Delivery, interval: Duration, cancel: CancellationToken) {
    info!(interval = %humantime::format_duration(interval), "scheduler started");

    loop {
        match run_once(&ctx, &delivery, false, cancel.clone()).await {
            Ok(Some(result)) => info!(
                period = %result.current.label(),
                stored = result.stored(),
                failed = result.failed(),
                "scheduled batch finished"
            ),
            Ok(None) => {}
            Err(e) => error!(error = format!("{e:#}"), "scheduled batch failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
