use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::aggregate;
use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::models::{AggregatedReport, InsightSet, Period, Snapshot, Topic, UrlInsights};
use crate::oracle::Oracle;
use crate::{exclusion, insights, store};

/// Everything a batch needs, shared across URL tasks.
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub connectors: Arc<ConnectorRegistry>,
    pub oracle: Arc<dyn Oracle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Excluded,
    Cancelled,
}

#[derive(Debug)]
pub enum UrlOutcome {
    Stored(InsightSet),
    Skipped(SkipReason),
    Failed(String),
}

/// Result of one scheduled batch.
#[derive(Debug)]
pub struct BatchResult {
    pub current: Period,
    pub prior: Period,
    /// One entry per distinct input URL, in input order.
    pub outcomes: Vec<(String, UrlOutcome)>,
    pub newly_excluded: Vec<String>,
    pub report: AggregatedReport,
}

impl BatchResult {
    pub fn stored(&self) -> usize {
        self.count(|o| matches!(o, UrlOutcome::Stored(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UrlOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UrlOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&UrlOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

impl PipelineContext {
    fn topics(&self) -> Vec<Topic> {
        self.config.topics()
    }
}

/// Process every URL for the period ending before `today`, then run the
/// low-traffic exclusion pass and aggregate the stored results.
///
/// Per-URL failures never abort the batch; only setup errors are returned.
pub async fn run_batch(
    ctx: &PipelineContext,
    urls: &[String],
    today: NaiveDate,
    cancel: CancellationToken,
) -> Result<BatchResult> {
    let run_id = Uuid::new_v4();
    let periods = ctx.config.periods();
    let current = periods.current(today);
    let prior = periods.prior(today);
    let urls = dedup(urls);
    let url_timeout = ctx.config.url_timeout()?;
    let topics = Arc::new(ctx.topics());

    info!(
        run_id = %run_id,
        urls = urls.len(),
        current = %current.label(),
        prior = %prior.label(),
        workers = ctx.config.schedule.max_concurrent_urls,
        "batch starting"
    );

    let semaphore = Arc::new(Semaphore::new(ctx.config.schedule.max_concurrent_urls.max(1) as usize));
    let mut handles = Vec::with_capacity(urls.len());

    for url in &urls {
        let ctx = ctx.clone();
        let url = url.clone();
        let current = current.clone();
        let prior = prior.clone();
        let topics = topics.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();

        handles.push(tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return UrlOutcome::Skipped(SkipReason::Cancelled),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return UrlOutcome::Skipped(SkipReason::Cancelled),
                },
            };
            if cancel.is_cancelled() {
                return UrlOutcome::Skipped(SkipReason::Cancelled);
            }

            match tokio::time::timeout(url_timeout, process_url(&ctx, &url, &current, &prior, &topics)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!(run_id = %run_id, url = %url, error = format!("{e:#}"), "URL failed");
                    UrlOutcome::Failed(format!("{e:#}"))
                }
                Err(_) => {
                    warn!(run_id = %run_id, url = %url, timeout = ?url_timeout, "URL timed out");
                    UrlOutcome::Failed(format!("timed out after {}", humantime::format_duration(url_timeout)))
                }
            }
        }));
    }

    // Handles are awaited in spawn order, so outcomes keep input order.
    let mut outcomes = Vec::with_capacity(urls.len());
    for (url, handle) in urls.iter().zip(handles) {
        let outcome = handle.await.unwrap_or_else(|e| {
            error!(run_id = %run_id, url = %url, error = %e, "URL task panicked");
            UrlOutcome::Failed(format!("task failed: {e}"))
        });
        outcomes.push((url.clone(), outcome));
    }

    let newly_excluded = match exclusion::apply_low_traffic_exclusion(&ctx.pool, &urls, &ctx.config.exclusion, today)
        .await
    {
        Ok(excluded) => excluded,
        Err(e) => {
            error!(run_id = %run_id, error = format!("{e:#}"), "low-traffic exclusion pass failed");
            Vec::new()
        }
    };

    let per_url: Vec<UrlInsights> = outcomes
        .iter()
        .filter_map(|(url, outcome)| match outcome {
            UrlOutcome::Stored(insights) => Some(UrlInsights {
                url: url.clone(),
                insights: insights.clone(),
            }),
            _ => None,
        })
        .collect();

    let report = aggregate(
        &per_url,
        &topics,
        ctx.config.report.significance_threshold,
        ctx.config.report.max_insights,
    );

    let result = BatchResult {
        current,
        prior,
        outcomes,
        newly_excluded,
        report,
    };
    info!(
        run_id = %run_id,
        stored = result.stored(),
        skipped = result.skipped(),
        failed = result.failed(),
        excluded = result.newly_excluded.len(),
        insights = result.report.insight_count(),
        "batch complete"
    );
    Ok(result)
}

async fn process_url(
    ctx: &PipelineContext,
    url: &str,
    current: &Period,
    prior: &Period,
    topics: &[Topic],
) -> Result<UrlOutcome> {
    if exclusion::is_excluded(&ctx.pool, url).await? {
        debug!(url = %url, "URL is excluded, skipping");
        return Ok(UrlOutcome::Skipped(SkipReason::Excluded));
    }

    let current_snapshot = fetch_snapshot(ctx, url, current).await.context("fetching current period")?;
    let prior_snapshot = prior_snapshot(ctx, url, prior).await.context("loading prior period")?;

    let insights = insights::generate(ctx.oracle.as_ref(), &current_snapshot, &prior_snapshot, topics)
        .await
        .context("generating insights")?;

    store::store_snapshot(&ctx.pool, url, current, &current_snapshot.source_data, Some(&insights))
        .await
        .context("storing current snapshot")?;

    Ok(UrlOutcome::Stored(insights))
}

async fn fetch_snapshot(ctx: &PipelineContext, url: &str, period: &Period) -> Result<Snapshot> {
    let source_data = ctx.connectors.extract_all(url, period).await?;
    Ok(Snapshot {
        url: url.to_string(),
        period: period.clone(),
        source_data,
        insights: None,
    })
}

/// Stored snapshot for exactly the prior period, or a live fetch that is stored
/// with an empty insight set so later runs can reuse it.
async fn prior_snapshot(ctx: &PipelineContext, url: &str, prior: &Period) -> Result<Snapshot> {
    if let Some(stored) = store::exact(&ctx.pool, url, prior).await? {
        debug!(url = %url, period = %prior.label(), "using stored prior snapshot");
        return Ok(stored);
    }

    debug!(url = %url, period = %prior.label(), "no stored prior snapshot, fetching live");
    let mut snapshot = fetch_snapshot(ctx, url, prior).await?;
    let empty = InsightSet::new();
    store::store_snapshot(&ctx.pool, url, prior, &snapshot.source_data, Some(&empty))
        .await
        .context("storing prior snapshot")?;
    snapshot.insights = Some(empty);
    Ok(snapshot)
}

/// Live comparison for one URL. Nothing is read from or written to the store.
pub async fn test_url(ctx: &PipelineContext, url: &str, today: NaiveDate) -> Result<InsightSet> {
    let periods = ctx.config.periods();
    let current = fetch_snapshot(ctx, url, &periods.current(today))
        .await
        .context("fetching current period")?;
    let prior = fetch_snapshot(ctx, url, &periods.prior(today))
        .await
        .context("fetching prior period")?;

    let insights = insights::generate(ctx.oracle.as_ref(), &current, &prior, &ctx.topics())
        .await
        .context("generating insights")?;
    Ok(insights)
}

/// `test_url` over several URLs, aggregated. Failing URLs are logged and left out.
pub async fn test_urls(ctx: &PipelineContext, urls: &[String], today: NaiveDate) -> AggregatedReport {
    let mut per_url = Vec::new();
    for url in dedup(urls) {
        match test_url(ctx, &url, today).await {
            Ok(insights) => per_url.push(UrlInsights { url, insights }),
            Err(e) => warn!(url = %url, error = format!("{e:#}"), "test URL failed, skipping"),
        }
    }

    aggregate(
        &per_url,
        &ctx.topics(),
        ctx.config.report.significance_threshold,
        ctx.config.report.max_insights,
    )
}

fn dedup(urls: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.iter().filter(|u| seen.insert(u.as_str())).cloned().collect()
}
