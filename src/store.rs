use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::models::{ExclusionRecord, InsightSet, Period, Snapshot, SourceData};

/// All snapshot columns in SELECT order (must match SnapshotRow field order).
const SNAPSHOT_COLUMNS: &str = "url, period_start, period_end, period_year, period_index, source_data, insights";

#[derive(Debug, FromRow)]
struct SnapshotRow {
    url: String,
    period_start: NaiveDate,
    period_end: NaiveDate,
    period_year: Option<i32>,
    period_index: Option<i64>,
    source_data: String,
    insights: Option<String>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot> {
        let source_data: SourceData = serde_json::from_str(&self.source_data)
            .with_context(|| format!("decoding stored source data for {}", self.url))?;
        let insights: Option<InsightSet> = self
            .insights
            .as_deref()
            .map(serde_json::from_str::<InsightSet>)
            .transpose()
            .with_context(|| format!("decoding stored insights for {}", self.url))?;
        Ok(Snapshot {
            url: self.url,
            period: Period {
                year: self.period_year,
                index: self.period_index.and_then(|i| u32::try_from(i).ok()),
                start: self.period_start,
                end: self.period_end,
            },
            source_data,
            insights,
        })
    }
}

/// Insert or replace the snapshot for `(url, period)` in a single transaction.
pub async fn store_snapshot(
    pool: &SqlitePool,
    url: &str,
    period: &Period,
    source_data: &SourceData,
    insights: Option<&InsightSet>,
) -> Result<()> {
    let source_json = serde_json::to_string(source_data).context("serializing source data")?;
    let insights_json = insights
        .map(serde_json::to_string)
        .transpose()
        .context("serializing insights")?;

    let mut tx = pool.begin().await.context("starting snapshot transaction")?;

    sqlx::query(
        "INSERT INTO snapshots (url, period_start, period_end, period_year, period_index, source_data, insights)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(url, period_start, period_end) DO UPDATE SET
             period_year = excluded.period_year,
             period_index = excluded.period_index,
             source_data = excluded.source_data,
             insights = excluded.insights,
             created_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')",
    )
    .bind(url)
    .bind(period.start)
    .bind(period.end)
    .bind(period.year)
    .bind(period.index.map(i64::from))
    .bind(&source_json)
    .bind(&insights_json)
    .execute(&mut *tx)
    .await
    .context("upserting snapshot")?;

    tx.commit().await.context("committing snapshot")?;

    debug!(url = %url, period = %period.label(), "stored snapshot");
    Ok(())
}

/// Most recent snapshot for `url` whose period ended before `reference_date`.
pub async fn latest_before(pool: &SqlitePool, url: &str, reference_date: NaiveDate) -> Result<Option<Snapshot>> {
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
         WHERE url = ? AND period_end < ?
         ORDER BY period_end DESC LIMIT 1"
    ))
    .bind(url)
    .bind(reference_date)
    .fetch_optional(pool)
    .await
    .context("querying latest snapshot")?;

    row.map(SnapshotRow::into_snapshot).transpose()
}

/// Snapshot stored for exactly this period, if any.
pub async fn exact(pool: &SqlitePool, url: &str, period: &Period) -> Result<Option<Snapshot>> {
    let row = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
         WHERE url = ? AND period_start = ? AND period_end = ?"
    ))
    .bind(url)
    .bind(period.start)
    .bind(period.end)
    .fetch_optional(pool)
    .await
    .context("querying snapshot by period")?;

    row.map(SnapshotRow::into_snapshot).transpose()
}

/// Latest period end over all stored snapshots.
pub async fn last_processing_date(pool: &SqlitePool) -> Result<Option<NaiveDate>> {
    let last: Option<NaiveDate> = sqlx::query_scalar("SELECT MAX(period_end) FROM snapshots")
        .fetch_one(pool)
        .await
        .context("querying last processing date")?;
    Ok(last)
}

/// Record an exclusion. Returns false if the URL was already excluded.
pub async fn add_exclusion(pool: &SqlitePool, url: &str, date: NaiveDate, reason: &str) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO exclusions (url, excluded_on, reason) VALUES (?, ?, ?)
         ON CONFLICT(url) DO NOTHING",
    )
    .bind(url)
    .bind(date)
    .bind(reason)
    .execute(pool)
    .await
    .context("inserting exclusion")?;

    Ok(result.rows_affected() > 0)
}

pub async fn is_excluded(pool: &SqlitePool, url: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM exclusions WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await
        .context("checking exclusion")?;
    Ok(row.is_some())
}

pub async fn list_exclusions(pool: &SqlitePool) -> Result<Vec<ExclusionRecord>> {
    let rows = sqlx::query_as::<_, ExclusionRecord>(
        "SELECT url, excluded_on, reason FROM exclusions ORDER BY excluded_on, url",
    )
    .fetch_all(pool)
    .await
    .context("listing exclusions")?;
    Ok(rows)
}

/// Remove an exclusion by hand. Returns false if the URL was not excluded.
pub async fn remove_exclusion(pool: &SqlitePool, url: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM exclusions WHERE url = ?")
        .bind(url)
        .execute(pool)
        .await
        .context("deleting exclusion")?;
    Ok(result.rows_affected() > 0)
}
