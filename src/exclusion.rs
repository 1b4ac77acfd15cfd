use anyhow::Result;
use chrono::{Duration, NaiveDate};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::ExclusionConfig;
use crate::models::Snapshot;
use crate::store;

pub const LOW_TRAFFIC_REASON: &str = "Low traffic";

pub async fn is_excluded(pool: &SqlitePool, url: &str) -> Result<bool> {
    store::is_excluded(pool, url).await
}

/// Exclude URLs whose latest stored snapshot reports traffic below the threshold.
///
/// Only stored evidence counts: a URL without a snapshot, or whose snapshot lacks the
/// traffic field, is left alone. Returns the URLs newly excluded by this pass.
pub async fn apply_low_traffic_exclusion(
    pool: &SqlitePool,
    urls: &[String],
    rules: &ExclusionConfig,
    today: NaiveDate,
) -> Result<Vec<String>> {
    let mut excluded = Vec::new();

    for url in urls {
        let Some(latest) = store::latest_before(pool, url, today + Duration::days(1)).await? else {
            debug!(url = %url, "no stored snapshot, skipping traffic check");
            continue;
        };

        let Some(traffic) = traffic_value(&latest, &rules.traffic_source, &rules.traffic_field) else {
            debug!(
                url = %url,
                source = %rules.traffic_source,
                field = %rules.traffic_field,
                "traffic field missing from latest snapshot"
            );
            continue;
        };

        if traffic < rules.low_traffic_threshold
            && store::add_exclusion(pool, url, today, LOW_TRAFFIC_REASON).await?
        {
            info!(url = %url, traffic, threshold = rules.low_traffic_threshold, "excluding URL due to low traffic");
            excluded.push(url.clone());
        }
    }

    Ok(excluded)
}

/// Numeric traffic value from one source of a snapshot. Numeric strings are accepted
/// since some analytics APIs report metrics as strings.
fn traffic_value(snapshot: &Snapshot, source: &str, field: &str) -> Option<f64> {
    let value = snapshot.source_data.get(source)?.get(field)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{Period, SourceData};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn june() -> Period {
        Period {
            year: Some(2024),
            index: Some(6),
            start: date("2024-06-01"),
            end: date("2024-06-30"),
        }
    }

    fn ga4(field: &str, value: serde_json::Value) -> SourceData {
        let mut fields = serde_json::Map::new();
        fields.insert(field.to_string(), value);
        SourceData::from([("ga4".to_string(), fields)])
    }

    fn rules(threshold: f64) -> ExclusionConfig {
        ExclusionConfig {
            low_traffic_threshold: threshold,
            traffic_source: "ga4".to_string(),
            traffic_field: "sessions".to_string(),
        }
    }

    #[tokio::test]
    async fn low_traffic_url_is_excluded() {
        let pool = db::create_memory_pool().await.unwrap();
        let url = "https://low.example/".to_string();
        store::store_snapshot(&pool, &url, &june(), &ga4("sessions", serde_json::json!(50)), None)
            .await
            .unwrap();

        let excluded = apply_low_traffic_exclusion(&pool, &[url.clone()], &rules(100.0), date("2024-07-15"))
            .await
            .unwrap();

        assert_eq!(excluded, vec![url.clone()]);
        assert!(is_excluded(&pool, &url).await.unwrap());
        let records = store::list_exclusions(&pool).await.unwrap();
        assert_eq!(records[0].reason, LOW_TRAFFIC_REASON);
        assert_eq!(records[0].excluded_on, date("2024-07-15"));
    }

    #[tokio::test]
    async fn page_with_zero_sessions_is_excluded() {
        let pool = db::create_memory_pool().await.unwrap();
        let url = "https://dead.example/".to_string();
        store::store_snapshot(&pool, &url, &june(), &ga4("sessions", serde_json::json!(0)), None)
            .await
            .unwrap();

        let excluded = apply_low_traffic_exclusion(&pool, &[url.clone()], &rules(100.0), date("2024-07-15"))
            .await
            .unwrap();

        assert_eq!(excluded, vec![url]);
    }

    #[tokio::test]
    async fn url_without_snapshot_is_never_excluded() {
        let pool = db::create_memory_pool().await.unwrap();
        let url = "https://new.example/".to_string();

        let excluded = apply_low_traffic_exclusion(&pool, &[url.clone()], &rules(100.0), date("2024-07-15"))
            .await
            .unwrap();

        assert!(excluded.is_empty());
        assert!(!is_excluded(&pool, &url).await.unwrap());
    }

    #[tokio::test]
    async fn traffic_at_threshold_is_kept() {
        let pool = db::create_memory_pool().await.unwrap();
        let url = "https://busy.example/".to_string();
        store::store_snapshot(&pool, &url, &june(), &ga4("sessions", serde_json::json!("100")), None)
            .await
            .unwrap();

        let excluded = apply_low_traffic_exclusion(&pool, &[url.clone()], &rules(100.0), date("2024-07-15"))
            .await
            .unwrap();

        assert!(excluded.is_empty());
    }

    #[tokio::test]
    async fn missing_traffic_field_is_not_evidence() {
        let pool = db::create_memory_pool().await.unwrap();
        let url = "https://partial.example/".to_string();
        store::store_snapshot(&pool, &url, &june(), &ga4("bounce_rate", serde_json::json!(0.4)), None)
            .await
            .unwrap();

        let excluded = apply_low_traffic_exclusion(&pool, &[url.clone()], &rules(100.0), date("2024-07-15"))
            .await
            .unwrap();

        assert!(excluded.is_empty());
    }

    #[tokio::test]
    async fn already_excluded_url_is_not_reported_twice() {
        let pool = db::create_memory_pool().await.unwrap();
        let url = "https://low.example/".to_string();
        store::store_snapshot(&pool, &url, &june(), &ga4("sessions", serde_json::json!(5)), None)
            .await
            .unwrap();

        let urls = [url.clone()];
        let first = apply_low_traffic_exclusion(&pool, &urls, &rules(100.0), date("2024-07-15")).await.unwrap();
        let second = apply_low_traffic_exclusion(&pool, &urls, &rules(100.0), date("2024-08-15")).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(store::list_exclusions(&pool).await.unwrap().len(), 1);
    }
}
