use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::Ga4Config;
use crate::connector::{Connector, api_error, http_error};
use crate::error::ConnectorError;
use crate::google_auth::GoogleAuth;
use crate::models::{Period, SourceFields};

const NAME: &str = "ga4";
const API_BASE: &str = "https://analyticsdata.googleapis.com/v1beta";

/// Google Analytics 4 Data API, filtered to a single page path.
pub struct Ga4Connector {
    client: reqwest::Client,
    config: Ga4Config,
    auth: Arc<GoogleAuth>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReportResponse {
    #[serde(default)]
    rows: Vec<ReportRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow {
    #[serde(default)]
    dimension_values: Vec<ReportValue>,
    #[serde(default)]
    metric_values: Vec<ReportValue>,
}

#[derive(Debug, Deserialize)]
struct ReportValue {
    #[serde(default)]
    value: String,
}

impl Ga4Connector {
    pub fn new(config: Ga4Config, auth: Arc<GoogleAuth>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("building GA4 HTTP client")?;
        Ok(Self { client, config, auth })
    }

    async fn run_report(
        &self,
        page_path: &str,
        period: &Period,
        dimensions: &[&str],
        metrics: &[&str],
    ) -> Result<RunReportResponse, ConnectorError> {
        let endpoint = format!("{API_BASE}/properties/{}:runReport", self.config.property_id);
        let token = self.auth.access_token(NAME).await?;

        let mut body = json!({
            "dateRanges": [{
                "startDate": period.start.to_string(),
                "endDate": period.end.to_string(),
            }],
            "dimensions": dimensions.iter().map(|d| json!({ "name": d })).collect::<Vec<_>>(),
            "metrics": metrics.iter().map(|m| json!({ "name": m })).collect::<Vec<_>>(),
            "dimensionFilter": {
                "filter": {
                    "fieldName": "pagePathPlusQueryString",
                    "stringFilter": { "matchType": "EXACT", "value": page_path },
                }
            },
        });
        if !dimensions.is_empty() {
            body["limit"] = json!(self.config.top_rows);
            body["orderBys"] = json!([{ "metric": { "metricName": metrics[0] }, "desc": true }]);
        }

        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(NAME, &endpoint, e))?;

        if !response.status().is_success() {
            return Err(api_error(NAME, response).await);
        }

        response.json().await.map_err(|e| ConnectorError::Parse {
            connector: NAME.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Connector for Ga4Connector {
    fn name(&self) -> &str {
        NAME
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        self.auth.access_token(NAME).await.map(|_| ())
    }

    async fn extract(&self, url: &str, period: &Period) -> Result<SourceFields, ConnectorError> {
        let page_path = page_path(url)?;
        debug!(url = %url, page_path = %page_path, "running GA4 reports");

        let totals = self
            .run_report(&page_path, period, &[], &["sessions", "screenPageViews", "bounceRate"])
            .await?;
        let previous = self.run_report(&page_path, period, &["previousPagePath"], &["screenPageViews"]).await?;
        let next = self.run_report(&page_path, period, &["nextPagePath"], &["screenPageViews"]).await?;
        let referrers = self.run_report(&page_path, period, &["sessionSource"], &["sessions"]).await?;

        let mut fields = total_fields(&totals);
        fields.insert("previous_pages".to_string(), first_dimensions(&previous));
        fields.insert("next_pages".to_string(), first_dimensions(&next));
        fields.insert("referring_sites".to_string(), first_dimensions(&referrers));
        Ok(fields)
    }
}

/// GA4 filters on path plus query string, not the absolute URL.
fn page_path(url: &str) -> Result<String, ConnectorError> {
    let parsed = Url::parse(url).map_err(|e| ConnectorError::Parse {
        connector: NAME.to_string(),
        message: format!("invalid page URL '{url}': {e}"),
    })?;
    Ok(match parsed.query() {
        Some(query) => format!("{}?{query}", parsed.path()),
        None => parsed.path().to_string(),
    })
}

/// GA4 answers a page with no traffic in the period with zero rows, so that reads as zeros.
fn total_fields(totals: &RunReportResponse) -> SourceFields {
    let mut fields = SourceFields::new();
    for (index, name) in ["sessions", "screen_page_views", "bounce_rate"].into_iter().enumerate() {
        let value = match totals.rows.first() {
            Some(row) => metric(Some(row), index),
            None => json!(0),
        };
        fields.insert(name.to_string(), value);
    }
    fields
}

/// Metric values arrive as strings; numeric ones are stored as numbers, absent ones as null.
fn metric(row: Option<&ReportRow>, index: usize) -> Value {
    let Some(raw) = row.and_then(|r| r.metric_values.get(index)).map(|v| v.value.as_str()) else {
        return Value::Null;
    };
    raw.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn first_dimensions(report: &RunReportResponse) -> Value {
    report
        .rows
        .iter()
        .filter_map(|row| row.dimension_values.first())
        .map(|v| Value::String(v.value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_path_keeps_query() {
        assert_eq!(page_path("https://example.com/blog/post?ref=x").unwrap(), "/blog/post?ref=x");
        assert_eq!(page_path("https://example.com").unwrap(), "/");
        assert!(page_path("not a url").is_err());
    }

    #[test]
    fn report_rows_become_fields() {
        let totals: RunReportResponse = serde_json::from_value(json!({
            "rows": [{ "metricValues": [{"value": "120"}, {"value": "300"}, {"value": "0.42"}] }]
        }))
        .unwrap();
        let row = totals.rows.first();
        assert_eq!(metric(row, 0), json!(120.0));
        assert_eq!(metric(row, 2), json!(0.42));
        assert_eq!(metric(row, 5), Value::Null);

        let pages: RunReportResponse = serde_json::from_value(json!({
            "rows": [
                { "dimensionValues": [{"value": "/"}], "metricValues": [{"value": "10"}] },
                { "dimensionValues": [{"value": "/pricing"}], "metricValues": [{"value": "4"}] }
            ]
        }))
        .unwrap();
        assert_eq!(first_dimensions(&pages), json!(["/", "/pricing"]));
    }

    #[test]
    fn empty_report_yields_nulls() {
        let empty = RunReportResponse::default();
        assert_eq!(metric(empty.rows.first(), 0), Value::Null);
        assert_eq!(first_dimensions(&empty), json!([]));
    }

    #[test]
    fn page_without_traffic_reports_zero_totals() {
        let fields = total_fields(&RunReportResponse::default());
        assert_eq!(fields["sessions"], json!(0));
        assert_eq!(fields["screen_page_views"], json!(0));
        assert_eq!(fields["bounce_rate"], json!(0));

        let totals: RunReportResponse = serde_json::from_value(json!({
            "rows": [{ "metricValues": [{"value": "12"}, {"value": "30"}] }]
        }))
        .unwrap();
        let fields = total_fields(&totals);
        assert_eq!(fields["sessions"], json!(12.0));
        assert_eq!(fields["bounce_rate"], Value::Null);
    }
}
