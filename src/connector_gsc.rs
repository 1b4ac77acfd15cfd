use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::GscConfig;
use crate::connector::{Connector, api_error, http_error};
use crate::error::ConnectorError;
use crate::google_auth::GoogleAuth;
use crate::models::{Period, SourceFields};

const NAME: &str = "gsc";
const API_BASE: &str = "https://www.googleapis.com/webmasters/v3/sites";

/// Search Console search analytics for a single page.
pub struct GscConnector {
    client: reqwest::Client,
    config: GscConfig,
    auth: Arc<GoogleAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<QueryRow>,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    clicks: f64,
    #[serde(default)]
    impressions: f64,
    #[serde(default)]
    ctr: f64,
    #[serde(default)]
    position: f64,
}

impl GscConnector {
    pub fn new(config: GscConfig, auth: Arc<GoogleAuth>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("building Search Console HTTP client")?;
        Ok(Self { client, config, auth })
    }

    fn endpoint(&self) -> Result<Url, ConnectorError> {
        let mut endpoint = Url::parse(API_BASE).map_err(|e| ConnectorError::Parse {
            connector: NAME.to_string(),
            message: e.to_string(),
        })?;
        // The site URL is a single, percent-encoded path segment.
        endpoint
            .path_segments_mut()
            .map_err(|_| ConnectorError::Parse {
                connector: NAME.to_string(),
                message: "API base cannot carry path segments".to_string(),
            })?
            .push(&self.config.site_url)
            .extend(["searchAnalytics", "query"]);
        Ok(endpoint)
    }

    async fn query(&self, url: &str, period: &Period, dimensions: &[&str]) -> Result<QueryResponse, ConnectorError> {
        let endpoint = self.endpoint()?;
        let token = self.auth.access_token(NAME).await?;

        let body = json!({
            "startDate": period.start.to_string(),
            "endDate": period.end.to_string(),
            "dimensions": dimensions,
            "rowLimit": self.config.row_limit,
            "dimensionFilterGroups": [{
                "filters": [{ "dimension": "page", "operator": "equals", "expression": url }]
            }],
        });

        let response = self
            .client
            .post(endpoint.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(NAME, endpoint.as_str(), e))?;

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
impl Connector for GscConnector {
    fn name(&self) -> &str {
        NAME
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        self.auth.access_token(NAME).await.map(|_| ())
    }

    async fn extract(&self, url: &str, period: &Period) -> Result<SourceFields, ConnectorError> {
        let totals = self.query(url, period, &[]).await?;
        let keywords = self.query(url, period, &["query"]).await?;
        Ok(to_fields(&totals, &keywords))
    }
}

fn to_fields(totals: &QueryResponse, keywords: &QueryResponse) -> SourceFields {
    let mut fields = SourceFields::new();
    let total = totals.rows.first();
    for (name, value) in [
        ("clicks", total.map(|r| r.clicks)),
        ("impressions", total.map(|r| r.impressions)),
        ("ctr", total.map(|r| r.ctr)),
        ("position", total.map(|r| r.position)),
    ] {
        fields.insert(name.to_string(), value.map_or(Value::Null, |v| json!(v)));
    }

    let ranking_keywords: Vec<Value> = keywords
        .rows
        .iter()
        .filter_map(|row| {
            let keyword = row.keys.first()?;
            Some(json!({
                "keyword": keyword,
                "clicks": row.clicks,
                "impressions": row.impressions,
                "position": row.position,
            }))
        })
        .collect();
    fields.insert("ranking_keywords".to_string(), Value::Array(ranking_keywords));
    fields
}
