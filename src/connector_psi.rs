use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use crate::config::PsiConfig;
use crate::connector::{Connector, api_error, http_error};
use crate::error::ConnectorError;
use crate::models::{Period, SourceFields};

const NAME: &str = "psi";
const ENDPOINT: &str = "https://www.googleapis.com/pagespeedonline/v5/runPagespeed";

/// Field name -> Lighthouse audit id whose `numericValue` it carries.
const AUDITS: &[(&str, &str)] = &[
    ("largest_contentful_paint", "largest-contentful-paint"),
    ("cumulative_layout_shift", "cumulative-layout-shift"),
    ("first_contentful_paint", "first-contentful-paint"),
    ("first_meaningful_paint", "first-meaningful-paint"),
    ("time_to_interactive", "interactive"),
    ("speed_index", "speed-index"),
    ("total_blocking_time", "total-blocking-time"),
];

/// PageSpeed Insights lab metrics per strategy. PSI measures the live page, so the
/// period is ignored.
pub struct PsiConnector {
    client: reqwest::Client,
    config: PsiConfig,
}

impl PsiConnector {
    pub fn new(config: PsiConfig) -> Result<Self> {
        let timeout = humantime::parse_duration(&config.timeout).context("parsing psi timeout")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building PSI HTTP client")?;
        Ok(Self { client, config })
    }

    async fn run(&self, url: &str, strategy: &str) -> Result<Value, ConnectorError> {
        let strategy = strategy.to_uppercase();
        let response = self
            .client
            .get(ENDPOINT)
            .query(&[
                ("url", url),
                ("strategy", strategy.as_str()),
                ("category", "PERFORMANCE"),
                ("key", self.config.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| http_error(NAME, url, e))?;

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
impl Connector for PsiConnector {
    fn name(&self) -> &str {
        NAME
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ConnectorError::Auth {
                connector: NAME.to_string(),
                message: "psi.api_key is empty".to_string(),
            });
        }
        Ok(())
    }

    async fn extract(&self, url: &str, _period: &Period) -> Result<SourceFields, ConnectorError> {
        let mut fields = SourceFields::new();
        let mut failures = 0usize;
        let mut last_err = None;

        for strategy in &self.config.strategies {
            let key = strategy.to_lowercase();
            let metrics = match self.run(url, strategy).await {
                Ok(body) => lighthouse_metrics(&body),
                Err(e) => {
                    warn!(url = %url, strategy = %key, error = %e, "PageSpeed run failed, recording null metrics");
                    failures += 1;
                    last_err = Some(e);
                    null_metrics()
                }
            };
            fields.insert(key, Value::Object(metrics));
        }

        // Every strategy failing is no data at all.
        match last_err {
            Some(e) if failures == self.config.strategies.len() => Err(e),
            _ => Ok(fields),
        }
    }
}

fn metric_names() -> impl Iterator<Item = &'static str> {
    AUDITS
        .iter()
        .map(|(name, _)| *name)
        .chain(["interaction_to_next_paint", "performance_score"])
}

fn null_metrics() -> SourceFields {
    metric_names().map(|name| (name.to_string(), Value::Null)).collect()
}

fn lighthouse_metrics(body: &Value) -> SourceFields {
    let audits = &body["lighthouseResult"]["audits"];
    let mut metrics: SourceFields = AUDITS
        .iter()
        .map(|(name, audit)| (name.to_string(), audits[*audit]["numericValue"].clone()))
        .collect();

    // Field data only; lab runs have no interaction to measure.
    metrics.insert(
        "interaction_to_next_paint".to_string(),
        body["loadingExperience"]["metrics"]["INTERACTION_TO_NEXT_PAINT"]["percentile"].clone(),
    );
    metrics.insert(
        "performance_score".to_string(),
        body["lighthouseResult"]["categories"]["performance"]["score"].clone(),
    );
    metrics
}
