use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connector_content::ContentConnector;
use crate::connector_ga4::Ga4Connector;
use crate::connector_gsc::GscConnector;
use crate::connector_psi::PsiConnector;
use crate::error::ConnectorError;
use crate::google_auth::GoogleAuth;
use crate::models::{Period, SourceData, SourceFields};

/// A metric source returning flat fields for one URL and period.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Key under which this source's fields are stored in a snapshot.
    fn name(&self) -> &str;

    /// Called once at startup; failures abort the run.
    async fn authenticate(&self) -> Result<(), ConnectorError>;

    async fn extract(&self, url: &str, period: &Period) -> Result<SourceFields, ConnectorError>;
}

/// Connectors enabled for this deployment, in registration order.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every connector whose config section is present.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();

        let google = config.google.as_ref().map(|g| Arc::new(GoogleAuth::new(g.clone())));

        if let Some(ga4) = &config.ga4 {
            let auth = google.clone().context("[ga4] requires [google] credentials")?;
            registry.register(Box::new(Ga4Connector::new(ga4.clone(), auth)?));
        }
        if let Some(gsc) = &config.gsc {
            let auth = google.clone().context("[gsc] requires [google] credentials")?;
            registry.register(Box::new(GscConnector::new(gsc.clone(), auth)?));
        }
        if let Some(psi) = &config.psi {
            registry.register(Box::new(PsiConnector::new(psi.clone())?));
        }
        if let Some(scrapingbee) = &config.scrapingbee {
            registry.register(Box::new(ContentConnector::new(scrapingbee.clone())?));
        }

        if registry.is_empty() {
            warn!("no metric sources configured; snapshots will be empty");
        }
        Ok(registry)
    }

    pub fn register(&mut self, connector: Box<dyn Connector>) {
        info!(connector = %connector.name(), "registered connector");
        self.connectors.push(connector);
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.connectors.iter().map(|c| c.name()).collect()
    }

    pub async fn authenticate_all(&self) -> Result<()> {
        for connector in &self.connectors {
            connector
                .authenticate()
                .await
                .with_context(|| format!("authenticating connector '{}'", connector.name()))?;
            debug!(connector = %connector.name(), "connector authenticated");
        }
        Ok(())
    }

    /// Pull every source for `url`. A failing source is logged and left out of the
    /// snapshot; the call only fails when every registered source failed.
    pub async fn extract_all(&self, url: &str, period: &Period) -> Result<SourceData, ConnectorError> {
        let mut data = SourceData::new();
        let mut failures = 0usize;

        for connector in &self.connectors {
            debug!(connector = %connector.name(), url = %url, period = %period.label(), "extracting");
            match connector.extract(url, period).await {
                Ok(fields) => {
                    data.insert(connector.name().to_string(), fields);
                }
                Err(e) => {
                    warn!(connector = %connector.name(), url = %url, error = %e, "source unavailable, continuing without it");
                    failures += 1;
                }
            }
        }

        if failures > 0 && failures == self.connectors.len() {
            return Err(ConnectorError::AllSourcesFailed { url: url.to_string() });
        }
        Ok(data)
    }
}

/// Map a non-success HTTP response into a connector error, keeping a bounded body excerpt.
pub(crate) async fn api_error(connector: &str, response: reqwest::Response) -> ConnectorError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ConnectorError::Api {
        connector: connector.to_string(),
        status,
        body: body.chars().take(500).collect(),
    }
}

pub(crate) fn http_error(connector: &str, url: &str, source: reqwest::Error) -> ConnectorError {
    ConnectorError::Http {
        connector: connector.to_string(),
        url: url.to_string(),
        source,
    }
}
