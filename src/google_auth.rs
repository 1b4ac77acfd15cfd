use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::GoogleConfig;
use crate::error::ConnectorError;

/// Tokens are refreshed this long before Google says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// OAuth2 refresh-token grant with an in-memory access token cache.
pub struct GoogleAuth {
    client: reqwest::Client,
    config: GoogleConfig,
    cached: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

impl GoogleAuth {
    pub fn new(config: GoogleConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            cached: Mutex::new(None),
        }
    }

    /// Current access token, refreshing it when missing or about to expire.
    /// `connector` names the caller in errors.
    pub async fn access_token(&self, connector: &str) -> Result<String, ConnectorError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.expires_at
        {
            return Ok(token.access_token.clone());
        }

        let token = self.refresh(connector).await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn refresh(&self, connector: &str) -> Result<CachedToken, ConnectorError> {
        let auth_err = |message: String| ConnectorError::Auth {
            connector: connector.to_string(),
            message,
        };

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", self.config.refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| auth_err(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_err(format!("token endpoint returned {status}: {}", body.trim())));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_err(format!("invalid token response: {e}")))?;

        debug!(connector, expires_in = token.expires_in, "refreshed Google access token");
        Ok(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN),
        })
    }
}
