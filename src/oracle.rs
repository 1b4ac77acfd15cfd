use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::GeminiConfig;
use crate::error::GenerationError;

/// Black-box producer of structured insights: prompt + response shape -> JSON text.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the raw JSON text. Implementations own their retry policy and return
    /// an error only once it is exhausted.
    async fn generate(&self, prompt: &str, response_shape: &Value) -> Result<String, GenerationError>;
}

/// Gemini `generateContent` with JSON-constrained output.
pub struct GeminiOracle {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_output_tokens: u32,
    max_attempts: u32,
    backoff_min: Duration,
    backoff_max: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

impl GeminiOracle {
    pub fn from_config(config: &GeminiConfig) -> Result<Self> {
        let timeout = humantime::parse_duration(&config.timeout).context("parsing gemini timeout")?;
        let backoff_min = humantime::parse_duration(&config.backoff_min).context("parsing gemini backoff_min")?;
        let backoff_max = humantime::parse_duration(&config.backoff_max).context("parsing gemini backoff_max")?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("seo-insights/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building Gemini HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            max_attempts: config.max_attempts.max(1),
            backoff_min,
            backoff_max: backoff_max.max(backoff_min),
        })
    }

    async fn call_once(&self, prompt: &str, response_shape: &Value) -> Result<String, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": self.temperature,
                "topP": 1,
                "topK": 1,
                "maxOutputTokens": self.max_output_tokens,
                "responseMimeType": "application/json",
                "responseSchema": response_shape,
            }
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Request(format!("decoding response: {e}")))?;

        if let Some(usage) = &parsed.usage_metadata {
            info!(
                model = %self.model,
                prompt_tokens = ?usage.prompt_token_count,
                response_tokens = ?usage.candidates_token_count,
                "oracle token usage"
            );
        }

        let candidate = parsed.candidates.into_iter().next().ok_or(GenerationError::EmptyResponse)?;
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            warn!(finish_reason = ?candidate.finish_reason, "oracle candidate has no text");
            return Err(GenerationError::EmptyResponse);
        }

        Ok(text)
    }

    /// Exponential backoff clamped to `[backoff_min, backoff_max]`, plus up to 500ms jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = Duration::from_secs(1u64 << attempt.min(16));
        let base = exp.clamp(self.backoff_min, self.backoff_max);
        base + Duration::from_millis(rand::rng().random_range(0..=500))
    }
}

/// Client errors other than rate limiting will not succeed on retry.
fn is_retryable(err: &GenerationError) -> bool {
    match err {
        GenerationError::Api { status, .. } => *status == 429 || *status >= 500,
        _ => true,
    }
}

#[async_trait]
impl Oracle for GeminiOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, response_shape: &Value) -> Result<String, GenerationError> {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.backoff(attempt - 1);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying oracle call");
                tokio::time::sleep(delay).await;
            }

            match self.call_once(prompt, response_shape).await {
                Ok(text) => {
                    debug!(attempt, bytes = text.len(), "oracle call succeeded");
                    return Ok(text);
                }
                Err(e) if !is_retryable(&e) => {
                    warn!(attempt, error = %e, "oracle call failed, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "oracle call failed");
                    last_err = Some(e);
                }
            }
        }

        Err(GenerationError::RetriesExhausted {
            attempts: self.max_attempts,
            last_error: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}
