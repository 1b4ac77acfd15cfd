use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::Topic;
use crate::period::{PeriodCalculator, PeriodPolicy, ScheduleMode};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub urls: UrlsConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub exclusion: ExclusionConfig,
    pub gemini: Option<GeminiConfig>,
    pub google: Option<GoogleConfig>,
    pub ga4: Option<Ga4Config>,
    pub gsc: Option<GscConfig>,
    pub psi: Option<PsiConfig>,
    pub scrapingbee: Option<ScrapingBeeConfig>,
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Rolling daily log file, relative to `data_dir` unless absolute.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            timezone: default_timezone(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "seo-insights.db".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_mode")]
    pub mode: ScheduleMode,
    #[serde(default = "default_policy")]
    pub policy: PeriodPolicy,
    #[serde(default = "default_max_concurrent_urls")]
    pub max_concurrent_urls: u32,
    #[serde(default = "default_url_timeout")]
    pub url_timeout: String,
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            policy: default_policy(),
            max_concurrent_urls: default_max_concurrent_urls(),
            url_timeout: default_url_timeout(),
            check_interval: default_check_interval(),
        }
    }
}

fn default_mode() -> ScheduleMode {
    ScheduleMode::Monthly
}
fn default_policy() -> PeriodPolicy {
    PeriodPolicy::Calendar
}
fn default_max_concurrent_urls() -> u32 {
    1
}
fn default_url_timeout() -> String {
    "10m".to_string()
}
fn default_check_interval() -> String {
    "1h".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct UrlsConfig {
    /// Explicit URL list; takes precedence over the sitemap.
    #[serde(default)]
    pub list: Vec<String>,
    /// Sitemap location: a local path or an http(s) URL.
    #[serde(default)]
    pub sitemap: Option<String>,
    /// URLs used by `test-urls` when none are given on the command line.
    #[serde(default)]
    pub test: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: f64,
    #[serde(default = "default_max_insights")]
    pub max_insights: usize,
    #[serde(default = "default_subject")]
    pub subject: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            topics: default_topics(),
            significance_threshold: default_significance_threshold(),
            max_insights: default_max_insights(),
            subject: default_subject(),
        }
    }
}

fn default_topics() -> Vec<String> {
    [
        "Significant traffic changes",
        "Significant keyword changes",
        "Significant content changes",
        "Significant changes to prior or next pages",
        "Significant changes to referral sources",
        "Significant changes to organic search sources",
        "Causal relationships between changes",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_significance_threshold() -> f64 {
    25.0
}
fn default_max_insights() -> usize {
    5
}
fn default_subject() -> String {
    "SEO Insights Report".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ExclusionConfig {
    #[serde(default = "default_low_traffic_threshold")]
    pub low_traffic_threshold: f64,
    /// Connector whose fields carry the traffic metric.
    #[serde(default = "default_traffic_source")]
    pub traffic_source: String,
    #[serde(default = "default_traffic_field")]
    pub traffic_field: String,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            low_traffic_threshold: default_low_traffic_threshold(),
            traffic_source: default_traffic_source(),
            traffic_field: default_traffic_field(),
        }
    }
}

fn default_low_traffic_threshold() -> f64 {
    100.0
}
fn default_traffic_source() -> String {
    "ga4".to_string()
}
fn default_traffic_field() -> String {
    "sessions".to_string()
}

#[derive(Debug, Deserialize)]
pub struct GeminiConfig {
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_min")]
    pub backoff_min: String,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,
    #[serde(default = "default_request_timeout")]
    pub timeout: String,
}

fn default_gemini_model() -> String {
    "gemini-1.5-pro".to_string()
}
fn default_gemini_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    8192
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_min() -> String {
    "4s".to_string()
}
fn default_backoff_max() -> String {
    "10s".to_string()
}
fn default_request_timeout() -> String {
    "2m".to_string()
}

/// OAuth2 client credentials shared by the GA4 and Search Console connectors.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ga4Config {
    pub property_id: String,
    #[serde(default = "default_top_rows")]
    pub top_rows: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GscConfig {
    pub site_url: String,
    #[serde(default = "default_keyword_rows")]
    pub row_limit: u32,
}

fn default_top_rows() -> u32 {
    5
}
fn default_keyword_rows() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PsiConfig {
    pub api_key: String,
    #[serde(default = "default_psi_timeout")]
    pub timeout: String,
    #[serde(default = "default_psi_strategies")]
    pub strategies: Vec<String>,
}

fn default_psi_timeout() -> String {
    "60s".to_string()
}
fn default_psi_strategies() -> Vec<String> {
    vec!["desktop".to_string(), "mobile".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrapingBeeConfig {
    pub api_key: String,
    #[serde(default = "default_scrape_timeout")]
    pub timeout: String,
    /// Characters of readable text kept in the snapshot.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

fn default_scrape_timeout() -> String {
    "90s".to_string()
}
fn default_max_text_chars() -> usize {
    6000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
    pub recipient: String,
}

fn default_smtp_host() -> String {
    "live.smtp.mailtrap.io".to_string()
}
fn default_smtp_port() -> u16 {
    587
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        self.resolve(Path::new(&self.database.path))
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.app.log_file.as_deref().map(|p| self.resolve(p))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.app.data_dir.join(path)
        }
    }

    /// Configured topics in report order.
    pub fn topics(&self) -> Vec<Topic> {
        self.report.topics.iter().map(|t| Topic::new(t)).collect()
    }

    pub fn periods(&self) -> PeriodCalculator {
        PeriodCalculator::new(self.schedule.mode, self.schedule.policy)
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.app
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", self.app.timezone)).into())
    }

    pub fn url_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.schedule.url_timeout)
            .with_context(|| format!("parsing url_timeout '{}'", self.schedule.url_timeout))
    }

    pub fn check_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.schedule.check_interval)
            .with_context(|| format!("parsing check_interval '{}'", self.schedule.check_interval))
    }

    pub fn require_gemini(&self) -> Result<&GeminiConfig, ConfigError> {
        self.gemini.as_ref().ok_or(ConfigError::MissingSection("gemini"))
    }

    pub fn require_email(&self) -> Result<&EmailConfig, ConfigError> {
        self.email.as_ref().ok_or(ConfigError::MissingSection("email"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Topics
    if config.report.topics.is_empty() {
        return Err(ConfigError::Validation("report.topics must list at least one topic".to_string()).into());
    }
    let mut topic_keys = HashSet::new();
    for topic in config.topics() {
        if topic.key.is_empty() {
            return Err(ConfigError::Validation("report.topics contains an empty topic".to_string()).into());
        }
        if !topic_keys.insert(topic.key.clone()) {
            return Err(ConfigError::Validation(format!("duplicate report topic: '{}'", topic.name)).into());
        }
    }

    if config.report.max_insights == 0 {
        return Err(ConfigError::Validation("report.max_insights must be at least 1".to_string()).into());
    }

    let threshold = config.report.significance_threshold;
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ConfigError::Validation(format!(
            "report.significance_threshold must be a non-negative number, got {threshold}"
        ))
        .into());
    }

    let low_traffic = config.exclusion.low_traffic_threshold;
    if !low_traffic.is_finite() || low_traffic < 0.0 {
        return Err(ConfigError::Validation(format!(
            "exclusion.low_traffic_threshold must be a non-negative number, got {low_traffic}"
        ))
        .into());
    }

    // URL sources
    if config.urls.list.is_empty() && config.urls.sitemap.is_none() {
        return Err(ConfigError::Validation("no URLs configured: set urls.list or urls.sitemap".to_string()).into());
    }

    if config.schedule.max_concurrent_urls == 0 {
        return Err(ConfigError::Validation("schedule.max_concurrent_urls must be at least 1".to_string()).into());
    }

    // Connectors needing Google OAuth
    if (config.ga4.is_some() || config.gsc.is_some()) && config.google.is_none() {
        return Err(
            ConfigError::Validation("[ga4] and [gsc] require [google] OAuth credentials".to_string()).into(),
        );
    }

    if let Some(gemini) = &config.gemini {
        if gemini.max_attempts == 0 {
            return Err(ConfigError::Validation("gemini.max_attempts must be at least 1".to_string()).into());
        }
        for (name, value) in [
            ("gemini.backoff_min", &gemini.backoff_min),
            ("gemini.backoff_max", &gemini.backoff_max),
            ("gemini.timeout", &gemini.timeout),
        ] {
            validate_duration(name, value)?;
        }
    }

    if let Some(psi) = &config.psi {
        validate_duration("psi.timeout", &psi.timeout)?;
        for strategy in &psi.strategies {
            if !matches!(strategy.to_lowercase().as_str(), "desktop" | "mobile") {
                return Err(ConfigError::Validation(format!("psi: unknown strategy '{strategy}'")).into());
            }
        }
    }

    if let Some(scrapingbee) = &config.scrapingbee {
        validate_duration("scrapingbee.timeout", &scrapingbee.timeout)?;
    }

    // Timezone
    config.timezone()?;

    validate_duration("schedule.url_timeout", &config.schedule.url_timeout)?;
    validate_duration("schedule.check_interval", &config.schedule.check_interval)?;

    Ok(())
}

fn validate_duration(name: &str, value: &str) -> Result<(), ConfigError> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| ConfigError::Validation(format!("{name} '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[urls]
list = ["https://example.com/"]
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.schedule.mode, ScheduleMode::Monthly);
        assert_eq!(config.schedule.policy, PeriodPolicy::Calendar);
        assert_eq!(config.report.max_insights, 5);
        assert_eq!(config.report.significance_threshold, 25.0);
        assert_eq!(config.exclusion.traffic_source, "ga4");
        assert_eq!(config.topics().len(), 7);
        assert_eq!(config.db_path(), PathBuf::from("./data/seo-insights.db"));
    }

    #[test]
    fn parses_schedule_enums() {
        let config = parse_config(
            r#"
[schedule]
mode = "weekly"
policy = "rolling"

[urls]
sitemap = "sitemap.xml"
"#,
        )
        .unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.schedule.mode, ScheduleMode::Weekly);
        assert_eq!(config.schedule.policy, PeriodPolicy::Rolling);
    }

    #[test]
    fn rejects_unknown_schedule_mode() {
        let err = parse_config("[schedule]\nmode = \"daily\"\n").unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn rejects_missing_urls() {
        let config = parse_config("").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("no URLs configured"));
    }

    #[test]
    fn rejects_duplicate_topics() {
        let config = parse_config(
            r#"
[urls]
list = ["https://example.com/"]

[report]
topics = ["Traffic changes", "traffic  changes"]
"#,
        )
        .unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate report topic"));
    }

    #[test]
    fn rejects_ga4_without_google_credentials() {
        let config = parse_config(
            r#"
[urls]
list = ["https://example.com/"]

[ga4]
property_id = "123"
"#,
        )
        .unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("[google]"));
    }

    #[test]
    fn rejects_bad_timezone_and_durations() {
        let config = parse_config(
            r#"
[app]
timezone = "Mars/Olympus"

[urls]
list = ["https://example.com/"]
"#,
        )
        .unwrap();
        assert!(validate_config(&config).unwrap_err().to_string().contains("unknown timezone"));

        let config = parse_config(
            r#"
[schedule]
url_timeout = "soon"

[urls]
list = ["https://example.com/"]
"#,
        )
        .unwrap();
        assert!(validate_config(&config).unwrap_err().to_string().contains("url_timeout"));
    }

    #[test]
    fn missing_sections_are_config_errors() {
        let config = parse_config(MINIMAL).unwrap();
        assert!(matches!(config.require_gemini(), Err(ConfigError::MissingSection("gemini"))));
        assert!(matches!(config.require_email(), Err(ConfigError::MissingSection("email"))));
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../config.example.toml")).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.schedule.max_concurrent_urls, 2);
        assert_eq!(config.report.significance_threshold, 25.0);
        assert!(config.require_gemini().is_ok());
        assert_eq!(config.psi.unwrap().strategies.len(), 2);
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.urls.list, vec!["https://example.com/".to_string()]);
    }
}
