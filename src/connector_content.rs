use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ScrapingBeeConfig;
use crate::connector::{Connector, api_error, http_error};
use crate::error::ConnectorError;
use crate::models::{Period, SourceFields};

const NAME: &str = "content";
const ENDPOINT: &str = "https://app.scrapingbee.com/api/v1/";

/// Rendered page content fetched through ScrapingBee. Captures the page as it is
/// now, so the period is ignored.
pub struct ContentConnector {
    client: reqwest::Client,
    config: ScrapingBeeConfig,
}

impl ContentConnector {
    pub fn new(config: ScrapingBeeConfig) -> Result<Self> {
        let timeout: Duration = humantime::parse_duration(&config.timeout).context("parsing scrapingbee timeout")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building ScrapingBee HTTP client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Connector for ContentConnector {
    fn name(&self) -> &str {
        NAME
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ConnectorError::Auth {
                connector: NAME.to_string(),
                message: "scrapingbee.api_key is empty".to_string(),
            });
        }
        Ok(())
    }

    async fn extract(&self, url: &str, _period: &Period) -> Result<SourceFields, ConnectorError> {
        let response = self
            .client
            .get(ENDPOINT)
            .query(&[
                ("api_key", self.config.api_key.as_str()),
                ("url", url),
                ("render_js", "true"),
                ("block_ads", "true"),
                ("wait_browser", "load"),
            ])
            .send()
            .await
            .map_err(|e| http_error(NAME, url, e))?;

        if !response.status().is_success() {
            return Err(api_error(NAME, response).await);
        }

        let html = response.text().await.map_err(|e| http_error(NAME, url, e))?;
        debug!(url = %url, bytes = html.len(), "fetched page content");
        Ok(page_fields(&html, self.config.max_text_chars))
    }
}

/// SEO-relevant fields from a rendered HTML page.
fn page_fields(html: &str, max_text_chars: usize) -> SourceFields {
    let document = Html::parse_document(html);

    let title = first_text(&document, "title");
    let meta_description = first_attr(&document, r#"meta[name="description"]"#, "content");
    let canonical = first_attr(&document, r#"link[rel="canonical"]"#, "href");
    let headings: Vec<String> = select_all(&document, "h1, h2")
        .into_iter()
        .filter(|h| !h.is_empty())
        .collect();

    let text = html2text::from_read(html.as_bytes(), 200).unwrap_or_default();
    let word_count = text.split_whitespace().filter(|w| w.chars().any(char::is_alphanumeric)).count();
    let text: String = text.chars().take(max_text_chars).collect();

    let mut fields = SourceFields::new();
    fields.insert("title".to_string(), title.map_or(Value::Null, Value::String));
    fields.insert("meta_description".to_string(), meta_description.map_or(Value::Null, Value::String));
    fields.insert("canonical".to_string(), canonical.map_or(Value::Null, Value::String));
    fields.insert("headings".to_string(), json!(headings));
    fields.insert("word_count".to_string(), json!(word_count));
    fields.insert("text".to_string(), Value::String(text));
    fields
}

fn compact_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn select_all(document: &Html, selector: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .map(|el| compact_ws(&el.text().collect::<Vec<_>>().join(" ")))
        .collect()
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    select_all(document, selector).into_iter().find(|t| !t.is_empty())
}

fn first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html>
<head>
  <title>  Rust SEO   Guide </title>
  <meta name="description" content="How to rank Rust pages.">
  <link rel="canonical" href="https://example.com/guide">
</head>
<body>
  <h1>Rust SEO</h1>
  <p>Fast pages rank well.</p>
  <h2>Metrics</h2>
  <p>Sessions and clicks matter.</p>
</body>
</html>"#;

    #[test]
    fn extracts_page_metadata() {
        let fields = page_fields(PAGE, 6000);
        assert_eq!(fields["title"], json!("Rust SEO Guide"));
        assert_eq!(fields["meta_description"], json!("How to rank Rust pages."));
        assert_eq!(fields["canonical"], json!("https://example.com/guide"));
        assert_eq!(fields["headings"], json!(["Rust SEO", "Metrics"]));
        assert!(fields["word_count"].as_u64().unwrap() >= 10);
        assert!(fields["text"].as_str().unwrap().contains("Fast pages rank well."));
    }

    #[test]
    fn missing_metadata_is_null() {
        let fields = page_fields("<html><body><p>hello</p></body></html>", 6000);
        assert_eq!(fields["title"], Value::Null);
        assert_eq!(fields["meta_description"], Value::Null);
        assert_eq!(fields["headings"], json!([]));
    }

    #[test]
    fn text_is_truncated() {
        let fields = page_fields(PAGE, 10);
        assert_eq!(fields["text"].as_str().unwrap().chars().count(), 10);
    }
}
