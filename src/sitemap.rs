use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::info;

use crate::config::UrlsConfig;

/// URLs to process: the explicit list when present, otherwise the sitemap.
pub async fn resolve_urls(urls: &UrlsConfig) -> Result<Vec<String>> {
    if !urls.list.is_empty() {
        return Ok(dedup(urls.list.iter().map(|u| u.trim().to_string())));
    }
    let Some(location) = &urls.sitemap else {
        bail!("no URLs configured: set urls.list or urls.sitemap");
    };
    let found = load_sitemap(location).await?;
    info!(sitemap = %location, count = found.len(), "loaded URLs from sitemap");
    Ok(found)
}

/// Read a sitemap from an http(s) URL or a local file and return its `<url><loc>` entries.
pub async fn load_sitemap(location: &str) -> Result<Vec<String>> {
    let xml = if location.starts_with("http://") || location.starts_with("https://") {
        let response = reqwest::get(location)
            .await
            .with_context(|| format!("fetching sitemap {location}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("fetching sitemap {location}: HTTP {status}");
        }
        response
            .text()
            .await
            .with_context(|| format!("reading sitemap body from {location}"))?
    } else {
        tokio::fs::read_to_string(location)
            .await
            .with_context(|| format!("reading sitemap file {location}"))?
    };

    let urls = parse_sitemap(&xml).with_context(|| format!("parsing sitemap {location}"))?;
    if urls.is_empty() {
        bail!("sitemap {location} lists no URLs");
    }
    Ok(urls)
}

/// `<loc>` values inside `<url>` elements, in document order without duplicates.
/// `<loc>` elements of a sitemap index (`<sitemap><loc>`) are ignored.
pub fn parse_sitemap(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut found = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;

    loop {
        match reader.read_event().context("malformed sitemap XML")? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"url" => in_url = true,
                b"loc" => in_loc = in_url,
                _ => {}
            },
            Event::End(e) => match e.local_name().as_ref() {
                b"url" => in_url = false,
                b"loc" => in_loc = false,
                _ => {}
            },
            Event::Text(text) if in_loc => {
                found.push(text.unescape().context("bad escape in <loc>")?.trim().to_string());
            }
            Event::CData(data) if in_loc => {
                found.push(String::from_utf8_lossy(&data).trim().to_string());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(dedup(found.into_iter()))
}

fn dedup(urls: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.filter(|u| !u.is_empty() && seen.insert(u.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITEMAP: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/</loc><lastmod>2024-06-01</lastmod></url>
  <url>
    <loc> https://example.com/blog?a=1&amp;b=2 </loc>
  </url>
  <url><loc><![CDATA[https://example.com/about]]></loc></url>
  <url><loc>https://example.com/</loc></url>
</urlset>"#;

    #[test]
    fn parses_url_locations() {
        let urls = parse_sitemap(SITEMAP).unwrap();
        assert_eq!(
            urls,
            vec![
                "https://example.com/".to_string(),
                "https://example.com/blog?a=1&b=2".to_string(),
                "https://example.com/about".to_string(),
            ]
        );
    }

    #[test]
    fn ignores_sitemap_index_entries() {
        let index = r#"<sitemapindex><sitemap><loc>https://example.com/s1.xml</loc></sitemap></sitemapindex>"#;
        assert!(parse_sitemap(index).unwrap().is_empty());
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_sitemap("<urlset><url><loc>x</url></urlset>").is_err());
    }

    #[tokio::test]
    async fn loads_sitemap_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sitemap.xml");
        std::fs::write(&path, SITEMAP).unwrap();

        let urls = load_sitemap(path.to_str().unwrap()).await.unwrap();
        assert_eq!(urls.len(), 3);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        assert!(load_sitemap("/nonexistent/sitemap.xml").await.is_err());
    }

    #[tokio::test]
    async fn explicit_list_wins_over_sitemap() {
        let urls = UrlsConfig {
            list: vec!["https://a.example/".to_string(), "https://a.example/".to_string()],
            sitemap: Some("/nonexistent/sitemap.xml".to_string()),
            test: Vec::new(),
        };
        assert_eq!(resolve_urls(&urls).await.unwrap(), vec!["https://a.example/".to_string()]);
    }
}
