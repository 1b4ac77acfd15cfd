use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::{AggregatedReport, Insight, Period};

/// Heading and period shown at the top of every rendering.
pub struct ReportHeader<'a> {
    pub title: &'a str,
    pub period: &'a Period,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Markdown,
    Html,
    Json,
}

impl OutputFormat {
    /// `.json` and `.html`/`.htm` select those formats; anything else is Markdown.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Self::Json,
            Some("html" | "htm") => Self::Html,
            _ => Self::Markdown,
        }
    }
}

pub fn render(format: OutputFormat, header: &ReportHeader<'_>, report: &AggregatedReport) -> Result<String> {
    match format {
        OutputFormat::Markdown => Ok(render_markdown(header, report)),
        OutputFormat::Html => Ok(render_html(header, report)),
        OutputFormat::Json => render_json(header, report),
    }
}

/// Render to `path`, choosing the format from its extension.
pub async fn write_report(path: &Path, header: &ReportHeader<'_>, report: &AggregatedReport) -> Result<()> {
    let body = render(OutputFormat::from_path(path), header, report)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("writing report to {}", path.display()))
}

pub fn render_markdown(header: &ReportHeader<'_>, report: &AggregatedReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}\n", header.title);
    let _ = writeln!(
        out,
        "Period: {}  \nURLs analyzed: {}  \nInsights: {}\n",
        header.period.label(),
        report.total_urls_analyzed,
        report.insight_count()
    );

    for section in &report.by_topic {
        let _ = writeln!(out, "## {}\n", section.topic.name);
        if section.insights.is_empty() {
            out.push_str("_No significant changes._\n\n");
            continue;
        }
        for (i, insight) in section.insights.iter().enumerate() {
            write_insight(&mut out, i + 1, insight);
        }
        out.push('\n');
    }
    out
}

fn write_insight(out: &mut String, n: usize, insight: &Insight) {
    let _ = write!(out, "{n}. **{}**", escape_inline(insight.description.trim()));
    if let Some(url) = &insight.url {
        let _ = write!(out, " ([{url}]({url}))");
    }
    out.push('\n');
    if !insight.details.trim().is_empty() {
        let _ = writeln!(out, "   {}", escape_inline(insight.details.trim()));
    }
    let _ = writeln!(
        out,
        "   Current: {}, prior: {}, change: {} ({}), importance: {}",
        number(insight.current_value),
        number(insight.prior_value),
        signed(insight.change_absolute, ""),
        signed(insight.change_percentage, "%"),
        number(Some(insight.importance_score)),
    );
}

/// Oracle text must not carry raw HTML into the rendered email.
fn escape_inline(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{v:.0}"),
        Some(v) => format!("{v:.2}"),
        None => "n/a".to_string(),
    }
}

fn signed(value: Option<f64>, suffix: &str) -> String {
    match value {
        Some(v) if v > 0.0 => format!("+{}{suffix}", number(Some(v))),
        Some(v) => format!("{}{suffix}", number(Some(v))),
        None => "n/a".to_string(),
    }
}

pub fn render_html(header: &ReportHeader<'_>, report: &AggregatedReport) -> String {
    let markdown = render_markdown(header, report);
    let parser = pulldown_cmark::Parser::new(&markdown);
    let mut body = String::new();
    pulldown_cmark::html::push_html(&mut body, parser);

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{body}</body>\n</html>\n",
        escape_html(header.title)
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[derive(Serialize)]
struct JsonReport<'a> {
    title: &'a str,
    period: &'a Period,
    #[serde(flatten)]
    report: &'a AggregatedReport,
}

pub fn render_json(header: &ReportHeader<'_>, report: &AggregatedReport) -> Result<String> {
    let doc = JsonReport {
        title: header.title,
        period: header.period,
        report,
    };
    serde_json::to_string_pretty(&doc).context("serializing report")
}
