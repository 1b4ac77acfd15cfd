use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Flat field map returned by one connector.
pub type SourceFields = serde_json::Map<String, serde_json::Value>;

/// Connector name -> that connector's extracted fields.
pub type SourceData = BTreeMap<String, SourceFields>;

/// Topic key -> insights for that topic, in oracle order.
pub type InsightSet = BTreeMap<String, Vec<Insight>>;

/// A reporting period. `start` and `end` are both inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub year: Option<i32>,
    pub index: Option<u32>,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn label(&self) -> String {
        format!("{} to {}", self.start, self.end)
    }
}

/// Metric values captured for one URL over one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub url: String,
    pub period: Period,
    pub source_data: SourceData,
    pub insights: Option<InsightSet>,
}

/// A configured insight category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topic {
    /// Key used in the response shape and in stored insight sets.
    pub key: String,
    /// Human-readable name as written in config.
    pub name: String,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        let name = name.trim().to_string();
        let key = name.to_lowercase().split_whitespace().collect::<Vec<_>>().join("_");
        Self { key, name }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    #[serde(default)]
    pub topic: String,
    pub description: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub current_value: Option<f64>,
    #[serde(default)]
    pub prior_value: Option<f64>,
    #[serde(default)]
    pub change_absolute: Option<f64>,
    #[serde(default)]
    pub change_percentage: Option<f64>,
    #[serde(default)]
    pub importance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Insights produced for one URL, as collected by the pipeline.
#[derive(Debug, Clone)]
pub struct UrlInsights {
    pub url: String,
    pub insights: InsightSet,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct ExclusionRecord {
    pub url: String,
    pub excluded_on: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicInsights {
    pub topic: Topic,
    pub insights: Vec<Insight>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedReport {
    pub total_urls_analyzed: usize,
    pub by_topic: Vec<TopicInsights>,
}

impl AggregatedReport {
    pub fn insight_count(&self) -> usize {
        self.by_topic.iter().map(|t| t.insights.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_key_is_lowercase_snake() {
        let topic = Topic::new("Significant traffic changes");
        assert_eq!(topic.key, "significant_traffic_changes");
        assert_eq!(topic.name, "Significant traffic changes");
    }

    #[test]
    fn topic_key_collapses_whitespace() {
        let topic = Topic::new("  Changes to  prior or next pages ");
        assert_eq!(topic.key, "changes_to_prior_or_next_pages");
    }

    #[test]
    fn insight_accepts_missing_optional_fields() {
        let insight: Insight = serde_json::from_str(r#"{"description": "Sessions up", "importance_score": 80}"#).unwrap();
        assert_eq!(insight.current_value, None);
        assert_eq!(insight.change_absolute, None);
        assert_eq!(insight.details, "");
        assert_eq!(insight.importance_score, 80.0);
    }
}
