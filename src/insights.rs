use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::models::{Insight, InsightSet, Snapshot, Topic};
use crate::oracle::Oracle;

/// Fields every insight object must carry in the oracle response.
const REQUIRED_FIELDS: [&str; 5] = ["description", "details", "importance_score", "current_value", "prior_value"];
/// Values may be missing when a metric has no reading in one of the periods.
const NULLABLE_FIELDS: [&str; 2] = ["current_value", "prior_value"];

/// Ask the oracle to compare two snapshots and return insights per topic.
///
/// The oracle's own change arithmetic is discarded; `change_absolute` and
/// `change_percentage` are recomputed from the reported values.
pub async fn generate(
    oracle: &dyn Oracle,
    current: &Snapshot,
    prior: &Snapshot,
    topics: &[Topic],
) -> Result<InsightSet, GenerationError> {
    let prompt = build_prompt(current, prior, topics);
    let shape = response_shape(topics);

    debug!(url = %current.url, oracle = %oracle.name(), prompt_chars = prompt.len(), "requesting insights");
    let raw = oracle.generate(&prompt, &shape).await?;

    let insights = parse_insights(&raw, topics)?;
    let total: usize = insights.values().map(Vec::len).sum();
    info!(url = %current.url, insights = total, "insights generated");
    Ok(insights)
}

pub fn build_prompt(current: &Snapshot, prior: &Snapshot, topics: &[Topic]) -> String {
    let topic_lines: Vec<String> = topics.iter().map(|t| format!("- {} (key: {})", t.name, t.key)).collect();

    format!(
        "Analyze the following SEO data for a single URL and provide insights on the specified topics.

Current Data:
{current}

Prior Data:
{prior}

Focus on the following topics and provide detailed insights:

{topics}

For each insight:
- Provide specific numeric data points for both the current and the prior period (current_value, prior_value)
- Assign an importance score (0-100) based on the potential impact of the change
- Provide clear, actionable details about the change
- Focus on significant changes in absolute values or clear trends

Ensure all conclusions are strongly supported by the data provided. Focus on changes that have a \
substantial impact on the URL's performance. Return an empty list for a topic with no supported insight.
",
        current = format!("{:#}", snapshot_context(current)),
        prior = format!("{:#}", snapshot_context(prior)),
        topics = topic_lines.join("\n"),
    )
}

fn snapshot_context(snapshot: &Snapshot) -> Value {
    json!({
        "data_attribution": {
            "url": snapshot.url,
            "date_range": snapshot.period.label(),
        },
        "data": snapshot.source_data,
    })
}

/// Response shape in the oracle's schema dialect: one required array per topic.
pub fn response_shape(topics: &[Topic]) -> Value {
    let item = json!({
        "type": "OBJECT",
        "properties": {
            "description": { "type": "STRING" },
            "details": { "type": "STRING" },
            "importance_score": { "type": "NUMBER" },
            "current_value": { "type": "NUMBER" },
            "prior_value": { "type": "NUMBER" },
        },
        "required": REQUIRED_FIELDS,
    });

    let properties: serde_json::Map<String, Value> = topics
        .iter()
        .map(|t| (t.key.clone(), json!({ "type": "ARRAY", "items": item.clone() })))
        .collect();
    let required: Vec<&str> = topics.iter().map(|t| t.key.as_str()).collect();

    json!({
        "type": "OBJECT",
        "properties": properties,
        "required": required,
    })
}

/// Parse oracle output into an insight set covering every configured topic.
pub fn parse_insights(raw: &str, topics: &[Topic]) -> Result<InsightSet, GenerationError> {
    let value: Value = serde_json::from_str(raw.trim())?;
    let Value::Object(mut object) = value else {
        return Err(GenerationError::Shape("top-level value is not an object".to_string()));
    };

    let mut set = InsightSet::new();
    for topic in topics {
        let items = match object.remove(&topic.key) {
            None | Some(Value::Null) => {
                warn!(topic = %topic.key, "oracle response has no entry for topic");
                Vec::new()
            }
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(GenerationError::Shape(format!(
                    "topic '{}' is not an array (got {})",
                    topic.key,
                    json_kind(&other)
                )));
            }
        };

        let mut insights = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let Some(fields) = item.as_object() else {
                return Err(GenerationError::Shape(format!("topic '{}' item {i} is not an object", topic.key)));
            };
            if let Some(missing) = REQUIRED_FIELDS
                .iter()
                .copied()
                .filter(|field| !NULLABLE_FIELDS.contains(field))
                .find(|field| fields.get(*field).is_none_or(Value::is_null))
            {
                return Err(GenerationError::Shape(format!(
                    "topic '{}' item {i} is missing '{missing}'",
                    topic.key
                )));
            }
            let mut insight: Insight = serde_json::from_value(item)
                .map_err(|e| GenerationError::Shape(format!("topic '{}' item {i}: {e}", topic.key)))?;
            normalize(&mut insight, &topic.key);
            insights.push(insight);
        }
        set.insert(topic.key.clone(), insights);
    }

    if !object.is_empty() {
        let extra: Vec<&String> = object.keys().collect();
        debug!(keys = ?extra, "ignoring unrequested topics in oracle response");
    }

    Ok(set)
}

fn normalize(insight: &mut Insight, topic_key: &str) {
    insight.topic = topic_key.to_string();
    insight.url = None;
    insight.importance_score = if insight.importance_score.is_finite() {
        insight.importance_score.clamp(0.0, 100.0)
    } else {
        0.0
    };

    match (insight.current_value, insight.prior_value) {
        (Some(current), Some(prior)) => {
            insight.change_absolute = Some(current - prior);
            insight.change_percentage = Some(change_percentage(current, prior));
        }
        _ => {
            insight.change_absolute = None;
            insight.change_percentage = None;
        }
    }
}

/// Percentage change from `prior` to `current`; a zero base yields 100 for growth, else 0.
pub fn change_percentage(current: f64, prior: f64) -> f64 {
    if prior == 0.0 {
        if current > 0.0 { 100.0 } else { 0.0 }
    } else {
        100.0 * (current - prior) / prior
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Period, SourceData};
    use async_trait::async_trait;
    use chrono::NaiveDate;

    fn topics() -> Vec<Topic> {
        vec![Topic::new("Significant traffic changes"), Topic::new("Significant keyword changes")]
    }

    fn snapshot(url: &str, start: &str, end: &str, sessions: i64) -> Snapshot {
        let mut fields = serde_json::Map::new();
        fields.insert("sessions".to_string(), json!(sessions));
        Snapshot {
            url: url.to_string(),
            period: Period {
                year: None,
                index: None,
                start: NaiveDate::parse_from_str(start, "%Y-%m-%d").unwrap(),
                end: NaiveDate::parse_from_str(end, "%Y-%m-%d").unwrap(),
            },
            source_data: SourceData::from([("ga4".to_string(), fields)]),
            insights: None,
        }
    }

    struct CannedOracle(Result<String, ()>);

    #[async_trait]
    impl Oracle for CannedOracle {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, _prompt: &str, _shape: &Value) -> Result<String, GenerationError> {
            self.0.clone().map_err(|_| GenerationError::RetriesExhausted {
                attempts: 3,
                last_error: "boom".to_string(),
            })
        }
    }

    #[test]
    fn percentage_from_zero_base() {
        assert_eq!(change_percentage(5.0, 0.0), 100.0);
        assert_eq!(change_percentage(0.0, 0.0), 0.0);
        assert_eq!(change_percentage(-3.0, 0.0), 0.0);
    }

    #[test]
    fn percentage_is_sign_consistent() {
        assert_eq!(change_percentage(120.0, 80.0), 50.0);
        assert_eq!(change_percentage(60.0, 80.0), -25.0);
        assert_eq!(change_percentage(-20.0, -10.0), 100.0 * -10.0 / -10.0);
    }

    #[test]
    fn response_shape_requires_every_topic() {
        let shape = response_shape(&topics());
        assert_eq!(shape["required"], json!(["significant_traffic_changes", "significant_keyword_changes"]));
        let item = &shape["properties"]["significant_traffic_changes"]["items"];
        assert_eq!(item["required"], json!(REQUIRED_FIELDS));
        assert_eq!(item["properties"]["importance_score"]["type"], "NUMBER");
    }

    #[test]
    fn prompt_pairs_current_and_prior() {
        let current = snapshot("https://a.example/", "2024-06-01", "2024-06-30", 120);
        let prior = snapshot("https://a.example/", "2024-05-01", "2024-05-31", 80);
        let prompt = build_prompt(&current, &prior, &topics());

        let current_at = prompt.find("Current Data:").unwrap();
        let prior_at = prompt.find("Prior Data:").unwrap();
        assert!(current_at < prior_at);
        assert!(prompt[current_at..prior_at].contains("2024-06-01 to 2024-06-30"));
        assert!(prompt[prior_at..].contains("2024-05-01 to 2024-05-31"));
        assert!(prompt.contains("- Significant keyword changes (key: significant_keyword_changes)"));
    }

    #[test]
    fn parse_overwrites_oracle_arithmetic() {
        let raw = r#"{
            "significant_traffic_changes": [{
                "description": "Sessions grew",
                "details": "Organic sessions up",
                "importance_score": 140,
                "current_value": 120,
                "prior_value": 80,
                "change_absolute": 999,
                "change_percentage": 1
            }],
            "significant_keyword_changes": []
        }"#;
        let set = parse_insights(raw, &topics()).unwrap();
        let insight = &set["significant_traffic_changes"][0];
        assert_eq!(insight.change_absolute, Some(40.0));
        assert_eq!(insight.change_percentage, Some(50.0));
        assert_eq!(insight.importance_score, 100.0);
        assert_eq!(insight.topic, "significant_traffic_changes");
        assert!(set["significant_keyword_changes"].is_empty());
    }

    #[test]
    fn parse_leaves_changes_unset_without_both_values() {
        let raw = r#"{
            "significant_traffic_changes": [{
                "description": "New referral source",
                "details": "",
                "importance_score": 40,
                "current_value": 12,
                "change_absolute": 12
            }]
        }"#;
        let set = parse_insights(raw, &topics()).unwrap();
        let insight = &set["significant_traffic_changes"][0];
        assert_eq!(insight.change_absolute, None);
        assert_eq!(insight.change_percentage, None);
        // Missing topic becomes an empty list
        assert!(set["significant_keyword_changes"].is_empty());
    }

    #[test]
    fn parse_rejects_malformed_output() {
        assert!(matches!(parse_insights("not json", &topics()), Err(GenerationError::InvalidJson(_))));
        assert!(matches!(parse_insights("[1, 2]", &topics()), Err(GenerationError::Shape(_))));
        assert!(matches!(
            parse_insights(r#"{"significant_traffic_changes": "lots"}"#, &topics()),
            Err(GenerationError::Shape(_))
        ));
        assert!(matches!(
            parse_insights(r#"{"significant_traffic_changes": [{"details": "no description"}]}"#, &topics()),
            Err(GenerationError::Shape(_))
        ));
    }

    #[test]
    fn parse_rejects_insight_without_required_fields() {
        let unscored = r#"{"significant_traffic_changes": [
            {"description": "Sessions grew", "details": "", "current_value": 120, "prior_value": 80}
        ]}"#;
        match parse_insights(unscored, &topics()) {
            Err(GenerationError::Shape(message)) => assert!(message.contains("importance_score")),
            other => panic!("expected shape error, got {other:?}"),
        }

        let null_details = r#"{"significant_traffic_changes": [
            {"description": "Sessions grew", "details": null, "importance_score": 60}
        ]}"#;
        assert!(matches!(parse_insights(null_details, &topics()), Err(GenerationError::Shape(_))));

        let no_values = r#"{"significant_traffic_changes": [
            {"description": "New referrer", "details": "", "importance_score": 60, "current_value": null}
        ]}"#;
        assert!(parse_insights(no_values, &topics()).is_ok());
    }

    #[tokio::test]
    async fn generate_surfaces_oracle_failure() {
        let oracle = CannedOracle(Err(()));
        let current = snapshot("https://a.example/", "2024-06-01", "2024-06-30", 120);
        let prior = snapshot("https://a.example/", "2024-05-01", "2024-05-31", 80);

        let err = generate(&oracle, &current, &prior, &topics()).await.unwrap_err();
        assert!(matches!(err, GenerationError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn generate_returns_normalized_set() {
        let oracle = CannedOracle(Ok(r#"{
            "significant_traffic_changes": [{"description": "Up", "details": "", "importance_score": 70,
                "current_value": 10, "prior_value": 0}],
            "significant_keyword_changes": []
        }"#
        .to_string()));
        let current = snapshot("https://a.example/", "2024-06-01", "2024-06-30", 10);
        let prior = snapshot("https://a.example/", "2024-05-01", "2024-05-31", 0);

        let set = generate(&oracle, &current, &prior, &topics()).await.unwrap();
        assert_eq!(set["significant_traffic_changes"][0].change_percentage, Some(100.0));
    }
}
