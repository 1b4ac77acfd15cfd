use tracing::{debug, warn};

use crate::models::{AggregatedReport, Insight, Topic, TopicInsights, UrlInsights};

/// Merge per-URL insight sets into one ranked report.
///
/// Per topic: keep insights whose absolute change meets the threshold (inclusive),
/// tag them with their URL, order by importance (stable, so ties keep discovery
/// order) and keep the first `max_insights`. Topics do not interact.
pub fn aggregate(
    per_url: &[UrlInsights],
    topics: &[Topic],
    significance_threshold: f64,
    max_insights: usize,
) -> AggregatedReport {
    let by_topic = topics
        .iter()
        .map(|topic| TopicInsights {
            topic: topic.clone(),
            insights: rank_topic(per_url, topic, significance_threshold, max_insights),
        })
        .collect();

    AggregatedReport {
        total_urls_analyzed: per_url.len(),
        by_topic,
    }
}

fn rank_topic(per_url: &[UrlInsights], topic: &Topic, threshold: f64, max_insights: usize) -> Vec<Insight> {
    let mut kept = Vec::new();
    let mut seen = 0usize;

    for entry in per_url {
        let Some(insights) = entry.insights.get(&topic.key) else {
            continue;
        };
        for insight in insights {
            seen += 1;
            let Some(change) = insight.change_absolute else {
                warn!(
                    url = %entry.url,
                    topic = %topic.key,
                    description = %insight.description,
                    "dropping insight without change values"
                );
                continue;
            };
            if change.abs() >= threshold {
                kept.push(Insight {
                    url: Some(entry.url.clone()),
                    ..insight.clone()
                });
            }
        }
    }

    kept.sort_by(|a, b| b.importance_score.total_cmp(&a.importance_score));
    kept.truncate(max_insights);

    debug!(topic = %topic.key, seen, kept = kept.len(), "topic aggregated");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insights::change_percentage;
    use crate::models::InsightSet;

    fn traffic() -> Topic {
        Topic::new("Significant traffic changes")
    }

    fn insight(description: &str, current: f64, prior: f64, importance: f64) -> Insight {
        Insight {
            topic: traffic().key,
            description: description.to_string(),
            details: String::new(),
            current_value: Some(current),
            prior_value: Some(prior),
            change_absolute: Some(current - prior),
            change_percentage: Some(change_percentage(current, prior)),
            importance_score: importance,
            url: None,
        }
    }

    fn entry(url: &str, insights: Vec<Insight>) -> UrlInsights {
        UrlInsights {
            url: url.to_string(),
            insights: InsightSet::from([(traffic().key, insights)]),
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        let per_url = vec![entry(
            "https://a.example/",
            vec![insight("below", 24.0, 0.0, 90.0), insight("at", 25.0, 0.0, 80.0)],
        )];
        let report = aggregate(&per_url, &[traffic()], 25.0, 5);
        let kept = &report.by_topic[0].insights;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].description, "at");
    }

    #[test]
    fn threshold_applies_to_absolute_change() {
        let per_url = vec![entry(
            "https://a.example/",
            vec![
                // +300% on a tiny base
                insight("tiny base", 4.0, 1.0, 90.0),
                // +2% on a huge base
                insight("huge base", 10200.0, 10000.0, 50.0),
                // large drop
                insight("drop", 10.0, 100.0, 60.0),
            ],
        )];
        let report = aggregate(&per_url, &[traffic()], 25.0, 5);
        let descriptions: Vec<&str> = report.by_topic[0].insights.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(descriptions, vec!["drop", "huge base"]);
    }

    #[test]
    fn truncates_to_top_importance_with_stable_ties() {
        let scores = [10.0, 70.0, 50.0, 70.0, 90.0, 30.0, 50.0, 20.0];
        let per_url: Vec<UrlInsights> = scores
            .iter()
            .enumerate()
            .map(|(i, score)| entry(&format!("https://u{i}.example/"), vec![insight(&format!("i{i}"), 100.0, 0.0, *score)]))
            .collect();

        let report = aggregate(&per_url, &[traffic()], 25.0, 5);
        let kept = &report.by_topic[0].insights;
        assert_eq!(kept.len(), 5);
        let order: Vec<&str> = kept.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(order, vec!["i4", "i1", "i3", "i2", "i6"]);
        assert_eq!(kept[0].url.as_deref(), Some("https://u4.example/"));
    }

    #[test]
    fn drops_insights_without_changes() {
        let mut missing = insight("no prior", 50.0, 0.0, 99.0);
        missing.prior_value = None;
        missing.change_absolute = None;
        missing.change_percentage = None;
        let per_url = vec![entry("https://a.example/", vec![missing, insight("ok", 50.0, 0.0, 10.0)])];

        let report = aggregate(&per_url, &[traffic()], 25.0, 5);
        assert_eq!(report.by_topic[0].insights.len(), 1);
        assert_eq!(report.by_topic[0].insights[0].description, "ok");
    }

    #[test]
    fn counts_urls_without_surviving_insights() {
        let per_url = vec![
            entry("https://a.example/", vec![insight("sessions", 120.0, 80.0, 70.0)]),
            entry("https://b.example/", vec![insight("sessions", 10.0, 10.0, 70.0)]),
        ];
        let report = aggregate(&per_url, &[traffic()], 25.0, 5);
        assert_eq!(report.total_urls_analyzed, 2);
        let kept = &report.by_topic[0].insights;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].url.as_deref(), Some("https://a.example/"));
        assert_eq!(kept[0].change_percentage, Some(50.0));
    }

    #[test]
    fn empty_input_yields_empty_topics() {
        let topics = vec![traffic(), Topic::new("Significant keyword changes")];
        let report = aggregate(&[], &topics, 25.0, 5);
        assert_eq!(report.total_urls_analyzed, 0);
        assert_eq!(report.by_topic.len(), 2);
        assert!(report.by_topic.iter().all(|t| t.insights.is_empty()));
    }
}
