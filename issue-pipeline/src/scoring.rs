use crate::config::SectionConfig;
use crate::llm_adapter::LlmAdapter;
use crate::store::ContentStore;
use crate::types::{
    Criterion, CriterionScore, Item, ItemId, OracleCriterion, PipelineError, Rating, Result,
    ScoreRequest, Section, SectionAffinity, MAX_CRITERION_SCORE, MIN_CRITERION_SCORE,
};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ScoringReport {
    pub scored: usize,
    /// Items whose existing rating was made under the current criteria.
    pub already_rated: usize,
    pub failed: Vec<(ItemId, String)>,
}

/// Rates items against weighted multi-criteria rubrics through the scoring oracle.
///
/// Scoring fails closed: an oracle error or a malformed answer leaves the item
/// without a rating, which keeps it out of assignment.
pub struct ScoringEngine {
    oracle: Arc<dyn LlmAdapter>,
    max_concurrency: usize,
    max_item_chars: usize,
}

impl ScoringEngine {
    pub fn new(oracle: Arc<dyn LlmAdapter>, max_concurrency: usize, max_item_chars: usize) -> Self {
        Self {
            oracle,
            max_concurrency: max_concurrency.max(1),
            max_item_chars,
        }
    }

    pub async fn score_item(&self, item: &Item, criteria: &[Criterion], fingerprint: &str) -> Result<Rating> {
        let request = ScoreRequest {
            item_text: item.oracle_text(self.max_item_chars),
            criteria: criteria.iter().map(OracleCriterion::from).collect(),
        };

        let response = self.oracle.score(&request).await?;

        if response.criteria.len() != criteria.len() {
            return Err(PipelineError::MalformedOracleOutput(format!(
                "expected {} verdicts, got {}",
                criteria.len(),
                response.criteria.len()
            )));
        }

        let mut scores = Vec::with_capacity(criteria.len());
        for (criterion, verdict) in criteria.iter().zip(response.criteria) {
            if !(MIN_CRITERION_SCORE..=MAX_CRITERION_SCORE).contains(&verdict.score) {
                return Err(PipelineError::MalformedOracleOutput(format!(
                    "score {} outside {}..={}",
                    verdict.score, MIN_CRITERION_SCORE, MAX_CRITERION_SCORE
                )));
            }
            scores.push(CriterionScore {
                instruction: criterion.instruction.clone(),
                score: verdict.score as u8,
                weight: criterion.weight,
                rationale: verdict.rationale,
            });
        }

        Ok(Rating::new(item.id, scores, fingerprint.to_string()))
    }

    /// Scores every item that lacks a current rating and persists the results.
    /// Per-item failures are recorded in the report and never abort the batch.
    pub async fn score_items(
        &self,
        store: &dyn ContentStore,
        items: &[Item],
        sections: &[SectionConfig],
    ) -> Result<ScoringReport> {
        let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        let existing = store.get_ratings(&ids).await?;
        let mut report = ScoringReport::default();

        let mut work = Vec::new();
        for item in items {
            let Some(section) = criteria_section(item.section, sections) else {
                report
                    .failed
                    .push((item.id, format!("no section accepts {:?} items", item.section)));
                continue;
            };
            let fingerprint = section.criteria_fingerprint();
            if existing
                .get(&item.id)
                .is_some_and(|r| r.criteria_fingerprint == fingerprint)
            {
                debug!("Item {} already rated under current criteria", item.id);
                report.already_rated += 1;
                continue;
            }
            work.push((item.clone(), section.criteria.clone(), fingerprint));
        }

        let outcomes: Vec<(ItemId, Result<Rating>)> = stream::iter(work)
            .map(move |(item, criteria, fingerprint): (Item, Vec<Criterion>, String)| async move {
                let rating = self.score_item(&item, &criteria, &fingerprint).await;
                (item.id, rating)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (item_id, outcome) in outcomes {
            let stored = match outcome {
                Ok(rating) => store.upsert_rating(&rating).await,
                Err(e) => Err(e),
            };
            match stored {
                Ok(()) => report.scored += 1,
                Err(e) => {
                    warn!("Item {} left unrated: {}", item_id, e);
                    report.failed.push((item_id, e.to_string()));
                }
            }
        }

        info!(
            "Scoring finished: {} scored, {} already rated, {} failed",
            report.scored,
            report.already_rated,
            report.failed.len()
        );
        Ok(report)
    }
}

/// Section whose rubric rates an item. `Both` items use the first configured section.
pub fn criteria_section(affinity: SectionAffinity, sections: &[SectionConfig]) -> Option<&SectionConfig> {
    let wanted = match affinity {
        SectionAffinity::Primary => Some(Section::Primary),
        SectionAffinity::Secondary => Some(Section::Secondary),
        SectionAffinity::Both => None,
    };
    match wanted {
        Some(section) => sections.iter().find(|s| s.section == section),
        None => sections.first(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_adapter::MockLlmAdapter;
    use crate::store::InMemoryStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn item(title: &str, section: SectionAffinity) -> Item {
        Item {
            id: Uuid::new_v4(),
            feed_id: Uuid::new_v4(),
            url: format!("https://example.com/{}", title.replace(' ', "-")),
            title: title.to_string(),
            body: "Body text.".to_string(),
            full_text: None,
            media_url: None,
            published_at: None,
            section,
            issue_id: None,
            archived: false,
            created_at: Utc::now(),
        }
    }

    fn sections() -> Vec<SectionConfig> {
        vec![
            SectionConfig {
                section: Section::Primary,
                limit: 3,
                criteria: vec![
                    Criterion { instruction: "relevance".to_string(), weight: 2.0 },
                    Criterion { instruction: "novelty".to_string(), weight: 1.0 },
                ],
                feeds: Vec::new(),
                style: String::new(),
            },
            SectionConfig {
                section: Section::Secondary,
                limit: 3,
                criteria: vec![Criterion { instruction: "usefulness".to_string(), weight: 1.0 }],
                feeds: Vec::new(),
                style: String::new(),
            },
        ]
    }

    #[tokio::test]
    async fn failures_do_not_abort_batch() {
        let oracle = Arc::new(
            MockLlmAdapter::new("scoring")
                .with_score("A", 8)
                .failing_score("B")
                .malformed_score("C")
                .with_score("D", 11),
        );
        let engine = ScoringEngine::new(oracle, 4, 1000);
        let store = InMemoryStore::new();
        let items = vec![
            item("A", SectionAffinity::Primary),
            item("B", SectionAffinity::Primary),
            item("C", SectionAffinity::Primary),
            item("D", SectionAffinity::Primary),
            item("E", SectionAffinity::Secondary),
        ];

        let report = engine.score_items(&store, &items, &sections()).await.unwrap();
        assert_eq!(report.scored, 2);
        assert_eq!(report.failed.len(), 3);

        let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        let ratings = store.get_ratings(&ids).await.unwrap();
        assert_eq!(ratings.len(), 2);
        assert!((ratings[&items[0].id].total_score() - 8.0).abs() < 1e-9);
        assert_eq!(ratings[&items[0].id].criteria.len(), 2);
        assert_eq!(ratings[&items[4].id].criteria.len(), 1);
        assert!(!ratings.contains_key(&items[1].id));
    }

    #[tokio::test]
    async fn rerun_skips_current_ratings() {
        let oracle = Arc::new(MockLlmAdapter::new("scoring"));
        let engine = ScoringEngine::new(oracle.clone(), 2, 1000);
        let store = InMemoryStore::new();
        let items = vec![item("A", SectionAffinity::Both), item("B", SectionAffinity::Secondary)];

        engine.score_items(&store, &items, &sections()).await.unwrap();
        assert_eq!(oracle.score_calls(), 2);

        let report = engine.score_items(&store, &items, &sections()).await.unwrap();
        assert_eq!(report.already_rated, 2);
        assert_eq!(report.scored, 0);
        assert_eq!(oracle.score_calls(), 2);

        // Changing the rubric makes existing ratings stale.
        let mut changed = sections();
        changed[1].criteria[0].weight = 3.0;
        let report = engine.score_items(&store, &items, &changed).await.unwrap();
        assert_eq!(report.scored, 1);
        assert_eq!(report.already_rated, 1);
    }

    #[tokio::test]
    async fn both_item_is_rated_under_primary_rubric() {
        let engine = ScoringEngine::new(Arc::new(MockLlmAdapter::new("scoring").with_score("A", 6)), 2, 1000);
        let store = InMemoryStore::new();
        let items = vec![item("A", SectionAffinity::Both)];
        let sections = sections();

        engine.score_items(&store, &items, &sections).await.unwrap();
        let ratings = store.get_ratings(&[items[0].id]).await.unwrap();
        let rating = &ratings[&items[0].id];
        assert_eq!(rating.criteria_fingerprint, sections[0].criteria_fingerprint());
        let instructions: Vec<&str> = rating.criteria.iter().map(|c| c.instruction.as_str()).collect();
        assert_eq!(instructions, vec!["relevance", "novelty"]);
    }

    #[test]
    fn both_items_use_first_section() {
        let sections = sections();
        assert_eq!(
            criteria_section(SectionAffinity::Both, &sections).map(|s| s.section),
            Some(Section::Primary)
        );
        assert_eq!(
            criteria_section(SectionAffinity::Secondary, &sections[..1]).map(|s| s.section),
            None
        );
    }
}
