use crate::config::SectionConfig;
use crate::llm_adapter::LlmAdapter;
use crate::store::ContentStore;
use crate::types::{Article, GenerateRequest, IssueId, Item, ItemId, Result, Section, SectionAssignment};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct GenerationReport {
    pub articles: Vec<Article>,
    pub deactivated: usize,
    pub failed: Vec<(ItemId, String)>,
}

/// Turns assigned items into issue-ready articles through the generation oracle.
pub struct ArticleGenerator {
    oracle: Arc<dyn LlmAdapter>,
    max_concurrency: usize,
    max_item_chars: usize,
    subject_style: String,
}

impl ArticleGenerator {
    pub fn new(
        oracle: Arc<dyn LlmAdapter>,
        max_concurrency: usize,
        max_item_chars: usize,
        subject_style: String,
    ) -> Self {
        Self {
            oracle,
            max_concurrency: max_concurrency.max(1),
            max_item_chars,
            subject_style,
        }
    }

    pub async fn generate_article(&self, item: &Item, assignment: &SectionAssignment, style: &str) -> Result<Article> {
        let request = GenerateRequest {
            item_text: item.oracle_text(self.max_item_chars),
            instructions: style.to_string(),
        };
        let response = self.oracle.generate(&request).await?;

        Ok(Article {
            id: Uuid::new_v4(),
            issue_id: assignment.issue_id,
            item_id: item.id,
            section: assignment.section,
            rank: assignment.rank,
            headline: response.headline.trim().to_string(),
            body: response.body.trim().to_string(),
            active: true,
            created_at: Utc::now(),
        })
    }

    /// Deactivates the issue's current articles, then generates one per
    /// assignment. A failed item is logged and skipped.
    pub async fn generate_for_issue(
        &self,
        store: &dyn ContentStore,
        issue_id: IssueId,
        sections: &[SectionConfig],
    ) -> Result<GenerationReport> {
        let mut report = GenerationReport {
            deactivated: store.deactivate_articles(issue_id).await?,
            ..GenerationReport::default()
        };

        let assignments = store.list_section_assignments(issue_id).await?;
        let mut work = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            match store.get_item(assignment.item_id).await {
                Ok(item) if item.issue_id == Some(issue_id) => {
                    let style = sections
                        .iter()
                        .find(|s| s.section == assignment.section)
                        .map(|s| s.style.clone())
                        .unwrap_or_default();
                    work.push((item, assignment, style));
                }
                Ok(_) => {
                    warn!("Item {} is no longer bound to issue {}", assignment.item_id, issue_id);
                    report.failed.push((assignment.item_id, "item no longer bound".to_string()));
                }
                Err(e) => report.failed.push((assignment.item_id, e.to_string())),
            }
        }

        let outcomes: Vec<(ItemId, Result<Article>)> = stream::iter(work)
            .map(move |(item, assignment, style): (Item, SectionAssignment, String)| async move {
                let article = self.generate_article(&item, &assignment, &style).await;
                (item.id, article)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (item_id, outcome) in outcomes {
            let stored = match outcome {
                Ok(article) => match store.insert_article(&article).await {
                    Ok(()) => Ok(article),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match stored {
                Ok(article) => report.articles.push(article),
                Err(e) => {
                    warn!("No article for item {}: {}", item_id, e);
                    report.failed.push((item_id, e.to_string()));
                }
            }
        }

        report
            .articles
            .sort_by(|a, b| a.section.cmp(&b.section).then(a.rank.cmp(&b.rank)));
        info!(
            "Issue {}: generated {} articles, {} failed, {} deactivated",
            issue_id,
            report.articles.len(),
            report.failed.len(),
            report.deactivated
        );
        Ok(report)
    }

    /// Subject line from the primary section's headlines. Falls back to the
    /// top headline when the oracle fails.
    pub async fn generate_subject(&self, articles: &[Article]) -> Option<String> {
        let mut headlines: Vec<&Article> = articles.iter().filter(|a| a.section == Section::Primary).collect();
        if headlines.is_empty() {
            headlines = articles.iter().collect();
        }
        headlines.sort_by_key(|a| a.rank);
        let top = headlines.first()?.headline.clone();

        let listing = headlines
            .iter()
            .map(|a| format!("- {}", a.headline))
            .collect::<Vec<_>>()
            .join("\n");
        let request = GenerateRequest {
            item_text: format!("Title: {}\n\nHeadlines:\n{}", top, listing),
            instructions: self.subject_style.clone(),
        };

        match self.oracle.generate(&request).await {
            Ok(response) if !response.headline.trim().is_empty() => Some(response.headline.trim().to_string()),
            Ok(_) => Some(top),
            Err(e) => {
                warn!("Subject generation failed, using top headline: {}", e);
                Some(top)
            }
        }
    }
}
