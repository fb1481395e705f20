use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ContentStore;
use crate::types::{
    Article, DuplicateGroup, FeedRecord, FetchResult, Issue, IssueId, Item, ItemId, PipelineError,
    Rating, Result, Section, SectionAffinity, SectionAssignment,
};
use crate::workflow::{IssueGuard, IssueStatus};

#[derive(Default)]
struct Tables {
    feeds: HashMap<Uuid, FeedRecord>,
    items: HashMap<ItemId, Item>,
    ratings: HashMap<ItemId, Rating>,
    groups: HashMap<IssueId, Vec<DuplicateGroup>>,
    assignments: HashMap<(IssueId, Section), Vec<SectionAssignment>>,
    articles: Vec<Article>,
    issues: HashMap<IssueId, Issue>,
}

/// Process-local store with the same semantics as the Postgres one.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_created(mut items: Vec<Item>) -> Vec<Item> {
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    items
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn upsert_feed(&self, url: &str, section: SectionAffinity) -> Result<FeedRecord> {
        let mut tables = self.tables.write().await;
        if let Some(feed) = tables.feeds.values_mut().find(|f| f.url == url) {
            feed.section = section;
            return Ok(feed.clone());
        }
        let feed = FeedRecord::new(url, section);
        tables.feeds.insert(feed.id, feed.clone());
        Ok(feed)
    }

    async fn record_fetch_result(&self, result: &FetchResult) -> Result<()> {
        let mut tables = self.tables.write().await;
        let feed = tables
            .feeds
            .get_mut(&result.feed_id)
            .ok_or_else(|| PipelineError::General(format!("Feed not found: {}", result.feed_id)))?;

        feed.last_fetch_time = Some(result.fetch_time);
        if result.success {
            feed.last_successful_fetch = Some(result.fetch_time);
            feed.error_count = 0;
            feed.last_error = None;
            feed.etag = result.etag.clone();
            feed.last_modified = result.last_modified.clone();
        } else {
            feed.error_count += 1;
            feed.last_error = result.error.clone();
        }
        Ok(())
    }

    async fn insert_item_if_new(&self, item: &Item) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let exists = tables
            .items
            .values()
            .any(|existing| existing.feed_id == item.feed_id && existing.url == item.url);
        if exists {
            return Ok(false);
        }
        tables.items.insert(item.id, item.clone());
        Ok(true)
    }

    async fn get_item(&self, id: ItemId) -> Result<Item> {
        let tables = self.tables.read().await;
        tables
            .items
            .get(&id)
            .cloned()
            .ok_or(PipelineError::ItemNotFound { id })
    }

    async fn list_pool_items(&self) -> Result<Vec<Item>> {
        let tables = self.tables.read().await;
        let items = tables.items.values().filter(|i| i.is_in_pool()).cloned().collect();
        Ok(sorted_by_created(items))
    }

    async fn list_issue_items(&self, issue_id: IssueId) -> Result<Vec<Item>> {
        let tables = self.tables.read().await;
        let items = tables
            .items
            .values()
            .filter(|i| i.issue_id == Some(issue_id))
            .cloned()
            .collect();
        Ok(sorted_by_created(items))
    }

    async fn swap_item_binding(
        &self,
        item_id: ItemId,
        expected: Option<IssueId>,
        new: Option<IssueId>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let item = tables
            .items
            .get_mut(&item_id)
            .ok_or(PipelineError::ItemNotFound { id: item_id })?;
        if item.archived || item.issue_id != expected {
            return Ok(false);
        }
        item.issue_id = new;
        Ok(true)
    }

    async fn archive_pool_items_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let mut archived = 0;
        for item in tables.items.values_mut() {
            let stamp = item.published_at.unwrap_or(item.created_at);
            if item.is_in_pool() && stamp < cutoff {
                item.archived = true;
                archived += 1;
            }
        }
        Ok(archived)
    }

    async fn upsert_rating(&self, rating: &Rating) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.ratings.insert(rating.item_id, rating.clone());
        Ok(())
    }

    async fn get_ratings(&self, item_ids: &[ItemId]) -> Result<HashMap<ItemId, Rating>> {
        let tables = self.tables.read().await;
        Ok(item_ids
            .iter()
            .filter_map(|id| tables.ratings.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn replace_duplicate_groups(&self, issue_id: IssueId, groups: &[DuplicateGroup]) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.groups.insert(issue_id, groups.to_vec());
        Ok(())
    }

    async fn list_duplicate_groups(&self, issue_id: IssueId) -> Result<Vec<DuplicateGroup>> {
        let tables = self.tables.read().await;
        Ok(tables.groups.get(&issue_id).cloned().unwrap_or_default())
    }

    async fn replace_section_assignments(
        &self,
        issue_id: IssueId,
        section: Section,
        assignments: &[SectionAssignment],
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.assignments.insert((issue_id, section), assignments.to_vec());
        Ok(())
    }

    async fn clear_section_assignments(&self, issue_id: IssueId) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.assignments.retain(|(id, _), _| *id != issue_id);
        Ok(())
    }

    async fn list_section_assignments(&self, issue_id: IssueId) -> Result<Vec<SectionAssignment>> {
        let tables = self.tables.read().await;
        let mut assignments: Vec<SectionAssignment> = tables
            .assignments
            .iter()
            .filter(|((id, _), _)| *id == issue_id)
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        assignments.sort_by(|a, b| a.section.cmp(&b.section).then(a.rank.cmp(&b.rank)));
        Ok(assignments)
    }

    async fn insert_article(&self, article: &Article) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.articles.push(article.clone());
        Ok(())
    }

    async fn deactivate_articles(&self, issue_id: IssueId) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let mut count = 0;
        for article in tables.articles.iter_mut() {
            if article.issue_id == issue_id && article.active {
                article.active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_articles(&self, issue_id: IssueId, active_only: bool) -> Result<Vec<Article>> {
        let tables = self.tables.read().await;
        let mut articles: Vec<Article> = tables
            .articles
            .iter()
            .filter(|a| a.issue_id == issue_id && (a.active || !active_only))
            .cloned()
            .collect();
        articles.sort_by(|a, b| a.section.cmp(&b.section).then(a.rank.cmp(&b.rank)));
        Ok(articles)
    }

    async fn insert_issue_if_none_open(&self, issue: &Issue) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let open = tables.issues.values().any(|existing| {
            existing.publication_id == issue.publication_id
                && existing.target_date == issue.target_date
                && existing.status != IssueStatus::Sent
        });
        if open {
            return Ok(false);
        }
        tables.issues.insert(issue.id, issue.clone());
        Ok(true)
    }

    async fn get_issue(&self, id: IssueId) -> Result<Issue> {
        let tables = self.tables.read().await;
        tables
            .issues
            .get(&id)
            .cloned()
            .ok_or(PipelineError::IssueNotFound { id })
    }

    async fn list_issues_with_status(&self, status: IssueStatus) -> Result<Vec<Issue>> {
        let tables = self.tables.read().await;
        Ok(tables.issues.values().filter(|i| i.status == status).cloned().collect())
    }

    async fn compare_and_swap_issue(&self, guard: &IssueGuard, updated: &Issue) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let current = tables
            .issues
            .get_mut(&updated.id)
            .ok_or(PipelineError::IssueNotFound { id: updated.id })?;
        if !guard.matches(current) {
            return Ok(false);
        }
        *current = updated.clone();
        Ok(true)
    }
}
