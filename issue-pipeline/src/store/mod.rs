//! Durable state behind every phase: feeds, items, ratings, duplicate
//! groups, assignments, articles and issues.
//!
//! Item binding writes are per item and last-writer-wins; nothing here opens
//! a transaction spanning unrelated items.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::types::{
    Article, DuplicateGroup, FeedRecord, FetchResult, Issue, IssueId, Item, ItemId,
    Rating, Result, Section, SectionAffinity, SectionAssignment,
};
use crate::workflow::{IssueGuard, IssueStatus};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ContentStore: Send + Sync {
    // Feeds

    /// Returns the feed record for `url`, creating it on first sight.
    async fn upsert_feed(&self, url: &str, section: SectionAffinity) -> Result<FeedRecord>;

    async fn record_fetch_result(&self, result: &FetchResult) -> Result<()>;

    // Items

    /// Inserts unless an item with the same `(feed_id, url)` exists.
    async fn insert_item_if_new(&self, item: &Item) -> Result<bool>;

    async fn get_item(&self, id: ItemId) -> Result<Item>;

    /// Unbound, unarchived items.
    async fn list_pool_items(&self) -> Result<Vec<Item>>;

    async fn list_issue_items(&self, issue_id: IssueId) -> Result<Vec<Item>>;

    /// Sets the item's binding to `new` only if it currently equals
    /// `expected` and the item is not archived. Returns whether it changed.
    async fn swap_item_binding(
        &self,
        item_id: ItemId,
        expected: Option<IssueId>,
        new: Option<IssueId>,
    ) -> Result<bool>;

    /// Archives pool items published (or ingested) before `cutoff`.
    async fn archive_pool_items_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    // Ratings

    async fn upsert_rating(&self, rating: &Rating) -> Result<()>;

    async fn get_ratings(&self, item_ids: &[ItemId]) -> Result<HashMap<ItemId, Rating>>;

    // Duplicate groups

    /// Replaces every group recorded for the issue.
    async fn replace_duplicate_groups(&self, issue_id: IssueId, groups: &[DuplicateGroup]) -> Result<()>;

    async fn list_duplicate_groups(&self, issue_id: IssueId) -> Result<Vec<DuplicateGroup>>;

    // Section assignments

    async fn replace_section_assignments(
        &self,
        issue_id: IssueId,
        section: Section,
        assignments: &[SectionAssignment],
    ) -> Result<()>;

    async fn clear_section_assignments(&self, issue_id: IssueId) -> Result<()>;

    /// All assignments of the issue ordered by section, then rank.
    async fn list_section_assignments(&self, issue_id: IssueId) -> Result<Vec<SectionAssignment>>;

    // Articles

    async fn insert_article(&self, article: &Article) -> Result<()>;

    /// Soft-deactivates the issue's active articles, returning how many.
    async fn deactivate_articles(&self, issue_id: IssueId) -> Result<usize>;

    async fn list_articles(&self, issue_id: IssueId, active_only: bool) -> Result<Vec<Article>>;

    // Issues

    /// Inserts unless an unsent issue already exists for the same
    /// publication and date.
    async fn insert_issue_if_none_open(&self, issue: &Issue) -> Result<bool>;

    async fn get_issue(&self, id: IssueId) -> Result<Issue>;

    async fn list_issues_with_status(&self, status: IssueStatus) -> Result<Vec<Issue>>;

    /// Writes `updated` only if the stored issue satisfies `guard`.
    async fn compare_and_swap_issue(&self, guard: &IssueGuard, updated: &Issue) -> Result<bool>;
}
