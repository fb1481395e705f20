use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Pool, Postgres, Row};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

use super::ContentStore;
use crate::types::{
    Article, CriterionScore, DuplicateGroup, FeedRecord, FetchResult, Issue, IssueAudit, IssueId,
    Item, ItemId, PipelineError, Rating, Result, Section, SectionAffinity, SectionAssignment,
};
use crate::workflow::{IssueGuard, IssueStatus, Phase, PhaseLease};

pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db = PgPool::connect(database_url).await?;
        Ok(Self { db })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn feed_from_row(row: &PgRow) -> Result<FeedRecord> {
    let section: String = row.try_get("section")?;
    Ok(FeedRecord {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        section: section.parse()?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        last_fetch_time: row.try_get("last_fetch_time")?,
        last_successful_fetch: row.try_get("last_successful_fetch")?,
        error_count: row.try_get::<i32, _>("error_count")?.max(0) as u32,
        last_error: row.try_get("last_error")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item> {
    let section: String = row.try_get("section")?;
    Ok(Item {
        id: row.try_get("id")?,
        feed_id: row.try_get("feed_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        full_text: row.try_get("full_text")?,
        media_url: row.try_get("media_url")?,
        published_at: row.try_get("published_at")?,
        section: section.parse()?,
        issue_id: row.try_get("issue_id")?,
        archived: row.try_get("archived")?,
        created_at: row.try_get("created_at")?,
    })
}

fn rating_from_row(row: &PgRow) -> Result<Rating> {
    let criteria_json: serde_json::Value = row.try_get("criteria")?;
    let criteria: Vec<CriterionScore> = serde_json::from_value(criteria_json)?;
    Ok(Rating::restore(
        row.try_get("item_id")?,
        criteria,
        row.try_get("criteria_fingerprint")?,
        row.try_get("rated_at")?,
    ))
}

fn group_from_row(row: &PgRow) -> Result<DuplicateGroup> {
    let suppressed: Vec<Uuid> = row.try_get("suppressed_item_ids")?;
    Ok(DuplicateGroup {
        id: row.try_get("id")?,
        issue_id: row.try_get("issue_id")?,
        topic_signature: row.try_get("topic_signature")?,
        primary_item_id: row.try_get("primary_item_id")?,
        suppressed_item_ids: suppressed.into_iter().collect::<BTreeSet<_>>(),
        explanation: row.try_get("explanation")?,
        created_at: row.try_get("created_at")?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<SectionAssignment> {
    let section: String = row.try_get("section")?;
    Ok(SectionAssignment {
        issue_id: row.try_get("issue_id")?,
        item_id: row.try_get("item_id")?,
        section: section.parse()?,
        rank: row.try_get::<i32, _>("rank")?.max(0) as u32,
        total_score: row.try_get("total_score")?,
    })
}

fn article_from_row(row: &PgRow) -> Result<Article> {
    let section: String = row.try_get("section")?;
    Ok(Article {
        id: row.try_get("id")?,
        issue_id: row.try_get("issue_id")?,
        item_id: row.try_get("item_id")?,
        section: section.parse()?,
        rank: row.try_get::<i32, _>("rank")?.max(0) as u32,
        headline: row.try_get("headline")?,
        body: row.try_get("body")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn issue_from_row(row: &PgRow) -> Result<Issue> {
    let status: String = row.try_get("status")?;
    let failed_phase: Option<String> = row.try_get("failed_phase")?;
    let attempts = row.try_get::<i32, _>("attempts")?.max(0) as u32;

    let lease_holder: Option<String> = row.try_get("lease_holder")?;
    let lease_phase: Option<String> = row.try_get("lease_phase")?;
    let lease_acquired_at: Option<DateTime<Utc>> = row.try_get("lease_acquired_at")?;
    let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
    let lease = match (lease_holder, lease_phase, lease_acquired_at, lease_expires_at) {
        (Some(holder), Some(phase), Some(acquired_at), Some(expires_at)) => Some(PhaseLease {
            holder,
            phase: phase.parse()?,
            attempt: attempts,
            acquired_at,
            expires_at,
        }),
        _ => None,
    };

    Ok(Issue {
        id: row.try_get("id")?,
        publication_id: row.try_get("publication_id")?,
        target_date: row.try_get("target_date")?,
        status: status.parse()?,
        subject: row.try_get("subject")?,
        failure_reason: row.try_get("failure_reason")?,
        failed_phase: failed_phase.map(|p| p.parse::<Phase>()).transpose()?,
        lease,
        attempts,
        audit: IssueAudit {
            processing_started_at: row.try_get("processing_started_at")?,
            phase2_pending_at: row.try_get("phase2_pending_at")?,
            review_started_at: row.try_get("review_started_at")?,
            changes_made_at: row.try_get("changes_made_at")?,
            ready_at: row.try_get("ready_at")?,
            sent_at: row.try_get("sent_at")?,
            failed_at: row.try_get("failed_at")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ContentStore for PgStore {
    async fn upsert_feed(&self, url: &str, section: SectionAffinity) -> Result<FeedRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO feeds (id, url, section, error_count, created_at)
            VALUES ($1, $2, $3, 0, NOW())
            ON CONFLICT (url) DO UPDATE SET section = EXCLUDED.section
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(url)
        .bind(section.as_str())
        .fetch_one(&self.db)
        .await?;

        feed_from_row(&row)
    }

    async fn record_fetch_result(&self, result: &FetchResult) -> Result<()> {
        if result.success {
            sqlx::query(
                r#"
                UPDATE feeds
                SET last_fetch_time = $1, last_successful_fetch = $1, error_count = 0, last_error = NULL,
                    etag = $2, last_modified = $3
                WHERE id = $4
                "#,
            )
            .bind(result.fetch_time)
            .bind(&result.etag)
            .bind(&result.last_modified)
            .bind(result.feed_id)
            .execute(&self.db)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE feeds
                SET last_fetch_time = $1, error_count = error_count + 1, last_error = $2
                WHERE id = $3
                "#,
            )
            .bind(result.fetch_time)
            .bind(&result.error)
            .bind(result.feed_id)
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    async fn insert_item_if_new(&self, item: &Item) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO items (id, feed_id, url, title, body, full_text, media_url, published_at,
                               section, issue_id, archived, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (feed_id, url) DO NOTHING
            "#,
        )
        .bind(item.id)
        .bind(item.feed_id)
        .bind(&item.url)
        .bind(&item.title)
        .bind(&item.body)
        .bind(&item.full_text)
        .bind(&item.media_url)
        .bind(item.published_at)
        .bind(item.section.as_str())
        .bind(item.issue_id)
        .bind(item.archived)
        .bind(item.created_at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_item(&self, id: ItemId) -> Result<Item> {
        let row = sqlx::query("SELECT * FROM items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => item_from_row(&row),
            None => Err(PipelineError::ItemNotFound { id }),
        }
    }

    async fn list_pool_items(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            "SELECT * FROM items WHERE issue_id IS NULL AND NOT archived ORDER BY created_at, id",
        )
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn list_issue_items(&self, issue_id: IssueId) -> Result<Vec<Item>> {
        let rows = sqlx::query("SELECT * FROM items WHERE issue_id = $1 ORDER BY created_at, id")
            .bind(issue_id)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(item_from_row).collect()
    }

    async fn swap_item_binding(
        &self,
        item_id: ItemId,
        expected: Option<IssueId>,
        new: Option<IssueId>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE items SET issue_id = $2
            WHERE id = $1 AND NOT archived AND issue_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(item_id)
        .bind(new)
        .bind(expected)
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM items WHERE id = $1)")
            .bind(item_id)
            .fetch_one(&self.db)
            .await?;
        if !exists {
            return Err(PipelineError::ItemNotFound { id: item_id });
        }
        Ok(false)
    }

    async fn archive_pool_items_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE items SET archived = TRUE
            WHERE issue_id IS NULL AND NOT archived AND COALESCE(published_at, created_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn upsert_rating(&self, rating: &Rating) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ratings (item_id, criteria, total_score, criteria_fingerprint, rated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (item_id) DO UPDATE SET
                criteria = EXCLUDED.criteria,
                total_score = EXCLUDED.total_score,
                criteria_fingerprint = EXCLUDED.criteria_fingerprint,
                rated_at = EXCLUDED.rated_at
            "#,
        )
        .bind(rating.item_id)
        .bind(serde_json::to_value(&rating.criteria)?)
        .bind(rating.total_score())
        .bind(&rating.criteria_fingerprint)
        .bind(rating.rated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_ratings(&self, item_ids: &[ItemId]) -> Result<HashMap<ItemId, Rating>> {
        let rows = sqlx::query("SELECT * FROM ratings WHERE item_id = ANY($1)")
            .bind(item_ids.to_vec())
            .fetch_all(&self.db)
            .await?;

        let mut ratings = HashMap::new();
        for row in rows {
            let rating = rating_from_row(&row)?;
            ratings.insert(rating.item_id, rating);
        }
        Ok(ratings)
    }

    async fn replace_duplicate_groups(&self, issue_id: IssueId, groups: &[DuplicateGroup]) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM duplicate_groups WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&mut *tx)
            .await?;

        for group in groups {
            let suppressed: Vec<Uuid> = group.suppressed_item_ids.iter().copied().collect();
            sqlx::query(
                r#"
                INSERT INTO duplicate_groups (id, issue_id, topic_signature, primary_item_id,
                                              suppressed_item_ids, explanation, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(group.id)
            .bind(issue_id)
            .bind(&group.topic_signature)
            .bind(group.primary_item_id)
            .bind(suppressed)
            .bind(&group.explanation)
            .bind(group.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Stored {} duplicate groups for issue {}", groups.len(), issue_id);
        Ok(())
    }

    async fn list_duplicate_groups(&self, issue_id: IssueId) -> Result<Vec<DuplicateGroup>> {
        let rows = sqlx::query("SELECT * FROM duplicate_groups WHERE issue_id = $1 ORDER BY created_at")
            .bind(issue_id)
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(group_from_row).collect()
    }

    async fn replace_section_assignments(
        &self,
        issue_id: IssueId,
        section: Section,
        assignments: &[SectionAssignment],
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM section_assignments WHERE issue_id = $1 AND section = $2")
            .bind(issue_id)
            .bind(section.as_str())
            .execute(&mut *tx)
            .await?;

        for assignment in assignments {
            sqlx::query(
                r#"
                INSERT INTO section_assignments (issue_id, item_id, section, rank, total_score)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(issue_id)
            .bind(assignment.item_id)
            .bind(section.as_str())
            .bind(assignment.rank as i32)
            .bind(assignment.total_score)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear_section_assignments(&self, issue_id: IssueId) -> Result<()> {
        sqlx::query("DELETE FROM section_assignments WHERE issue_id = $1")
            .bind(issue_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn list_section_assignments(&self, issue_id: IssueId) -> Result<Vec<SectionAssignment>> {
        let rows = sqlx::query(
            "SELECT * FROM section_assignments WHERE issue_id = $1 ORDER BY section, rank",
        )
        .bind(issue_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(assignment_from_row).collect()
    }

    async fn insert_article(&self, article: &Article) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO articles (id, issue_id, item_id, section, rank, headline, body, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(article.id)
        .bind(article.issue_id)
        .bind(article.item_id)
        .bind(article.section.as_str())
        .bind(article.rank as i32)
        .bind(&article.headline)
        .bind(&article.body)
        .bind(article.active)
        .bind(article.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn deactivate_articles(&self, issue_id: IssueId) -> Result<usize> {
        let result = sqlx::query("UPDATE articles SET active = FALSE WHERE issue_id = $1 AND active")
            .bind(issue_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_articles(&self, issue_id: IssueId, active_only: bool) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM articles
            WHERE issue_id = $1 AND (active OR NOT $2)
            ORDER BY section, rank
            "#,
        )
        .bind(issue_id)
        .bind(active_only)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(article_from_row).collect()
    }

    async fn insert_issue_if_none_open(&self, issue: &Issue) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO issues (id, publication_id, target_date, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(issue.id)
        .bind(&issue.publication_id)
        .bind(issue.target_date)
        .bind(issue.status.as_str())
        .bind(issue.attempts as i32)
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_issue(&self, id: IssueId) -> Result<Issue> {
        let row = sqlx::query("SELECT * FROM issues WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => issue_from_row(&row),
            None => Err(PipelineError::IssueNotFound { id }),
        }
    }

    async fn list_issues_with_status(&self, status: IssueStatus) -> Result<Vec<Issue>> {
        let rows = sqlx::query("SELECT * FROM issues WHERE status = $1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.db)
            .await?;

        rows.iter().map(issue_from_row).collect()
    }

    async fn compare_and_swap_issue(&self, guard: &IssueGuard, updated: &Issue) -> Result<bool> {
        let statuses: Vec<String> = guard.statuses.iter().map(|s| s.as_str().to_string()).collect();
        let lease = updated.lease.as_ref();
        let audit = &updated.audit;

        let result = sqlx::query(
            r#"
            UPDATE issues SET
                status = $2, subject = $3, failure_reason = $4, failed_phase = $5, attempts = $6,
                lease_holder = $7, lease_phase = $8, lease_acquired_at = $9, lease_expires_at = $10,
                processing_started_at = $11, phase2_pending_at = $12, review_started_at = $13,
                changes_made_at = $14, ready_at = $15, sent_at = $16, failed_at = $17,
                updated_at = $18
            WHERE id = $1 AND status = ANY($19) AND ($20::INTEGER IS NULL OR attempts = $20)
            "#,
        )
        .bind(updated.id)
        .bind(updated.status.as_str())
        .bind(&updated.subject)
        .bind(&updated.failure_reason)
        .bind(updated.failed_phase.map(|p| p.as_str()))
        .bind(updated.attempts as i32)
        .bind(lease.map(|l| l.holder.clone()))
        .bind(lease.map(|l| l.phase.as_str()))
        .bind(lease.map(|l| l.acquired_at))
        .bind(lease.map(|l| l.expires_at))
        .bind(audit.processing_started_at)
        .bind(audit.phase2_pending_at)
        .bind(audit.review_started_at)
        .bind(audit.changes_made_at)
        .bind(audit.ready_at)
        .bind(audit.sent_at)
        .bind(audit.failed_at)
        .bind(updated.updated_at)
        .bind(statuses)
        .bind(guard.attempts.map(|a| a as i32))
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish a lost race from a missing row.
        self.get_issue(updated.id).await?;
        Ok(false)
    }
}
