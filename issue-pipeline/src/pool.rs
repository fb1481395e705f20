//! Content pool operations: binding pool items to an issue, returning unused
//! ones, and archiving stale ones.
//!
//! Every binding change is a per-item compare-and-swap. A conflict on one
//! item is logged and skipped; the rest of the batch continues.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::store::ContentStore;
use crate::types::{IssueId, ItemId, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    pub bound: Vec<ItemId>,
    /// Items that were no longer in the pool when the swap ran.
    pub conflicts: Vec<ItemId>,
}

pub async fn bind_items_to_issue(
    store: &dyn ContentStore,
    issue_id: IssueId,
    item_ids: &[ItemId],
) -> Result<BindReport> {
    let mut report = BindReport::default();

    for &item_id in item_ids {
        match store.swap_item_binding(item_id, None, Some(issue_id)).await {
            Ok(true) => report.bound.push(item_id),
            Ok(false) => {
                debug!("Item {} left the pool before binding to {}", item_id, issue_id);
                report.conflicts.push(item_id);
            }
            Err(e) => {
                warn!("Failed to bind item {} to issue {}: {}", item_id, issue_id, e);
                report.conflicts.push(item_id);
            }
        }
    }

    info!(
        "Bound {} items to issue {} ({} conflicts)",
        report.bound.len(),
        issue_id,
        report.conflicts.len()
    );
    Ok(report)
}

/// Binds every current pool item to the issue.
pub async fn bind_pool_to_issue(store: &dyn ContentStore, issue_id: IssueId) -> Result<BindReport> {
    let ids: Vec<ItemId> = store.list_pool_items().await?.iter().map(|i| i.id).collect();
    bind_items_to_issue(store, issue_id, &ids).await
}

/// Returns every item bound to the issue but not in `consumed` to the pool.
/// Running it again with the same `consumed` set is a no-op.
pub async fn reclaim_unbound_items(
    store: &dyn ContentStore,
    issue_id: IssueId,
    consumed: &HashSet<ItemId>,
) -> Result<Vec<ItemId>> {
    let mut reclaimed = Vec::new();

    for item in store.list_issue_items(issue_id).await? {
        if consumed.contains(&item.id) {
            continue;
        }
        match store.swap_item_binding(item.id, Some(issue_id), None).await {
            Ok(true) => reclaimed.push(item.id),
            Ok(false) => debug!("Item {} already left issue {}", item.id, issue_id),
            Err(e) => warn!("Failed to reclaim item {} from issue {}: {}", item.id, issue_id, e),
        }
    }

    if !reclaimed.is_empty() {
        info!("Reclaimed {} items from issue {} to the pool", reclaimed.len(), issue_id);
    }
    Ok(reclaimed)
}

/// Soft-deletes pool items older than `older_than`.
pub async fn archive_stale_items(
    store: &dyn ContentStore,
    older_than: Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let archived = store.archive_pool_items_before(now - older_than).await?;
    if archived > 0 {
        info!(
            "Archived {} pool items older than {}",
            archived,
            crate::utils::time::format_duration(older_than)
        );
    }
    Ok(archived)
}
