use crate::llm_adapter::LlmAdapter;
use crate::store::ContentStore;
use crate::types::{
    ClusterCandidate, ClusterRequest, ClusterResponse, DuplicateGroup, IssueId, Item, ItemId, Result,
};
use crate::utils::text::candidate_summary;
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Groups near-duplicate items by topic through the clustering oracle.
///
/// Deduplication fails open: an oracle error or an unusable reply means
/// "no duplicates", never a blocked pipeline.
pub struct DedupEngine {
    oracle: Arc<dyn LlmAdapter>,
    summary_chars: usize,
}

impl DedupEngine {
    pub fn new(oracle: Arc<dyn LlmAdapter>, summary_chars: usize) -> Self {
        Self { oracle, summary_chars }
    }

    pub async fn deduplicate(&self, issue_id: IssueId, items: &[Item]) -> Vec<DuplicateGroup> {
        if items.len() < 2 {
            return Vec::new();
        }

        let request = ClusterRequest {
            items: items
                .iter()
                .enumerate()
                .map(|(index, item)| ClusterCandidate {
                    index,
                    summary: candidate_summary(&item.title, &item.body, self.summary_chars),
                })
                .collect(),
        };

        let response = match self.oracle.cluster(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Clustering failed for issue {}, treating batch as unique: {}", issue_id, e);
                return Vec::new();
            }
        };

        let groups = sanitize_groups(issue_id, items, response);
        info!(
            "Issue {}: {} duplicate groups suppressing {} items",
            issue_id,
            groups.len(),
            groups.iter().map(|g| g.suppressed_item_ids.len()).sum::<usize>()
        );
        groups
    }

    /// Deduplicates and replaces the issue's stored groups.
    pub async fn run(&self, store: &dyn ContentStore, issue_id: IssueId, items: &[Item]) -> Result<Vec<DuplicateGroup>> {
        let groups = self.deduplicate(issue_id, items).await;
        store.replace_duplicate_groups(issue_id, &groups).await?;
        Ok(groups)
    }
}

/// Turns an oracle reply into groups that respect membership rules: indices
/// in range, the primary never suppressed, every item in at most one group.
/// The oracle's primary choice is kept as given.
pub fn sanitize_groups(issue_id: IssueId, items: &[Item], response: ClusterResponse) -> Vec<DuplicateGroup> {
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut signatures: HashSet<String> = HashSet::new();
    let mut groups = Vec::new();

    for (n, group) in response.groups.into_iter().enumerate() {
        let primary = group.primary_index;
        if primary >= items.len() {
            debug!("Dropping group with out-of-range primary {}", primary);
            continue;
        }
        if claimed.contains(&primary) {
            debug!("Dropping group whose primary {} is already grouped", primary);
            continue;
        }

        let mut duplicates = BTreeSet::new();
        for index in group.duplicate_indices {
            if index < items.len() && index != primary && !claimed.contains(&index) {
                duplicates.insert(index);
            }
        }
        if duplicates.is_empty() {
            continue;
        }

        claimed.insert(primary);
        claimed.extend(duplicates.iter().copied());

        let base = match group.topic_signature.trim() {
            "" => format!("topic {}", n + 1),
            trimmed => trimmed.to_string(),
        };
        let mut signature = base.clone();
        let mut suffix = 2;
        while !signatures.insert(signature.clone()) {
            signature = format!("{} ({})", base, suffix);
            suffix += 1;
        }

        groups.push(DuplicateGroup {
            id: Uuid::new_v4(),
            issue_id,
            topic_signature: signature,
            primary_item_id: items[primary].id,
            suppressed_item_ids: duplicates.into_iter().map(|i| items[i].id).collect(),
            explanation: group.explanation,
            created_at: Utc::now(),
        });
    }

    groups
}

pub fn is_suppressed(item_id: &ItemId, groups: &[DuplicateGroup]) -> bool {
    groups.iter().any(|g| g.suppresses(item_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_adapter::MockLlmAdapter;
    use crate::types::{ClusterGroup, SectionAffinity};

    fn items(count: usize) -> Vec<Item> {
        (0..count)
            .map(|n| Item {
                id: Uuid::new_v4(),
                feed_id: Uuid::new_v4(),
                url: format!("https://example.com/{}", n),
                title: format!("Story {}", n),
                body: "Same body".to_string(),
                full_text: None,
                media_url: None,
                published_at: None,
                section: SectionAffinity::Both,
                issue_id: None,
                archived: false,
                created_at: Utc::now(),
            })
            .collect()
    }

    fn group(signature: &str, primary: usize, duplicates: &[usize]) -> ClusterGroup {
        ClusterGroup {
            topic_signature: signature.to_string(),
            primary_index: primary,
            duplicate_indices: duplicates.to_vec(),
            explanation: String::new(),
        }
    }

    #[test]
    fn sanitize_enforces_membership_rules() {
        let items = items(6);
        let issue = Uuid::new_v4();
        let response = ClusterResponse {
            groups: vec![
                group("rates", 0, &[0, 1, 2, 99]),
                group("rates", 3, &[1, 4]),
                group("late", 2, &[5]),
                group("empty", 5, &[5]),
            ],
        };

        let groups = sanitize_groups(issue, &items, response);
        assert_eq!(groups.len(), 2);

        assert_eq!(groups[0].primary_item_id, items[0].id);
        assert_eq!(groups[0].suppressed_item_ids, BTreeSet::from([items[1].id, items[2].id]));
        assert_eq!(groups[1].topic_signature, "rates (2)");
        assert_eq!(groups[1].suppressed_item_ids, BTreeSet::from([items[4].id]));

        for group in &groups {
            assert!(!group.suppresses(&group.primary_item_id));
        }
        let mut seen = HashSet::new();
        for group in &groups {
            assert!(seen.insert(group.primary_item_id));
            for id in &group.suppressed_item_ids {
                assert!(seen.insert(*id));
            }
        }

        assert!(!is_suppressed(&items[5].id, &groups));
        assert!(!is_suppressed(&items[0].id, &groups));
        assert!(is_suppressed(&items[2].id, &groups));
    }

    #[tokio::test]
    async fn oracle_failure_means_no_duplicates() {
        let engine = DedupEngine::new(Arc::new(MockLlmAdapter::new("dedup").failing_cluster("boom")), 300);
        let items = items(3);
        let groups = engine.deduplicate(Uuid::new_v4(), &items).await;
        assert!(groups.is_empty());
        assert!(items.iter().all(|i| !is_suppressed(&i.id, &groups)));
    }

    #[tokio::test]
    async fn engine_discards_out_of_range_reply() {
        let reply = ClusterResponse {
            groups: vec![group("ghost", 7, &[0]), group("pair", 1, &[1, 2, 42])],
        };
        let engine = DedupEngine::new(Arc::new(MockLlmAdapter::new("dedup").with_raw_clusters(reply)), 300);
        let items = items(3);

        let groups = engine.deduplicate(Uuid::new_v4(), &items).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].primary_item_id, items[1].id);
        assert_eq!(groups[0].suppressed_item_ids, BTreeSet::from([items[2].id]));
        assert!(!is_suppressed(&items[0].id, &groups));
    }

    #[tokio::test]
    async fn oracle_primary_is_authoritative() {
        let engine = DedupEngine::new(
            Arc::new(MockLlmAdapter::new("dedup").with_duplicate_group("merger", "Story 2", &["Story 0", "Story 1"])),
            300,
        );
        let items = items(3);
        let groups = engine.deduplicate(Uuid::new_v4(), &items).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].primary_item_id, items[2].id);
        assert!(is_suppressed(&items[0].id, &groups));
        assert!(is_suppressed(&items[1].id, &groups));
    }
}
