use crate::config::SectionConfig;
use crate::dedup::is_suppressed;
use crate::store::ContentStore;
use crate::types::{IssueId, Item, ItemId, Rating, Result, Section, SectionAffinity, SectionAssignment};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct AssignmentReport {
    pub assignments: Vec<SectionAssignment>,
    pub reclaimed: Vec<ItemId>,
}

impl AssignmentReport {
    pub fn for_section(&self, section: Section) -> impl Iterator<Item = &SectionAssignment> {
        self.assignments.iter().filter(move |a| a.section == section)
    }
}

/// Items eligible for `section`, best first: rated, not suppressed, not
/// already used, with a matching affinity.
pub fn rank_candidates<'a>(
    section: Section,
    items: &'a [Item],
    ratings: &HashMap<ItemId, Rating>,
    suppressed: impl Fn(&ItemId) -> bool,
    used: &HashSet<ItemId>,
) -> Vec<(&'a Item, f64)> {
    let mut ranked: Vec<(&Item, f64)> = items
        .iter()
        .filter(|item| !item.archived && item.section.allows(section))
        .filter(|item| !used.contains(&item.id) && !suppressed(&item.id))
        // An item carries one rating. `Both` items are rated under the first
        // section's rubric and rank by that score in every section.
        .filter_map(|item| ratings.get(&item.id).map(|r| (item, r.total_score())))
        .collect();

    ranked.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

fn exclusive_to(affinity: SectionAffinity, section: Section) -> bool {
    affinity != SectionAffinity::Both && affinity.allows(section)
}

/// Selects the top `limit` items bound to the issue for `section`, records
/// the selection, and returns the section's unselected items to the pool.
/// Items in `used` belong to an earlier section and are skipped.
pub async fn assign_top_items(
    store: &dyn ContentStore,
    issue_id: IssueId,
    section: Section,
    limit: usize,
    used: &HashSet<ItemId>,
) -> Result<(Vec<SectionAssignment>, Vec<ItemId>)> {
    let items = store.list_issue_items(issue_id).await?;
    let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
    let ratings = store.get_ratings(&ids).await?;
    let groups = store.list_duplicate_groups(issue_id).await?;

    let ranked = rank_candidates(section, &items, &ratings, |id| is_suppressed(id, &groups), used);
    let assignments: Vec<SectionAssignment> = ranked
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(rank, (item, total_score))| SectionAssignment {
            issue_id,
            item_id: item.id,
            section,
            rank: rank as u32 + 1,
            total_score,
        })
        .collect();

    store.replace_section_assignments(issue_id, section, &assignments).await?;

    let selected: HashSet<ItemId> = assignments.iter().map(|a| a.item_id).collect();
    let mut reclaimed = Vec::new();
    for item in items.iter().filter(|i| exclusive_to(i.section, section)) {
        if selected.contains(&item.id) || used.contains(&item.id) {
            continue;
        }
        match store.swap_item_binding(item.id, Some(issue_id), None).await {
            Ok(true) => reclaimed.push(item.id),
            Ok(false) => debug!("Item {} already left issue {}", item.id, issue_id),
            Err(e) => warn!("Failed to reclaim item {}: {}", item.id, e),
        }
    }

    info!(
        "Issue {} section {}: assigned {} of limit {}, reclaimed {}",
        issue_id,
        section,
        assignments.len(),
        limit,
        reclaimed.len()
    );
    Ok((assignments, reclaimed))
}

/// Runs assignment for every configured section in order, then returns any
/// item no section selected to the pool.
pub async fn assign_sections(
    store: &dyn ContentStore,
    issue_id: IssueId,
    sections: &[SectionConfig],
) -> Result<AssignmentReport> {
    store.clear_section_assignments(issue_id).await?;

    let mut report = AssignmentReport::default();
    let mut used: HashSet<ItemId> = HashSet::new();

    for config in sections {
        let (assignments, reclaimed) =
            assign_top_items(store, issue_id, config.section, config.limit, &used).await?;
        used.extend(assignments.iter().map(|a| a.item_id));
        report.assignments.extend(assignments);
        report.reclaimed.extend(reclaimed);
    }

    let leftovers = crate::pool::reclaim_unbound_items(store, issue_id, &used).await?;
    report.reclaimed.extend(leftovers);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::CriterionScore;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn item(n: u32, published_days_ago: i64) -> Item {
        Item {
            id: Uuid::new_v4(),
            feed_id: Uuid::new_v4(),
            url: format!("https://example.com/{}", n),
            title: format!("Item {}", n),
            body: String::new(),
            full_text: None,
            media_url: None,
            published_at: Some(Utc::now() - Duration::days(published_days_ago)),
            section: SectionAffinity::Primary,
            issue_id: None,
            archived: false,
            created_at: Utc::now(),
        }
    }

    fn rating(item: &Item, score: u8) -> Rating {
        Rating::new(
            item.id,
            vec![CriterionScore {
                instruction: "q".to_string(),
                score,
                weight: 1.0,
                rationale: String::new(),
            }],
            "fp".to_string(),
        )
    }

    #[test]
    fn ranks_by_score_then_recency() {
        let items = vec![item(0, 3), item(1, 1), item(2, 2), item(3, 0)];
        let mut ratings = HashMap::new();
        ratings.insert(items[0].id, rating(&items[0], 9));
        ratings.insert(items[1].id, rating(&items[1], 5));
        ratings.insert(items[2].id, rating(&items[2], 5));

        let ranked = rank_candidates(Section::Primary, &items, &ratings, |_| false, &HashSet::new());
        let order: Vec<&str> = ranked.iter().map(|(i, _)| i.title.as_str()).collect();
        // Item 3 is unrated and never ranked.
        assert_eq!(order, vec!["Item 0", "Item 1", "Item 2"]);

        let ranked = rank_candidates(Section::Secondary, &items, &ratings, |_| false, &HashSet::new());
        assert!(ranked.is_empty());

        let suppressed = items[0].id;
        let ranked = rank_candidates(Section::Primary, &items, &ratings, |id| *id == suppressed, &HashSet::new());
        assert_eq!(ranked.len(), 2);

        let used = HashSet::from([items[0].id, items[2].id]);
        let ranked = rank_candidates(Section::Primary, &items, &ratings, |_| false, &used);
        let order: Vec<&str> = ranked.iter().map(|(i, _)| i.title.as_str()).collect();
        assert_eq!(order, vec!["Item 1"]);
    }

    fn section(section: Section, limit: usize) -> SectionConfig {
        SectionConfig {
            section,
            limit,
            criteria: vec![crate::types::Criterion { instruction: "q".to_string(), weight: 1.0 }],
            feeds: Vec::new(),
            style: String::new(),
        }
    }

    #[tokio::test]
    async fn both_items_fill_each_section_once() {
        let store = InMemoryStore::new();
        let issue = Uuid::new_v4();

        let mut items = Vec::new();
        for (n, affinity) in [
            SectionAffinity::Both,
            SectionAffinity::Both,
            SectionAffinity::Both,
            SectionAffinity::Both,
            SectionAffinity::Both,
            SectionAffinity::Primary,
            SectionAffinity::Secondary,
        ]
        .into_iter()
        .enumerate()
        {
            let mut item = item(n as u32, 0);
            item.section = affinity;
            store.insert_item_if_new(&item).await.unwrap();
            assert!(store.swap_item_binding(item.id, None, Some(issue)).await.unwrap());
            store.upsert_rating(&rating(&item, 9 - n as u8)).await.unwrap();
            items.push(item);
        }

        let sections = vec![section(Section::Primary, 2), section(Section::Secondary, 3)];
        let report = assign_sections(&store, issue, &sections).await.unwrap();

        let primary: HashSet<ItemId> = report.for_section(Section::Primary).map(|a| a.item_id).collect();
        let secondary: HashSet<ItemId> = report.for_section(Section::Secondary).map(|a| a.item_id).collect();
        assert_eq!(primary.len(), 2);
        assert_eq!(secondary.len(), 3);
        assert!(primary.is_disjoint(&secondary));
        assert_eq!(primary, HashSet::from([items[0].id, items[1].id]));
        assert_eq!(secondary, HashSet::from([items[2].id, items[3].id, items[4].id]));

        // The section-exclusive items lost to higher-rated Both items go back to the pool.
        let reclaimed: HashSet<ItemId> = report.reclaimed.iter().copied().collect();
        assert_eq!(reclaimed, HashSet::from([items[5].id, items[6].id]));
        assert_eq!(store.list_issue_items(issue).await.unwrap().len(), 5);

        let stored = store.list_section_assignments(issue).await.unwrap();
        assert_eq!(stored.len(), 5);
    }
}
