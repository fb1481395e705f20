use chrono::{Duration, NaiveDate, Utc};
use issue_pipeline::store::ContentStore;
use issue_pipeline::{
    InMemoryStore, Issue, IssuePipeline, IssueStatus, Item, ItemId, MockLlmAdapter, OperatorAction,
    OutcomeKind, Phase, PhaseTriggerRequest, PipelineConfig, PipelineError, RecordingTrigger, Section,
    SectionAffinity,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    store: Arc<InMemoryStore>,
    oracle: Arc<MockLlmAdapter>,
    trigger: Arc<RecordingTrigger>,
    pipeline: Arc<IssuePipeline>,
}

fn harness(config: PipelineConfig, oracle: MockLlmAdapter) -> Harness {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).try_init();

    let store = Arc::new(InMemoryStore::new());
    let oracle = Arc::new(oracle);
    let trigger = Arc::new(RecordingTrigger::new());
    let pipeline = IssuePipeline::new(store.clone(), oracle.clone(), trigger.clone(), config)
        .unwrap()
        .with_holder("scenario");
    Harness {
        store,
        oracle,
        trigger,
        pipeline: Arc::new(pipeline),
    }
}

fn config(primary_limit: usize, secondary_limit: usize, extra: &str) -> PipelineConfig {
    PipelineConfig::from_toml(&format!(
        r#"
[publication]
id = "daily"

[[sections]]
name = "primary"
limit = {primary_limit}
criteria = [
    {{ prompt = "Relevance to readers", weight = 2.0 }},
    {{ prompt = "Novelty", weight = 1.0 }},
]

[[sections]]
name = "secondary"
limit = {secondary_limit}
criteria = [{{ prompt = "Practical value", weight = 1.0 }}]

[fetch]
min_host_interval_ms = 0

{extra}
"#
    ))
    .unwrap()
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

async fn seed(store: &InMemoryStore, title: &str, section: SectionAffinity, hours_ago: i64) -> Item {
    let item = Item {
        id: Uuid::new_v4(),
        feed_id: Uuid::new_v4(),
        url: format!("https://news.example.com/{}", title.to_lowercase().replace(' ', "-")),
        title: title.to_string(),
        body: format!("Body of {}", title),
        full_text: None,
        media_url: None,
        published_at: Some(Utc::now() - Duration::hours(hours_ago)),
        section,
        issue_id: None,
        archived: false,
        created_at: Utc::now(),
    };
    assert!(store.insert_item_if_new(&item).await.unwrap());
    item
}

fn request(issue: &Issue) -> PhaseTriggerRequest {
    PhaseTriggerRequest {
        issue_id: issue.id,
        publication_id: "daily".to_string(),
        attempt: None,
    }
}

fn pool_ids(items: &[Item]) -> HashSet<ItemId> {
    items.iter().map(|i| i.id).collect()
}

#[tokio::test]
async fn six_primary_four_secondary_limit_three() {
    let h = harness(config(3, 3, ""), MockLlmAdapter::new("scenario"));
    for n in 0..6 {
        seed(&h.store, &format!("Primary {}", n), SectionAffinity::Primary, n).await;
    }
    for n in 0..4 {
        seed(&h.store, &format!("Secondary {}", n), SectionAffinity::Secondary, n).await;
    }

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    let outcome = h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    info!("Process outcome: {:?}", outcome);

    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.counts.scored, 10);
    assert_eq!(outcome.counts.score_failures, 0);
    assert_eq!(outcome.counts.suppressed, 0);
    assert_eq!(outcome.counts.assigned, 6);
    assert_eq!(outcome.counts.reclaimed, 4);
    assert_eq!(outcome.next_phase, Some(Phase::Generate));
    assert_eq!(h.store.get_issue(issue.id).await.unwrap().status, IssueStatus::PendingPhase2);
    assert_eq!(h.store.list_pool_items().await.unwrap().len(), 4);

    let sent = h.trigger.sent();
    assert_eq!(sent.len(), 1);
    let (next, chained) = sent[0].clone();
    assert_eq!(next, Phase::Generate);
    assert_eq!(chained.attempt, Some(1));

    let outcome = h.pipeline.run_phase(next, chained).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.counts.generated, 6);
    assert_eq!(outcome.counts.reclaimed, 0);
    assert_eq!(outcome.next_phase, None);

    let done = h.store.get_issue(issue.id).await.unwrap();
    assert_eq!(done.status, IssueStatus::InReview);
    assert!(done.subject.is_some());
    assert!(done.lease.is_none());
    assert!(done.audit.review_started_at.is_some());

    let articles = h.store.list_articles(issue.id, true).await.unwrap();
    assert_eq!(articles.len(), 6);
    assert_eq!(articles.iter().filter(|a| a.section == Section::Primary).count(), 3);
    assert_eq!(articles.iter().filter(|a| a.section == Section::Secondary).count(), 3);
    let article_items: HashSet<ItemId> = articles.iter().map(|a| a.item_id).collect();
    assert_eq!(article_items.len(), 6);

    let pool = h.store.list_pool_items().await.unwrap();
    assert_eq!(pool.len(), 4);
    assert!(pool_ids(&pool).is_disjoint(&article_items));
    assert_eq!(h.store.list_issue_items(issue.id).await.unwrap().len(), 6);
}

#[tokio::test]
async fn scoring_failures_are_left_out_of_ranking() {
    let h = harness(
        config(10, 3, ""),
        MockLlmAdapter::new("scenario")
            .failing_score("Item 3")
            .malformed_score("Item 7"),
    );
    let mut items = Vec::new();
    for n in 0..10 {
        items.push(seed(&h.store, &format!("Item {}", n), SectionAffinity::Primary, n).await);
    }

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    let outcome = h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();

    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.counts.scored, 8);
    assert_eq!(outcome.counts.score_failures, 2);
    assert_eq!(outcome.counts.assigned, 8);
    assert_eq!(outcome.counts.reclaimed, 2);

    let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
    let ratings = h.store.get_ratings(&ids).await.unwrap();
    assert_eq!(ratings.len(), 8);
    assert!(!ratings.contains_key(&items[3].id));
    assert!(!ratings.contains_key(&items[7].id));

    let assigned: HashSet<ItemId> = h
        .store
        .list_section_assignments(issue.id)
        .await
        .unwrap()
        .iter()
        .map(|a| a.item_id)
        .collect();
    assert_eq!(assigned.len(), 8);
    assert!(!assigned.contains(&items[3].id));
    assert!(!assigned.contains(&items[7].id));

    let pool = pool_ids(&h.store.list_pool_items().await.unwrap());
    assert_eq!(pool, HashSet::from([items[3].id, items[7].id]));
}

#[tokio::test]
async fn duplicates_are_excluded_from_assignment() {
    let h = harness(
        config(2, 3, ""),
        MockLlmAdapter::new("scenario")
            .with_score("A", 6)
            .with_score("B", 9)
            .with_score("C", 9)
            .with_score("D", 4)
            .with_duplicate_group("rate decision", "A", &["B", "C"]),
    );
    let a = seed(&h.store, "A", SectionAffinity::Primary, 1).await;
    let b = seed(&h.store, "B", SectionAffinity::Primary, 1).await;
    let c = seed(&h.store, "C", SectionAffinity::Primary, 1).await;
    let d = seed(&h.store, "D", SectionAffinity::Primary, 1).await;

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    let outcome = h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.counts.suppressed, 2);
    assert_eq!(outcome.counts.assigned, 2);

    let groups = h.store.list_duplicate_groups(issue.id).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].primary_item_id, a.id);
    assert!(!groups[0].suppresses(&a.id));

    let assignments = h.store.list_section_assignments(issue.id).await.unwrap();
    let assigned: Vec<ItemId> = assignments.iter().map(|x| x.item_id).collect();
    assert_eq!(assigned, vec![a.id, d.id]);
    assert_eq!(assignments[0].rank, 1);

    let pool = pool_ids(&h.store.list_pool_items().await.unwrap());
    assert_eq!(pool, HashSet::from([b.id, c.id]));
}

#[tokio::test]
async fn second_generate_trigger_conflicts_while_first_runs() {
    let h = harness(config(2, 1, ""), MockLlmAdapter::new("scenario").with_delay(200));
    seed(&h.store, "First", SectionAffinity::Primary, 1).await;
    seed(&h.store, "Second", SectionAffinity::Primary, 2).await;

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    let (_, chained) = h.trigger.sent()[0].clone();

    let first = tokio::spawn({
        let pipeline = h.pipeline.clone();
        let chained = chained.clone();
        async move { pipeline.run_phase(Phase::Generate, chained).await }
    });

    let mut busy = false;
    for _ in 0..100 {
        if h.store.get_issue(issue.id).await.unwrap().status == IssueStatus::Processing {
            busy = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(busy, "first generate never started");

    let before = h.store.get_issue(issue.id).await.unwrap();
    let second = h.pipeline.run_phase(Phase::Generate, chained).await.unwrap();
    assert_eq!(second.kind, OutcomeKind::Conflict);
    assert!(!second.is_success());
    assert_eq!(h.store.get_issue(issue.id).await.unwrap(), before);

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.kind, OutcomeKind::Completed);
    assert_eq!(first.counts.generated, 2);

    // Two articles plus one subject line; the rejected trigger generated nothing.
    assert_eq!(h.oracle.generate_calls(), 3);
    assert_eq!(h.store.list_articles(issue.id, false).await.unwrap().len(), 2);
    assert_eq!(h.store.get_issue(issue.id).await.unwrap().attempts, 2);
}

#[tokio::test]
async fn replayed_chain_trigger_is_a_silent_no_op() {
    let h = harness(config(1, 1, ""), MockLlmAdapter::new("scenario"));
    seed(&h.store, "Only", SectionAffinity::Both, 1).await;

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    let (_, chained) = h.trigger.sent()[0].clone();
    h.pipeline.run_phase(Phase::Generate, chained.clone()).await.unwrap();

    let settled = h.store.get_issue(issue.id).await.unwrap();
    let calls = h.oracle.generate_calls();

    let replay = h.pipeline.run_phase(Phase::Generate, chained).await.unwrap();
    assert_eq!(replay.kind, OutcomeKind::Skipped);
    assert!(replay.is_success());
    assert_eq!(h.store.get_issue(issue.id).await.unwrap(), settled);
    assert_eq!(h.oracle.generate_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn phase_over_budget_fails_with_timeout() {
    let h = harness(
        config(2, 1, "[budgets]\ngenerate_seconds = 1"),
        MockLlmAdapter::new("scenario").with_delay(5_000),
    );
    seed(&h.store, "Slow", SectionAffinity::Primary, 1).await;

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    let process = h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    assert_eq!(process.kind, OutcomeKind::Completed);

    let (_, chained) = h.trigger.sent()[0].clone();
    let outcome = h.pipeline.run_phase(Phase::Generate, chained).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Failed);
    assert!(outcome.message.starts_with("timeout"));

    let failed = h.store.get_issue(issue.id).await.unwrap();
    assert_eq!(failed.status, IssueStatus::Failed);
    assert_eq!(failed.failed_phase, Some(Phase::Generate));
    assert!(failed.failure_reason.unwrap().starts_with("timeout"));
    assert!(failed.audit.failed_at.is_some());

    // The issue stays addressable for an operator retry of either phase.
    let failed = h.store.get_issue(issue.id).await.unwrap();
    assert!(Phase::Generate.accepts(&failed));
    assert!(Phase::Process.accepts(&failed));
}

#[tokio::test]
async fn sweep_fails_issue_whose_generate_trigger_was_lost() {
    let h = harness(
        config(2, 1, "[budgets]\ntrigger_grace_seconds = 0\nsweep_interval_seconds = 1"),
        MockLlmAdapter::new("scenario"),
    );
    seed(&h.store, "Orphan", SectionAffinity::Primary, 1).await;

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    let process = h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    assert_eq!(process.kind, OutcomeKind::Completed);
    // The recorded generate trigger is never delivered.
    assert_eq!(h.trigger.sent().len(), 1);

    let sweep = tokio::spawn(h.pipeline.clone().run_recovery());
    let mut stored = h.store.get_issue(issue.id).await.unwrap();
    for _ in 0..100 {
        if stored.status != IssueStatus::PendingPhase2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        stored = h.store.get_issue(issue.id).await.unwrap();
    }
    sweep.abort();

    assert_eq!(stored.status, IssueStatus::Failed);
    assert_eq!(stored.failed_phase, Some(Phase::Generate));
    info!("Swept issue: {:?}", stored.failure_reason);
    assert!(stored.failure_reason.as_deref().unwrap().starts_with("trigger:"));

    // An operator re-runs generate from the failed state.
    let retry = h.pipeline.run_phase(Phase::Generate, request(&issue)).await.unwrap();
    assert_eq!(retry.kind, OutcomeKind::Completed);
    assert_eq!(h.store.get_issue(issue.id).await.unwrap().status, IssueStatus::InReview);
}

#[tokio::test]
async fn reprocess_after_review_keeps_ratings_and_deactivates_articles() {
    let h = harness(config(3, 3, ""), MockLlmAdapter::new("scenario"));
    for n in 0..6 {
        seed(&h.store, &format!("Primary {}", n), SectionAffinity::Primary, n).await;
    }
    for n in 0..4 {
        seed(&h.store, &format!("Secondary {}", n), SectionAffinity::Secondary, n).await;
    }

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    let (_, chained) = h.trigger.sent()[0].clone();
    h.pipeline.run_phase(Phase::Generate, chained).await.unwrap();
    assert_eq!(h.oracle.score_calls(), 10);

    h.pipeline
        .apply_action(issue.id, OperatorAction::RecordChanges)
        .await
        .unwrap();

    let outcome = h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.counts.assigned, 6);
    assert_eq!(outcome.counts.reclaimed, 4);
    assert_eq!(h.oracle.score_calls(), 10);

    let (_, chained) = h.trigger.sent()[1].clone();
    assert_eq!(chained.attempt, Some(3));
    let outcome = h.pipeline.run_phase(Phase::Generate, chained).await.unwrap();
    assert_eq!(outcome.counts.generated, 6);

    assert_eq!(h.store.list_articles(issue.id, true).await.unwrap().len(), 6);
    assert_eq!(h.store.list_articles(issue.id, false).await.unwrap().len(), 12);
    assert_eq!(h.store.get_issue(issue.id).await.unwrap().status, IssueStatus::InReview);
}

#[tokio::test]
async fn wrong_publication_is_rejected_before_any_write() {
    let h = harness(config(1, 1, ""), MockLlmAdapter::new("scenario"));
    let issue = h.pipeline.create_issue(date()).await.unwrap();

    let mut foreign = request(&issue);
    foreign.publication_id = "weekly".to_string();
    let err = h.pipeline.run_phase(Phase::Process, foreign).await.unwrap_err();
    assert!(matches!(err, PipelineError::PublicationMismatch { .. }));
    assert_eq!(h.store.get_issue(issue.id).await.unwrap(), issue);

    let missing = PhaseTriggerRequest {
        issue_id: Uuid::new_v4(),
        publication_id: "daily".to_string(),
        attempt: None,
    };
    let err = h.pipeline.run_phase(Phase::Process, missing).await.unwrap_err();
    assert!(matches!(err, PipelineError::IssueNotFound { .. }));
}

#[tokio::test]
async fn process_ingests_configured_feeds() {
    let server = MockServer::start().await;
    let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Wire</title><link>https://wire.example.com</link><description>d</description>
<item><title>Alpha</title><link>https://wire.example.com/alpha</link><description>&lt;p&gt;alpha story&lt;/p&gt;</description><pubDate>Mon, 19 Oct 2026 06:00:00 GMT</pubDate></item>
<item><title>Beta</title><link>https://wire.example.com/beta</link><description>beta story</description><pubDate>Mon, 19 Oct 2026 05:00:00 GMT</pubDate></item>
<item><title>Gamma</title><link>https://wire.example.com/gamma</link><description>gamma story</description><pubDate>Mon, 19 Oct 2026 04:00:00 GMT</pubDate></item>
</channel></rss>"#;
    Mock::given(method("GET"))
        .and(path("/wire.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss))
        .mount(&server)
        .await;

    let config = PipelineConfig::from_toml(&format!(
        r#"
[publication]
id = "daily"

[[sections]]
name = "primary"
limit = 2
criteria = [{{ prompt = "Relevance", weight = 1.0 }}]
feeds = [{{ url = "{}/wire.xml", section = "primary" }}]

[fetch]
min_host_interval_ms = 0
"#,
        server.uri()
    ))
    .unwrap();
    let h = harness(config, MockLlmAdapter::new("scenario").with_score("Gamma", 9));

    let issue = h.pipeline.create_issue(date()).await.unwrap();
    let outcome = h.pipeline.run_phase(Phase::Process, request(&issue)).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.counts.fetched, 3);
    assert_eq!(outcome.counts.assigned, 2);
    assert_eq!(outcome.counts.reclaimed, 1);

    let assignments = h.store.list_section_assignments(issue.id).await.unwrap();
    let top = h.store.get_item(assignments[0].item_id).await.unwrap();
    assert_eq!(top.title, "Gamma");
    // Equal scores fall back to the newest item.
    let second = h.store.get_item(assignments[1].item_id).await.unwrap();
    assert_eq!(second.title, "Alpha");

    let pool = h.store.list_pool_items().await.unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].title, "Beta");
}
