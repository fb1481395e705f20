use crate::fetcher::Fetcher;
use crate::parser::FeedParser;
use crate::store::ContentStore;
use crate::types::{FeedConfig, FeedRecord, FetchConfig, FetchResult, Item, ParsedEntry, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Totals of one ingestion cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub feeds_attempted: usize,
    pub feeds_failed: usize,
    /// Entries seen across every successfully fetched feed.
    pub fetched: usize,
    /// Entries that were new to the pool.
    pub inserted: usize,
}

/// Outcome of fetching one feed, before anything is written.
#[derive(Debug)]
pub struct FetchedFeed {
    pub result: FetchResult,
    pub items: Vec<Item>,
}

/// Pulls configured feeds into the content pool.
pub struct FeedIngester {
    store: Arc<dyn ContentStore>,
    fetcher: Fetcher,
    max_concurrent_feeds: usize,
}

impl FeedIngester {
    pub fn new(store: Arc<dyn ContentStore>, config: FetchConfig) -> Result<Self> {
        let max_concurrent_feeds = config.max_concurrent_feeds.max(1);
        Ok(Self {
            store,
            fetcher: Fetcher::new(config)?,
            max_concurrent_feeds,
        })
    }

    /// Retrieves and parses one feed. No store writes happen here.
    pub async fn fetch_feed(&self, feed: &FeedRecord) -> FetchedFeed {
        let mut result = self.fetcher.fetch_feed(feed).await;

        let content = match (result.success, result.content.take()) {
            (true, Some(content)) => content,
            _ => return FetchedFeed { result, items: Vec::new() },
        };

        match FeedParser::parse(&content) {
            Ok(parsed) => {
                let items = parsed
                    .entries
                    .into_iter()
                    .map(|entry| item_from_entry(feed, entry))
                    .collect();
                FetchedFeed { result, items }
            }
            Err(e) => {
                warn!("Feed {} returned an unparseable document: {}", feed.url, e);
                result.success = false;
                result.error = Some(e.to_string());
                FetchedFeed { result, items: Vec::new() }
            }
        }
    }

    /// Fetches one configured feed and stores whatever is new.
    /// Returns `(fetched, inserted)`.
    pub async fn ingest_feed(&self, config: &FeedConfig) -> Result<(usize, usize)> {
        let record = self.store.upsert_feed(&config.url, config.section).await?;
        let fetched = self.fetch_feed(&record).await;
        self.store.record_fetch_result(&fetched.result).await?;

        if !fetched.result.success {
            return Err(crate::types::PipelineError::General(
                fetched
                    .result
                    .error
                    .unwrap_or_else(|| "Fetch failed".to_string()),
            ));
        }

        let mut inserted = 0;
        for item in &fetched.items {
            match self.store.insert_item_if_new(item).await {
                Ok(true) => inserted += 1,
                Ok(false) => debug!("Item already in pool: {}", item.url),
                Err(e) => warn!("Failed to store item {} from {}: {}", item.url, config.url, e),
            }
        }

        info!(
            "Feed {}: found {} entries, stored {} new",
            config.url,
            fetched.items.len(),
            inserted
        );
        Ok((fetched.items.len(), inserted))
    }

    /// Ingests every feed independently; one failing feed never stops the others.
    pub async fn ingest_all(&self, feeds: &[FeedConfig]) -> IngestReport {
        let active: Vec<FeedConfig> = feeds.iter().filter(|f| f.active).cloned().collect();
        info!("Ingesting {} feeds", active.len());

        let outcomes: Vec<(String, Result<(usize, usize)>)> = stream::iter(active)
            .map(move |feed: FeedConfig| async move {
                let outcome = self.ingest_feed(&feed).await;
                (feed.url, outcome)
            })
            .buffer_unordered(self.max_concurrent_feeds)
            .collect()
            .await;

        let mut report = IngestReport {
            feeds_attempted: outcomes.len(),
            ..IngestReport::default()
        };
        for (url, outcome) in outcomes {
            match outcome {
                Ok((fetched, inserted)) => {
                    report.fetched += fetched;
                    report.inserted += inserted;
                }
                Err(e) => {
                    warn!("Failed to ingest feed {}: {}", url, e);
                    report.feeds_failed += 1;
                }
            }
        }

        info!(
            "Ingestion finished: {}/{} feeds ok, {} entries, {} new",
            report.feeds_attempted - report.feeds_failed,
            report.feeds_attempted,
            report.fetched,
            report.inserted
        );
        report
    }
}

fn item_from_entry(feed: &FeedRecord, entry: ParsedEntry) -> Item {
    let body = entry
        .summary
        .clone()
        .or_else(|| entry.content.clone())
        .unwrap_or_default();

    Item {
        id: Uuid::new_v4(),
        feed_id: feed.id,
        url: entry.url,
        title: entry.title,
        body,
        full_text: entry.content,
        media_url: entry.media_url,
        published_at: entry.published_at,
        section: feed.section,
        issue_id: None,
        archived: false,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::SectionAffinity;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title><link>https://example.com</link><description>d</description>
<item><title>One</title><link>https://example.com/1</link><description>first</description></item>
<item><title>Two</title><link>https://example.com/2</link><description>second</description></item>
</channel></rss>"#;

    fn config() -> FetchConfig {
        FetchConfig {
            min_host_interval_ms: 0,
            ..FetchConfig::default()
        }
    }

    #[tokio::test]
    async fn failing_feed_does_not_stop_others() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let ingester = FeedIngester::new(store.clone(), config()).unwrap();
        let feeds = vec![
            FeedConfig {
                url: format!("{}/bad", server.uri()),
                section: SectionAffinity::Primary,
                active: true,
            },
            FeedConfig {
                url: format!("{}/good", server.uri()),
                section: SectionAffinity::Secondary,
                active: true,
            },
        ];

        let report = ingester.ingest_all(&feeds).await;
        assert_eq!(report.feeds_attempted, 2);
        assert_eq!(report.feeds_failed, 1);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.inserted, 2);

        let pool = store.list_pool_items().await.unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.iter().all(|i| i.section == SectionAffinity::Secondary));

        // Re-ingesting the same document adds nothing.
        let report = ingester.ingest_all(&feeds).await;
        assert_eq!(report.inserted, 0);
        assert_eq!(store.list_pool_items().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unparseable_document_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        let ingester = FeedIngester::new(store.clone(), config()).unwrap();
        let feed = FeedRecord::new(&format!("{}/x", server.uri()), SectionAffinity::Both);
        let fetched = ingester.fetch_feed(&feed).await;
        assert!(!fetched.result.success);
        assert!(fetched.items.is_empty());
    }
}
