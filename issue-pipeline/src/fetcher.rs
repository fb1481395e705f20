use crate::types::{FeedRecord, FetchConfig, FetchResult, PipelineError, Result};
use crate::utils::url::{extract_host, is_valid_feed_url};
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Retrieves raw feed documents. Knows nothing about issues or the pool.
///
/// Failures are reported in the returned `FetchResult` rather than retried:
/// a feed that fails is picked up again on the next ingestion cycle.
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn fetch_feed(&self, feed: &FeedRecord) -> FetchResult {
        let start_time = Instant::now();
        let fetch_time = Utc::now();

        debug!("Fetching feed: {} (ID: {})", feed.url, feed.id);

        let failed = |error: String, http_status: Option<u16>| FetchResult {
            feed_id: feed.id,
            success: false,
            error: Some(error),
            fetch_time,
            response_time_ms: start_time.elapsed().as_millis() as u64,
            http_status,
            etag: None,
            last_modified: None,
            content: None,
        };

        if !is_valid_feed_url(&feed.url) {
            return failed(format!("Unsupported feed URL: {}", feed.url), None);
        }

        self.apply_rate_limit(&feed.url).await;

        let response = match self
            .fetch_with_conditional_headers(&feed.url, feed.etag.as_deref(), feed.last_modified.as_deref())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to fetch feed {}: {}", feed.url, e);
                return failed(e.to_string(), None);
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!("Feed not modified: {}", feed.url);
            return FetchResult {
                feed_id: feed.id,
                success: true,
                error: None,
                fetch_time,
                response_time_ms: start_time.elapsed().as_millis() as u64,
                http_status: Some(status.as_u16()),
                etag: feed.etag.clone(),
                last_modified: feed.last_modified.clone(),
                content: None,
            };
        }

        if !status.is_success() {
            warn!("Feed {} answered HTTP {}", feed.url, status);
            return failed(
                format!("HTTP {}: {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown")),
                Some(status.as_u16()),
            );
        }

        let etag = header_value(&response, "etag");
        let last_modified = header_value(&response, "last-modified");
        let max_bytes = self.config.max_feed_size_mb * 1024 * 1024;

        if let Some(content_length) = response.content_length() {
            if content_length as usize > max_bytes {
                let err = PipelineError::FeedTooLarge {
                    size_mb: content_length as usize / (1024 * 1024),
                };
                return failed(err.to_string(), Some(status.as_u16()));
            }
        }

        match response.text().await {
            Ok(content) if content.len() > max_bytes => {
                let err = PipelineError::FeedTooLarge {
                    size_mb: content.len() / (1024 * 1024),
                };
                failed(err.to_string(), Some(status.as_u16()))
            }
            Ok(content) => {
                info!("Fetched feed: {} ({} bytes)", feed.url, content.len());
                FetchResult {
                    feed_id: feed.id,
                    success: true,
                    error: None,
                    fetch_time,
                    response_time_ms: start_time.elapsed().as_millis() as u64,
                    http_status: Some(status.as_u16()),
                    etag,
                    last_modified,
                    content: Some(content),
                }
            }
            Err(e) => failed(e.to_string(), Some(status.as_u16())),
        }
    }

    async fn fetch_with_conditional_headers(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<Response> {
        let mut request = self.client.get(url);

        if let Some(etag) = etag {
            request = request.header("If-None-Match", etag);
        }

        if let Some(last_modified) = last_modified {
            request = request.header("If-Modified-Since", last_modified);
        }

        let response = request.send().await?;
        Ok(response)
    }

    /// Spaces requests to the same host by at least `min_host_interval_ms`.
    async fn apply_rate_limit(&self, url: &str) {
        let Some(host) = extract_host(url) else {
            return;
        };
        let min_interval = Duration::from_millis(self.config.min_host_interval_ms);

        let wait = {
            let mut rate_limiter = self.rate_limiter.lock().await;
            let now = Instant::now();
            let slot = match rate_limiter.get(&host) {
                Some(last) if now.duration_since(*last) < min_interval => *last + min_interval,
                _ => now,
            };
            rate_limiter.insert(host.clone(), slot);
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            debug!("Rate limiting {}: waiting {:?}", host, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

fn header_value(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SectionAffinity;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> Fetcher {
        Fetcher::new(FetchConfig {
            min_host_interval_ms: 0,
            ..FetchConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn returns_body_and_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_string("<rss></rss>"),
            )
            .mount(&server)
            .await;

        let feed = FeedRecord::new(&format!("{}/rss", server.uri()), SectionAffinity::Both);
        let result = fetcher().fetch_feed(&feed).await;
        assert!(result.success);
        assert_eq!(result.http_status, Some(200));
        assert_eq!(result.etag.as_deref(), Some("\"v1\""));
        assert_eq!(result.content.as_deref(), Some("<rss></rss>"));
    }

    #[tokio::test]
    async fn not_modified_is_success_without_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let mut feed = FeedRecord::new(&format!("{}/rss", server.uri()), SectionAffinity::Primary);
        feed.etag = Some("\"v1\"".to_string());
        let result = fetcher().fetch_feed(&feed).await;
        assert!(result.success);
        assert!(result.content.is_none());
        assert_eq!(result.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn server_error_is_reported_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let feed = FeedRecord::new(&format!("{}/rss", server.uri()), SectionAffinity::Primary);
        let result = fetcher().fetch_feed(&feed).await;
        assert!(!result.success);
        assert_eq!(result.http_status, Some(503));
        assert!(result.error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let feed = FeedRecord::new("ftp://example.com/feed", SectionAffinity::Primary);
        let result = fetcher().fetch_feed(&feed).await;
        assert!(!result.success);
    }
}
