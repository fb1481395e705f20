use crate::types::{ParsedEntry, ParsedFeed, PipelineError, Result};
use chrono::Utc;
use feed_rs::model::Entry;
use feed_rs::parser;
use std::collections::HashSet;
use tracing::debug;

/// Stateless syndication parser (RSS 0.9-2.0, Atom, JSON Feed).
pub struct FeedParser;

impl FeedParser {
    pub fn parse(content: &str) -> Result<ParsedFeed> {
        debug!("Parsing feed content ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| PipelineError::Parse(format!("Failed to parse feed: {}", e)))?;

        let title = feed.title.map(|t| t.content);

        let mut seen_urls = HashSet::new();
        let entries: Vec<ParsedEntry> = feed
            .entries
            .into_iter()
            .filter_map(Self::parse_entry)
            .filter(|entry| seen_urls.insert(entry.url.clone()))
            .collect();

        debug!("Parsed feed with {} entries", entries.len());

        Ok(ParsedFeed { title, entries })
    }

    fn parse_entry(entry: Entry) -> Option<ParsedEntry> {
        let url = entry
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| entry.links.first())?
            .href
            .clone();

        let title = entry
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled".to_string());

        let guid = if entry.id.is_empty() { None } else { Some(entry.id.clone()) };
        let summary = entry.summary.map(|s| s.content);
        let content = entry.content.and_then(|c| c.body);

        let media_url = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
            .or_else(|| {
                entry
                    .media
                    .iter()
                    .flat_map(|m| m.thumbnails.iter())
                    .map(|t| t.image.uri.clone())
                    .next()
            })
            .or_else(|| {
                entry
                    .links
                    .iter()
                    .find(|l| l.rel.as_deref() == Some("enclosure"))
                    .map(|l| l.href.clone())
            });

        let published_at = entry
            .published
            .or(entry.updated)
            .map(|dt| dt.with_timezone(&Utc));

        Some(ParsedEntry {
            guid,
            url,
            title,
            summary,
            content,
            media_url,
            published_at,
        })
    }
}
