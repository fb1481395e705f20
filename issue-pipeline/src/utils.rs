/// Text processing utilities
pub mod text {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|</?[^>]+>").expect("tag regex"));
    static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

    /// Truncate text to at most `max_chars` characters, trying to break at
    /// sentence boundaries
    pub fn smart_truncate(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            return text.to_string();
        }

        let cut = text
            .char_indices()
            .nth(max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(text.len());
        let truncated = &text[..cut];
        if let Some(last_sentence) = truncated.rfind('.') {
            truncated[..last_sentence + 1].to_string()
        } else if let Some(last_space) = truncated.rfind(' ') {
            format!("{}...", &truncated[..last_space])
        } else {
            format!("{}...", truncated)
        }
    }

    /// Strip markup, decode entities and collapse whitespace.
    pub fn plain_text(html: &str) -> String {
        let stripped = RE_TAGS.replace_all(html, " ");
        let decoded = html_escape::decode_html_entities(&stripped);
        RE_WS.replace_all(&decoded, " ").trim().to_string()
    }

    /// Short summary used when asking the oracle to cluster items.
    pub fn candidate_summary(title: &str, body: &str, max_body_chars: usize) -> String {
        let body: String = plain_text(body).chars().take(max_body_chars).collect();
        if body.is_empty() {
            title.trim().to_string()
        } else {
            format!("{} - {}", title.trim(), body)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn plain_text_strips_tags_and_entities() {
            assert_eq!(plain_text("<p>Big <b>news</b> today.</p>"), "Big news today.");
            assert_eq!(plain_text("Fish &amp; chips\n\n  <br/>tonight"), "Fish & chips tonight");
            assert_eq!(plain_text("<script>alert(1)</script>Body"), "Body");
        }

        #[test]
        fn smart_truncate_respects_char_boundaries() {
            let text = "Zürich café öffnet wieder";
            let out = smart_truncate(text, 12);
            assert!(out.chars().count() <= 15);
            assert!(out.starts_with("Zürich"));

            assert_eq!(smart_truncate("One. Two three", 8), "One.");
            assert_eq!(smart_truncate("short", 100), "short");
        }

        #[test]
        fn candidate_summary_caps_body() {
            let summary = candidate_summary("Title", "<p>abcdefghij</p>", 4);
            assert_eq!(summary, "Title - abcd");
            assert_eq!(candidate_summary("Only title", "", 300), "Only title");
        }
    }
}

/// URL utilities
pub mod url {
    use url::Url;

    /// Extract host from URL
    pub fn extract_host(url_str: &str) -> Option<String> {
        Url::parse(url_str).ok()?.host_str().map(|h| h.to_string())
    }

    /// Only http(s) feeds are fetched.
    pub fn is_valid_feed_url(url_str: &str) -> bool {
        match Url::parse(url_str) {
            Ok(url) => url.scheme() == "http" || url.scheme() == "https",
            Err(_) => false,
        }
    }
}

/// Time utilities
pub mod time {
    use chrono::Duration;

    /// Format duration in human-readable form
    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.num_seconds();

        if total_seconds < 60 {
            format!("{}s", total_seconds)
        } else if total_seconds < 3600 {
            format!("{}m", total_seconds / 60)
        } else if total_seconds < 86400 {
            format!("{}h", total_seconds / 3600)
        } else {
            format!("{}d", total_seconds / 86400)
        }
    }
}
