use chrono::{DateTime, Utc};
use feed_rs::model;
use feed_rs::parser;
use tracing::debug;

use crate::error::FetchError;
use crate::transport::Transport;

/// Feed-level metadata derived from a parsed document.
///
/// Favicon fields are filled in separately by the favicon resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMetadata {
    pub title: String,
    pub subtitle: Option<String>,
    pub site_url: Option<String>,
    pub feed_url: String,
}

/// One item as it appeared in the fetched document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub title: String,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct FeedFetcher {
    transport: Transport,
}

impl FeedFetcher {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn fetch(&self, url: &str) -> Result<ParsedFeed, FetchError> {
        let fetched = self.transport.get(url).await?;
        ParsedFeed::parse(url, &fetched.body)
    }
}

/// A fetched and parsed feed document. Both views are pure.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    feed_url: String,
    document: model::Feed,
}

impl ParsedFeed {
    pub fn parse(feed_url: &str, bytes: &[u8]) -> Result<Self, FetchError> {
        let document = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        Ok(Self {
            feed_url: feed_url.to_string(),
            document,
        })
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    pub fn to_metadata(&self) -> FeedMetadata {
        let title = self
            .document
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled Feed".to_string());

        let subtitle = self
            .document
            .description
            .as_ref()
            .map(|d| d.content.trim().to_string())
            .filter(|d| !d.is_empty());

        // Only an alternate (or unlabeled) link points at the site; hub, self
        // and similar links name other hosts
        let site_url = self
            .document
            .links
            .iter()
            .filter(|link| link.rel.is_none() || is_rel(link, "alternate"))
            .map(|link| link.href.trim())
            .find(|href| !href.is_empty() && *href != self.feed_url)
            .map(str::to_string);

        FeedMetadata {
            title,
            subtitle,
            site_url,
            feed_url: self.feed_url.clone(),
        }
    }

    /// Entries in document order. Items without a link cannot be reconciled
    /// and are left out.
    pub fn to_entries(&self) -> Vec<ParsedEntry> {
        self.document
            .entries
            .iter()
            .filter_map(|entry| {
                let parsed = convert_entry(entry);
                if parsed.is_none() {
                    debug!(feed_url = %self.feed_url, entry_id = %entry.id, "Skipping entry with no link");
                }
                parsed
            })
            .collect()
    }
}

fn convert_entry(entry: &model::Entry) -> Option<ParsedEntry> {
    let link = entry_link(entry)?;

    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_else(|| "Untitled".to_string());

    let author = entry
        .authors
        .first()
        .map(|person| person.name.trim().to_string())
        .filter(|name| !name.is_empty());

    // Full content wins over a (possibly truncated) description
    let summary = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .filter(|body| !body.trim().is_empty())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()));

    Some(ParsedEntry {
        title,
        author,
        summary,
        link,
        published_at: entry.published.or(entry.updated),
    })
}

fn entry_link(entry: &model::Entry) -> Option<String> {
    entry
        .links
        .iter()
        .find(|link| link.rel.is_none() || is_rel(link, "alternate"))
        .or_else(|| entry.links.first())
        .map(|link| link.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

fn is_rel(link: &model::Link, rel: &str) -> bool {
    link.rel
        .as_deref()
        .map(|r| r.eq_ignore_ascii_case(rel))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
            <channel>
                <title>Example Blog</title>
                <link>https://ex.com/</link>
                <description>Notes from ex.com</description>
                <item>
                    <title>First post</title>
                    <link>https://ex.com/1</link>
                    <description>Short teaser</description>
                    <content:encoded><![CDATA[<p>The whole first post</p>]]></content:encoded>
                    <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                </item>
                <item>
                    <title>Second post</title>
                    <link>https://ex.com/2</link>
                    <description>Only a description</description>
                </item>
                <item>
                    <title>No link here</title>
                    <description>Cannot be keyed</description>
                </item>
            </channel>
        </rss>
    "#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
        <feed xmlns="http://www.w3.org/2005/Atom">
            <title>Atom Example</title>
            <link rel="self" href="https://atom.example/feed.xml"/>
            <link rel="alternate" href="https://atom.example/"/>
            <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
            <updated>2024-05-02T10:00:00Z</updated>
            <entry>
                <title>Updated only</title>
                <link rel="alternate" href="https://atom.example/posts/1"/>
                <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
                <updated>2024-05-01T08:30:00Z</updated>
                <author><name>Jane Writer</name></author>
                <summary>Atom summary</summary>
            </entry>
            <entry>
                <title>Both dates</title>
                <link rel="alternate" href="https://atom.example/posts/2"/>
                <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6b</id>
                <published>2024-04-01T00:00:00Z</published>
                <updated>2024-04-20T00:00:00Z</updated>
                <author><name>   </name></author>
            </entry>
        </feed>
    "#;

    mod metadata_tests {
        use super::*;

        #[test]
        fn test_rss_metadata() {
            let parsed = ParsedFeed::parse("https://ex.com/rss", RSS.as_bytes()).unwrap();
            let meta = parsed.to_metadata();

            assert_eq!(meta.title, "Example Blog");
            assert_eq!(meta.subtitle.as_deref(), Some("Notes from ex.com"));
            assert_eq!(meta.site_url.as_deref(), Some("https://ex.com/"));
            assert_eq!(meta.feed_url, "https://ex.com/rss");
        }

        #[test]
        fn test_atom_site_url_skips_self_link() {
            let parsed =
                ParsedFeed::parse("https://atom.example/feed.xml", ATOM.as_bytes()).unwrap();
            let meta = parsed.to_metadata();

            assert_eq!(meta.title, "Atom Example");
            assert_eq!(meta.site_url.as_deref(), Some("https://atom.example/"));
            assert!(meta.subtitle.is_none());
        }

        #[test]
        fn test_atom_site_url_ignores_hub_and_related_links() {
            let xml = r#"<?xml version="1.0" encoding="utf-8"?>
                <feed xmlns="http://www.w3.org/2005/Atom">
                    <title>Hubbed</title>
                    <id>urn:uuid:hubbed</id>
                    <updated>2024-01-01T00:00:00Z</updated>
                    <link rel="hub" href="https://pubsubhubbub.appspot.com/"/>
                    <link rel="self" href="https://blog.example/feeds/posts/default"/>
                    <link rel="http://schemas.google.com/g/2005#feed" href="https://blog.example/feeds/posts/default"/>
                    <link rel="alternate" type="text/html" href="https://blog.example/"/>
                </feed>"#;
            let parsed = ParsedFeed::parse("https://blog.example/feeds/posts/default", xml.as_bytes())
                .unwrap();

            assert_eq!(parsed.to_metadata().site_url.as_deref(), Some("https://blog.example/"));
        }

        #[test]
        fn test_feed_with_only_self_link_has_no_site_url() {
            let xml = r#"<?xml version="1.0" encoding="utf-8"?>
                <feed xmlns="http://www.w3.org/2005/Atom">
                    <title>Lonely</title>
                    <id>urn:uuid:lonely</id>
                    <updated>2024-01-01T00:00:00Z</updated>
                    <link rel="self" href="https://lonely.example/atom"/>
                    <link rel="hub" href="https://hub.example/"/>
                </feed>"#;
            let parsed = ParsedFeed::parse("https://lonely.example/atom", xml.as_bytes()).unwrap();

            assert!(parsed.to_metadata().site_url.is_none());
        }

        #[test]
        fn test_missing_title_gets_placeholder() {
            let xml = r#"<rss version="2.0"><channel><link>https://x.example/</link></channel></rss>"#;
            let parsed = ParsedFeed::parse("https://x.example/rss", xml.as_bytes()).unwrap();
            assert_eq!(parsed.to_metadata().title, "Untitled Feed");
        }
    }

    mod entries_tests {
        use super::*;

        #[test]
        fn test_rss_entries_in_document_order_without_linkless_items() {
            let parsed = ParsedFeed::parse("https://ex.com/rss", RSS.as_bytes()).unwrap();
            let entries = parsed.to_entries();

            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].link, "https://ex.com/1");
            assert_eq!(entries[1].link, "https://ex.com/2");
        }

        #[test]
        fn test_summary_prefers_full_content() {
            let parsed = ParsedFeed::parse("https://ex.com/rss", RSS.as_bytes()).unwrap();
            let entries = parsed.to_entries();

            assert_eq!(
                entries[0].summary.as_deref(),
                Some("<p>The whole first post</p>")
            );
            assert_eq!(entries[1].summary.as_deref(), Some("Only a description"));
        }

        #[test]
        fn test_published_at_from_pub_date() {
            let parsed = ParsedFeed::parse("https://ex.com/rss", RSS.as_bytes()).unwrap();
            let entries = parsed.to_entries();

            assert_eq!(
                entries[0].published_at,
                Some(Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap())
            );
            assert_eq!(entries[1].published_at, None);
        }

        #[test]
        fn test_published_at_falls_back_to_updated() {
            let parsed =
                ParsedFeed::parse("https://atom.example/feed.xml", ATOM.as_bytes()).unwrap();
            let entries = parsed.to_entries();

            assert_eq!(
                entries[0].published_at,
                Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap())
            );
            assert_eq!(
                entries[1].published_at,
                Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap())
            );
        }

        #[test]
        fn test_author_only_when_name_present() {
            let parsed =
                ParsedFeed::parse("https://atom.example/feed.xml", ATOM.as_bytes()).unwrap();
            let entries = parsed.to_entries();

            assert_eq!(entries[0].author.as_deref(), Some("Jane Writer"));
            assert_eq!(entries[1].author, None);
        }

        #[test]
        fn test_missing_entry_title_gets_placeholder() {
            let xml = r#"<rss version="2.0"><channel><title>T</title>
                <item><link>https://x.example/a</link></item>
            </channel></rss>"#;
            let parsed = ParsedFeed::parse("https://x.example/rss", xml.as_bytes()).unwrap();
            assert_eq!(parsed.to_entries()[0].title, "Untitled");
        }
    }

    mod fetch_tests {
        use super::*;
        use crate::transport::DEFAULT_USER_AGENT;
        use std::time::Duration;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn fetcher() -> FeedFetcher {
            FeedFetcher::new(Transport::new(DEFAULT_USER_AGENT, Duration::from_secs(5)).unwrap())
        }

        #[test]
        fn test_parse_garbage_is_parse_error() {
            let err = ParsedFeed::parse("https://x.example/rss", b"this is not a feed").unwrap_err();
            assert!(matches!(err, FetchError::Parse(_)));
        }

        #[tokio::test]
        async fn test_fetch_parses_served_feed() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/rss"))
                .respond_with(ResponseTemplate::new(200).set_body_raw(RSS, "application/rss+xml"))
                .mount(&server)
                .await;

            let url = format!("{}/rss", server.uri());
            let parsed = fetcher().fetch(&url).await.unwrap();

            assert_eq!(parsed.feed_url(), url);
            assert_eq!(parsed.to_metadata().title, "Example Blog");
            assert_eq!(parsed.to_entries().len(), 2);
        }

        #[tokio::test]
        async fn test_fetch_distinguishes_status_from_parse_failure() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/gone"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/html"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_raw("<html><body>hi</body></html>", "text/html"),
                )
                .mount(&server)
                .await;

            let gone = fetcher()
                .fetch(&format!("{}/gone", server.uri()))
                .await
                .unwrap_err();
            assert!(matches!(gone, FetchError::HttpStatus(404)));

            let html = fetcher()
                .fetch(&format!("{}/html", server.uri()))
                .await
                .unwrap_err();
            assert!(matches!(html, FetchError::Parse(_)));
        }
    }
}
