//! RSS/Atom parsing on top of `feed-rs`.
//!
//! The poller only needs a link, a title, and a publication date per item.
//! Items without a usable link (no explicit link and a GUID that is not an
//! http URL) are counted as skipped rather than failing the whole feed.

use chrono::{DateTime, Utc};

/// One usable item out of a feed.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub link: String,
    pub title: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Parsed feed: the usable items plus how many entries were dropped.
#[derive(Debug)]
pub struct ParsedFeed {
    pub items: Vec<FeedItem>,
    pub skipped: usize,
}

/// Parse a feed body as RSS 2.0 or Atom.
pub fn parse_feed(body: &[u8]) -> Result<ParsedFeed, feed_rs::parser::ParseFeedError> {
    let feed = feed_rs::parser::parse(body)?;

    let mut items = Vec::with_capacity(feed.entries.len());
    let mut skipped = 0;

    for entry in feed.entries {
        let link = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .or_else(|| {
                // RSS GUIDs are frequently permalinks; accept them when they
                // look like one.
                if entry.id.starts_with("http") {
                    Some(entry.id.clone())
                } else {
                    None
                }
            });

        match link {
            Some(link) => items.push(FeedItem {
                link,
                title: entry.title.map(|t| t.content),
                published: entry.published.or(entry.updated),
            }),
            None => skipped += 1,
        }
    }

    Ok(ParsedFeed { items, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example News</title>
    <item>
        <guid>https://example.com/story-1</guid>
        <title>First story</title>
    </item>
    <item>
        <link>https://example.com/story-2</link>
        <title>Second story</title>
        <pubDate>Mon, 02 Mar 2026 09:30:00 GMT</pubDate>
    </item>
    <item>
        <guid isPermaLink="false">tag:no-link</guid>
        <title>Unusable item</title>
    </item>
</channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
    <title>Example Atom</title>
    <id>urn:feed</id>
    <updated>2026-03-02T09:30:00Z</updated>
    <entry>
        <id>urn:entry-1</id>
        <title>Atom entry</title>
        <link href="https://example.com/atom-1"/>
        <updated>2026-03-02T09:30:00Z</updated>
    </entry>
</feed>"#;

    #[test]
    fn rss_items_use_link_or_http_guid() {
        let parsed = parse_feed(RSS.as_bytes()).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.skipped, 1);

        let links: Vec<&str> = parsed.items.iter().map(|i| i.link.as_str()).collect();
        assert!(links.contains(&"https://example.com/story-1"));
        assert!(links.contains(&"https://example.com/story-2"));
    }

    #[test]
    fn atom_entries_parse() {
        let parsed = parse_feed(ATOM.as_bytes()).unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].link, "https://example.com/atom-1");
        assert!(parsed.items[0].published.is_some());
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_feed(b"<not really xml").is_err());
    }
}
