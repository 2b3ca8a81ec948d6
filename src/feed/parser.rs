use chrono::{DateTime, Utc};
use feed_rs::parser;

use super::fetcher::FetchError;

/// One forum post as announced by the board's Atom feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub title: String,
    pub author: String,
    /// Canonical URL of the post.
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    pub updated: DateTime<Utc>,
}

/// A parsed feed document, owned by a single poll cycle.
///
/// `updated` is the document-level timestamp. It is optional here because a
/// board may omit it; whether that is acceptable is decided by the diff, not
/// by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedDocument {
    pub updated: Option<DateTime<Utc>>,
    pub entries: Vec<Entry>,
}

/// Parses raw feed bytes into a [`FeedDocument`], preserving entry order.
///
/// Timestamps are normalized to UTC by `feed-rs`, so offsets such as
/// `+02:00` compare correctly against each other.
///
/// # Errors
///
/// - [`FetchError::Parse`] if the bytes are not an RSS/Atom document
/// - [`FetchError::Malformed`] if an entry has no updated timestamp or no link
pub fn parse_document(bytes: &[u8]) -> Result<FeedDocument, FetchError> {
    let feed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let entries = feed
        .entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| convert_entry(index, entry))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(FeedDocument {
        updated: feed.updated,
        entries,
    })
}

fn convert_entry(index: usize, entry: feed_rs::model::Entry) -> Result<Entry, FetchError> {
    let updated = entry.updated.ok_or_else(|| {
        FetchError::Malformed(format!("entry {} ({}) has no updated timestamp", index, entry.id))
    })?;

    // phpBB emits a single alternate link per entry; prefer it when several exist
    let link = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.clone())
        .ok_or_else(|| FetchError::Malformed(format!("entry {} ({}) has no link", index, entry.id)))?;

    let title = entry
        .title
        .map(|t| t.content)
        .unwrap_or_else(|| "Untitled".to_string());

    let author = entry
        .authors
        .into_iter()
        .map(|p| p.name)
        .find(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    Ok(Entry {
        title,
        author,
        link,
        published: entry.published,
        updated,
    })
}
