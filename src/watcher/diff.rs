//! Watermark-based detection of new forum posts.

use chrono::{DateTime, Utc};

use crate::feed::{Entry, FeedDocument, FetchError};

/// Outcome of comparing one feed document against the watermark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    /// Entries strictly newer than the input watermark, in document order.
    pub entries: Vec<Entry>,
    /// Watermark to use for the next cycle.
    pub watermark: DateTime<Utc>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Selects the entries of `doc` updated strictly after `watermark`.
///
/// Order is preserved exactly as the document lists it. When nothing
/// qualifies, the watermark is returned unchanged.
///
/// When something qualifies, the new watermark is the *document's* updated
/// timestamp, not the newest entry's. phpBB bumps the feed timestamp on any
/// board activity, so it may legitimately exceed every entry. It may also lag
/// behind an entry, in which case that entry is reported again on the next
/// cycle. This quirk is kept on purpose. The only correction applied is that
/// the watermark never moves backwards.
///
/// # Errors
///
/// [`FetchError::Malformed`] if entries qualify but the document has no
/// updated timestamp. The whole cycle fails; nothing is reported.
pub fn diff(doc: FeedDocument, watermark: DateTime<Utc>) -> Result<Diff, FetchError> {
    let entries: Vec<Entry> = doc
        .entries
        .into_iter()
        .filter(|entry| entry.updated > watermark)
        .collect();

    if entries.is_empty() {
        return Ok(Diff {
            entries,
            watermark,
        });
    }

    let document_updated = doc.updated.ok_or_else(|| {
        FetchError::Malformed("feed has new entries but no document-level updated timestamp".into())
    })?;

    Ok(Diff {
        entries,
        watermark: document_updated.max(watermark),
    })
}
