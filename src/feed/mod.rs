//! Forum feed retrieval and parsing.
//!
//! - [`parser`] - Converts Atom/RSS bytes into a [`FeedDocument`] using `feed-rs`
//! - [`fetcher`] - Builds the phpBB `feed.php` URL and fetches it with `reqwest`
//!
//! # Example
//!
//! ```ignore
//! use ircboard::feed::{FeedSource, FetchFeed, HttpFeedFetcher};
//!
//! let source = FeedSource::new(base_url, 2, Duration::from_secs(30));
//! let doc = HttpFeedFetcher::new().fetch(&source).await?;
//! ```

mod fetcher;
mod parser;

pub use fetcher::{FeedSource, FetchError, FetchFeed, HttpFeedFetcher};
pub use parser::{parse_document, Entry, FeedDocument};
