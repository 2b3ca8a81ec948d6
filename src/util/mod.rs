//! Utility functions shared by the feed and IRC layers.
//!
//! - **URL validation**: checks and normalizes the forum base URL
//! - **Text processing**: makes feed text safe to put on a single IRC line
//!
//! # Examples
//!
//! ```
//! use ircboard::util::{sanitize_irc_text, validate_base_url};
//!
//! let url = validate_base_url("https://forum.example.org/board").unwrap();
//! assert_eq!(url.as_str(), "https://forum.example.org/board/");
//!
//! assert_eq!(sanitize_irc_text("two\r\nlines"), "two lines");
//! ```

mod text;
mod url_validator;

pub use text::{sanitize_irc_text, truncate_to_bytes};
pub use url_validator::{validate_base_url, UrlValidationError};
