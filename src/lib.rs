//! Relays new phpBB forum posts from the board's Atom feed into IRC channels.
//!
//! The [`watcher`] polls the feed and notifies subscribers of entries newer
//! than its watermark; [`relay`] turns those entries into channel messages
//! sent through an [`irc`] session.

pub mod config;
pub mod feed;
pub mod irc;
pub mod relay;
pub mod util;
pub mod watcher;
