//! Minimal IRC client: line codec, protocol reactions and the connection loop.

pub mod handler;
pub mod message;
pub mod session;

pub use message::Message;
pub use session::{IrcError, IrcHandle, IrcSession, IrcSettings, SessionEvent};
