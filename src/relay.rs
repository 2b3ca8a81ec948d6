//! Announces new forum posts in the configured IRC channels.

use std::str::FromStr;

use crate::feed::Entry;
use crate::irc::IrcHandle;
use crate::util::{sanitize_irc_text, truncate_to_bytes};

/// mIRC bold toggle.
const BOLD: char = '\x02';

/// Budget for the message text. Leaves room for `PRIVMSG <channel> :`, the
/// server-added prefix and CRLF within the 512-byte line limit.
const MAX_ANNOUNCEMENT_BYTES: usize = 400;

/// Announcement language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    English,
    German,
}

impl Language {
    /// Resolves the `[interface] language` setting.
    ///
    /// `"auto"` (or an empty value) consults the locale environment. Unknown
    /// values fall back to English.
    pub fn from_setting(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("auto") {
            return Self::from_env();
        }
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(language = %value, "Unknown interface language, using English");
            Self::English
        })
    }

    /// Picks the language from `LC_ALL`, `LC_MESSAGES` or `LANG`, first
    /// non-empty wins.
    pub fn from_env() -> Self {
        let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.is_empty());
        locale.as_deref().map(Self::from_locale).unwrap_or_default()
    }

    /// Maps a POSIX locale such as `de_DE.UTF-8` to a language.
    pub fn from_locale(locale: &str) -> Self {
        let code = locale
            .split(['_', '.', '@', '-'])
            .next()
            .unwrap_or_default();
        code.parse().unwrap_or_default()
    }

    pub fn strings(self) -> Strings {
        match self {
            Language::English => Strings {
                new_post: "New post",
                by: "by",
            },
            Language::German => Strings {
                new_post: "Neuer Beitrag",
                by: "von",
            },
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Language::English),
            "de" | "german" | "deutsch" => Ok(Language::German),
            other => Err(format!("unsupported language: {}", other)),
        }
    }
}

/// Localized fragments of an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strings {
    pub new_post: &'static str,
    pub by: &'static str,
}

/// Builds the announcement text for one entry.
///
/// `\x02New post\x02: <title> by <author> - <link>`. Title and author are
/// stripped of control characters; an overlong title is shortened so the
/// link always survives.
pub fn format_announcement(entry: &Entry, strings: &Strings) -> String {
    let title = sanitize_irc_text(&entry.title);
    let author = sanitize_irc_text(&entry.author);
    let link = sanitize_irc_text(&entry.link);

    let head = format!("{b}{}{b}: ", strings.new_post, b = BOLD);
    let tail = format!(" {} {} - {}", strings.by, author, link);

    let room = MAX_ANNOUNCEMENT_BYTES.saturating_sub(head.len() + tail.len());
    let title = if title.len() > room {
        let cut = truncate_to_bytes(&title, room.saturating_sub(3));
        format!("{}...", cut.trim_end())
    } else {
        title.into_owned()
    };

    let mut text = format!("{}{}{}", head, title, tail);
    if text.len() > MAX_ANNOUNCEMENT_BYTES {
        text = truncate_to_bytes(&text, MAX_ANNOUNCEMENT_BYTES).to_string();
    }
    text
}

/// Watcher subscriber that queues announcements on the IRC session.
#[derive(Debug, Clone)]
pub struct Relay {
    handle: IrcHandle,
    channels: Vec<String>,
    strings: Strings,
}

impl Relay {
    pub fn new(handle: IrcHandle, channels: Vec<String>, language: Language) -> Self {
        Self {
            handle,
            channels,
            strings: language.strings(),
        }
    }

    /// Queues one PRIVMSG per entry and channel, entries in feed order.
    pub fn announce(&self, entries: &[Entry]) -> anyhow::Result<()> {
        for entry in entries {
            let text = format_announcement(entry, &self.strings);
            for channel in &self.channels {
                self.handle.privmsg(channel, &text)?;
            }
            tracing::info!(
                title = %entry.title,
                author = %entry.author,
                channels = self.channels.len(),
                "Announced new post"
            );
        }
        Ok(())
    }
}
