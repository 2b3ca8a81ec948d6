//! RFC 1459 message parsing and serialization.

use std::fmt;

/// CTCP messages are wrapped in this delimiter inside PRIVMSG/NOTICE text.
pub const CTCP_DELIM: char = '\x01';

/// A single IRC protocol line without the trailing CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source of the message (`nick!user@host` or a server name).
    pub prefix: Option<String>,
    /// Command word or three-digit numeric, upper-cased.
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.to_ascii_uppercase(),
            params,
        }
    }

    /// Parses one line as received from the server.
    ///
    /// IRCv3 message tags are skipped. Returns `None` for blank lines or a
    /// line with a prefix but no command.
    pub fn parse(line: &str) -> Option<Message> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        if rest.starts_with('@') {
            rest = rest.split_once(' ').map(|(_, r)| r)?;
        }
        rest = rest.trim_start_matches(' ');

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, r) = stripped.split_once(' ')?;
            rest = r.trim_start_matches(' ');
            Some(prefix.to_string())
        } else {
            None
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, r)) => (command, r),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, r)) => {
                    params.push(param.to_string());
                    rest = r;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Message {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nickname part of the prefix, if the message came from a user.
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        match prefix.split_once('!') {
            Some((nick, _)) => Some(nick),
            // Server prefixes contain dots and no '!'
            None if !prefix.contains('.') => Some(prefix),
            None => None,
        }
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Last parameter, which carries the free-form text of most commands.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// Splits a CTCP request out of the message text: `\x01VERSION\x01`
    /// yields `("VERSION", "")`.
    pub fn ctcp(&self) -> Option<(&str, &str)> {
        let text = self.trailing()?;
        let inner = text.strip_prefix(CTCP_DELIM)?;
        let inner = inner.strip_suffix(CTCP_DELIM).unwrap_or(inner);
        match inner.split_once(' ') {
            Some((command, args)) => Some((command, args)),
            None => Some((inner, "")),
        }
    }

    // ------------------------------------------------------------------------
    // Outbound command builders
    // ------------------------------------------------------------------------

    pub fn pass(password: &str) -> Self {
        Self::new("PASS", vec![password.to_string()])
    }

    pub fn nick_cmd(nickname: &str) -> Self {
        Self::new("NICK", vec![nickname.to_string()])
    }

    /// `USER` registration; mode `8` requests +i (invisible).
    pub fn user(username: &str, invisible: bool, realname: &str) -> Self {
        let mode = if invisible { "8" } else { "0" };
        Self::new(
            "USER",
            vec![
                username.to_string(),
                mode.to_string(),
                "*".to_string(),
                realname.to_string(),
            ],
        )
    }

    pub fn join(channel: &str) -> Self {
        Self::new("JOIN", vec![channel.to_string()])
    }

    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new("PRIVMSG", vec![target.to_string(), text.to_string()])
    }

    pub fn notice(target: &str, text: &str) -> Self {
        Self::new("NOTICE", vec![target.to_string(), text.to_string()])
    }

    pub fn pong(params: Vec<String>) -> Self {
        Self::new("PONG", params)
    }

    pub fn quit(reason: &str) -> Self {
        Self::new("QUIT", vec![reason.to_string()])
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let needs_colon =
                i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':'));
            if needs_colon {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}
