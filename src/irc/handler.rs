//! Reactions to inbound IRC traffic.
//!
//! [`Reactor`] holds no I/O. It maps each inbound [`Message`] to the actions
//! the session should take, which keeps the self-service behaviors (rejoin,
//! nick fallback, ChanServ requests, NickServ identification) unit-testable.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;

use super::message::{Message, CTCP_DELIM};
use super::session::IrcSettings;

/// Delay before rejoining a channel we were kicked from.
pub const REJOIN_DELAY: Duration = Duration::from_secs(5);

/// Reply to CTCP VERSION requests.
pub const VERSION_REPLY: &str = "phpBB IRC bot";

const NICKSERV: &str = "NickServ";
const CHANSERV: &str = "ChanServ";
const HOSTSERV: &str = "HostServ";
const NICKSERV_CHALLENGE: &str = "This nickname is registered";

const RPL_WELCOME: &str = "001";
const RPL_ENDOFMOTD: &str = "376";
const ERR_NOMOTD: &str = "422";
const ERR_NICKNAMEINUSE: &str = "433";
const ERR_NICKCOLLISION: &str = "436";
const ERR_INVITEONLYCHAN: &str = "473";
const ERR_BANNEDFROMCHAN: &str = "474";

/// What the session should do in response to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write this message now.
    Send(Message),
    /// Write this message after a delay.
    SendAfter(Duration, Message),
    /// Registration finished; the configured channels have been joined.
    Registered,
}

/// Per-connection protocol state.
pub struct Reactor {
    settings: Arc<IrcSettings>,
    nickname: String,
    registered: bool,
}

impl Reactor {
    pub fn new(settings: Arc<IrcSettings>) -> Self {
        let nickname = settings.nickname.clone();
        Self {
            settings,
            nickname,
            registered: false,
        }
    }

    /// Nickname as currently known to the server.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    fn is_me(&self, nick: &str) -> bool {
        nick.eq_ignore_ascii_case(&self.nickname)
    }

    fn is_configured_channel(&self, channel: &str) -> bool {
        self.settings
            .channels
            .iter()
            .any(|c| c.eq_ignore_ascii_case(channel))
    }

    pub fn handle(&mut self, msg: &Message) -> Vec<Action> {
        match msg.command.as_str() {
            "PING" => vec![Action::Send(Message::pong(msg.params.clone()))],
            RPL_WELCOME => {
                if let Some(nick) = msg.param(0) {
                    self.nickname = nick.to_string();
                }
                Vec::new()
            }
            RPL_ENDOFMOTD | ERR_NOMOTD => self.on_end_of_motd(),
            ERR_NICKNAMEINUSE | ERR_NICKCOLLISION => {
                let fallback = format!("{}`", self.nickname);
                tracing::info!(taken = %self.nickname, fallback = %fallback, "Nickname unavailable");
                self.nickname = fallback;
                vec![Action::Send(Message::nick_cmd(&self.nickname))]
            }
            ERR_INVITEONLYCHAN => self.ask_chanserv(msg, "INVITE"),
            ERR_BANNEDFROMCHAN => self.ask_chanserv(msg, "UNBAN"),
            "KICK" => self.on_kick(msg),
            "INVITE" => self.on_invite(msg),
            "JOIN" => {
                let channel = msg.param(0).unwrap_or_default();
                match msg.nick() {
                    Some(nick) if self.is_me(nick) => {
                        tracing::info!(channel = %channel, "Joined channel")
                    }
                    Some(nick) => tracing::debug!(channel = %channel, nick = %nick, "User joined"),
                    None => {}
                }
                Vec::new()
            }
            "PART" => {
                let channel = msg.param(0).unwrap_or_default();
                match msg.nick() {
                    Some(nick) if self.is_me(nick) => {
                        tracing::info!(channel = %channel, "Left channel")
                    }
                    Some(nick) => tracing::debug!(channel = %channel, nick = %nick, "User left"),
                    None => {}
                }
                Vec::new()
            }
            "NICK" => {
                let new_nick = msg.param(0).unwrap_or_default().to_string();
                match msg.nick() {
                    Some(old) if self.is_me(old) => {
                        tracing::info!(nickname = %new_nick, "Own nickname changed");
                        self.nickname = new_nick;
                    }
                    Some(old) => {
                        tracing::debug!(old = %old, new = %new_nick, "User changed nickname")
                    }
                    None => {}
                }
                Vec::new()
            }
            "PRIVMSG" => self.on_privmsg(msg),
            "NOTICE" => self.on_services_notice(msg),
            "ERROR" => {
                tracing::warn!(reason = %msg.trailing().unwrap_or_default(), "Server sent ERROR");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_end_of_motd(&mut self) -> Vec<Action> {
        if self.registered {
            return Vec::new();
        }
        self.registered = true;

        let mut actions: Vec<Action> = self
            .settings
            .channels
            .iter()
            .map(|channel| Action::Send(Message::join(channel)))
            .collect();
        actions.push(Action::Registered);
        actions
    }

    fn ask_chanserv(&self, msg: &Message, request: &str) -> Vec<Action> {
        let Some(channel) = msg.param(1) else {
            return Vec::new();
        };
        tracing::info!(channel = %channel, request = %request, "Cannot join channel, asking ChanServ");
        vec![Action::Send(Message::privmsg(
            CHANSERV,
            &format!("{} {}", request, channel),
        ))]
    }

    fn on_kick(&self, msg: &Message) -> Vec<Action> {
        let (Some(channel), Some(victim)) = (msg.param(0), msg.param(1)) else {
            return Vec::new();
        };
        if !self.is_me(victim) {
            return Vec::new();
        }
        tracing::warn!(
            channel = %channel,
            by = %msg.nick().unwrap_or_default(),
            reason = %msg.param(2).unwrap_or_default(),
            "Kicked from channel, rejoining"
        );
        vec![Action::SendAfter(REJOIN_DELAY, Message::join(channel))]
    }

    fn on_invite(&self, msg: &Message) -> Vec<Action> {
        let Some(channel) = msg.trailing() else {
            return Vec::new();
        };
        if !self.is_configured_channel(channel) {
            tracing::debug!(channel = %channel, "Ignoring invite to unconfigured channel");
            return Vec::new();
        }
        vec![Action::Send(Message::join(channel))]
    }

    fn on_privmsg(&self, msg: &Message) -> Vec<Action> {
        let Some(from) = msg.nick() else {
            return Vec::new();
        };

        if let Some((command, _)) = msg.ctcp() {
            tracing::info!(command = %command, from = %from, "Received CTCP");
            if command.eq_ignore_ascii_case("VERSION") {
                let reply = format!("{d}VERSION {}{d}", VERSION_REPLY, d = CTCP_DELIM);
                return vec![Action::Send(Message::notice(from, &reply))];
            }
            return Vec::new();
        }

        self.on_services_notice(msg)
    }

    fn on_services_notice(&self, msg: &Message) -> Vec<Action> {
        let from_nickserv = msg.nick().is_some_and(|n| n.eq_ignore_ascii_case(NICKSERV));
        let challenged = msg
            .trailing()
            .is_some_and(|text| text.contains(NICKSERV_CHALLENGE));
        if !from_nickserv || !challenged {
            return Vec::new();
        }

        let Some(password) = &self.settings.nickserv_password else {
            tracing::warn!("NickServ asks for identification but no password is configured");
            return Vec::new();
        };

        tracing::info!("Identifying with NickServ");
        vec![
            Action::Send(Message::privmsg(
                NICKSERV,
                &format!("IDENTIFY {}", password.expose_secret()),
            )),
            Action::Send(Message::privmsg(HOSTSERV, "ON")),
        ]
    }
}
