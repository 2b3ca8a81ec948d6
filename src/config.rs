//! Configuration file parser for `ircboard.toml`.
//!
//! Unlike most settings files the config is mandatory: without a server and
//! a forum there is nothing to bridge. Sections may be partial; missing keys
//! fall back to defaults and unknown keys are logged as warnings.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::FeedSource;
use crate::irc::IrcSettings;
use crate::relay::Language;
use crate::util::validate_base_url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// Custom Debug impls on the sections mask passwords so the config can be
/// logged safely.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channels to join and announce in.
    pub channels: Vec<String>,
    pub interface: InterfaceConfig,
    pub server: ServerConfig,
    pub bot: BotConfig,
    pub nickserv: NickServConfig,
    pub forum: ForumConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// `"auto"`, `"en"` or `"de"`.
    pub language: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            language: "auto".to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connect with TLS.
    pub secure: bool,
    /// Server password; empty means none.
    pub password: String,
    pub autoreconnect: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 6667,
            secure: false,
            password: String::new(),
            autoreconnect: true,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("password", &redacted(&self.password))
            .field("autoreconnect", &self.autoreconnect)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub nickname: String,
    pub username: String,
    pub realname: String,
    /// Request user mode +i on registration.
    pub invisible: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            nickname: "ForumBot".to_string(),
            username: "forumbot".to_string(),
            realname: "phpBB IRC bot".to_string(),
            invisible: true,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct NickServConfig {
    /// Password sent with `IDENTIFY`; empty disables identification.
    pub authentication: String,
}

impl std::fmt::Debug for NickServConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NickServConfig")
            .field("authentication", &redacted(&self.authentication))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForumConfig {
    /// Board root, e.g. `https://forum.example.org/`.
    pub base_url: String,
    /// phpBB forum id; `0` is the board-wide feed.
    pub subforum_id: u32,
    pub check_interval_secs: u64,
}

impl Default for ForumConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            subforum_id: 0,
            check_interval_secs: 30,
        }
    }
}

fn redacted(secret: &str) -> Option<&'static str> {
    (!secret.is_empty()).then_some("[REDACTED]")
}

fn non_empty_secret(value: &str) -> Option<SecretString> {
    (!value.is_empty()).then(|| SecretString::from(value.to_string()))
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Shortest accepted poll interval.
    pub const MIN_CHECK_INTERVAL_SECS: u64 = 5;

    const KNOWN_KEYS: [&'static str; 6] =
        ["channels", "interface", "server", "bot", "nickserv", "forum"];

    /// Load and validate configuration from a TOML file.
    ///
    /// - Missing file → `Err(ConfigError::Io)`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown top-level keys → accepted, logged as warning
    /// - Failed validation → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            host = %config.server.host,
            channels = config.channels.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        // Parse as a raw table first to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host must not be empty".into()));
        }
        if self.bot.nickname.trim().is_empty() {
            return Err(ConfigError::Invalid("bot.nickname must not be empty".into()));
        }
        if self.channels.iter().all(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "at least one channel must be configured".into(),
            ));
        }
        if self.forum.check_interval_secs < Self::MIN_CHECK_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "forum.check_interval_secs must be at least {} (got {})",
                Self::MIN_CHECK_INTERVAL_SECS,
                self.forum.check_interval_secs
            )));
        }
        validate_base_url(&self.forum.base_url)
            .map_err(|e| ConfigError::Invalid(format!("forum.base_url: {}", e)))?;
        Ok(())
    }

    /// Non-empty channel names, trimmed.
    pub fn channel_list(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn language(&self) -> Language {
        Language::from_setting(&self.interface.language)
    }

    pub fn feed_source(&self) -> Result<FeedSource, ConfigError> {
        let base_url = validate_base_url(&self.forum.base_url)
            .map_err(|e| ConfigError::Invalid(format!("forum.base_url: {}", e)))?;
        Ok(FeedSource::new(
            base_url,
            self.forum.subforum_id,
            Duration::from_secs(self.forum.check_interval_secs),
        ))
    }

    pub fn irc_settings(&self) -> IrcSettings {
        let username = if self.bot.username.trim().is_empty() {
            self.bot.nickname.clone()
        } else {
            self.bot.username.clone()
        };
        IrcSettings {
            host: self.server.host.trim().to_string(),
            port: self.server.port,
            secure: self.server.secure,
            password: non_empty_secret(&self.server.password),
            autoreconnect: self.server.autoreconnect,
            nickname: self.bot.nickname.trim().to_string(),
            username,
            realname: self.bot.realname.clone(),
            invisible: self.bot.invisible,
            nickserv_password: non_empty_secret(&self.nickserv.authentication),
            channels: self.channel_list(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
