use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::user_config::UserConfig;

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";
/// Number of recent message ids remembered per chat for duplicate suppression.
pub const DEFAULT_DEDUP_WINDOW: usize = 100;

/// Top-level config (relay.toml + RELAY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Process-wide user config, overlaid on the built-in defaults.
    /// Per-chat overrides stored by `/setenv` are applied on top at request time.
    #[serde(default)]
    pub defaults: UserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

/// Telegram bot settings: tokens, allow-lists and behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot tokens served by this process; each gets its own webhook route.
    pub available_tokens: Vec<String>,
    /// Bot usernames, matched to `available_tokens` by index. Missing entries
    /// are resolved with `getMe` on first use.
    pub bot_names: Vec<String>,
    pub api_domain: String,
    /// Private chat ids allowed to talk to the bot.
    pub chat_allow_list: Vec<String>,
    /// Group / supergroup chat ids allowed to talk to the bot.
    pub group_allow_list: Vec<String>,
    /// Skip every allow-list check.
    pub open_to_all: bool,
    pub group_chat_enabled: bool,
    /// Share one history between all members of a group instead of one per speaker.
    pub group_share_mode: bool,
    /// Duplicate message suppression.
    pub safe_mode: bool,
    /// Store a short-lived snapshot of every inbound message.
    pub debug_mode: bool,
    pub stream_mode: bool,
    /// Prepend the text of a replied-to (non-bot) message to the prompt.
    pub extra_message_context: bool,
    pub show_reply_button: bool,
    pub parse_mode: Option<String>,
    /// Which photo size to forward: 0 = smallest, -1 = largest.
    pub photo_size_offset: i64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            available_tokens: Vec::new(),
            bot_names: Vec::new(),
            api_domain: DEFAULT_TELEGRAM_API.to_string(),
            chat_allow_list: Vec::new(),
            group_allow_list: Vec::new(),
            open_to_all: false,
            group_chat_enabled: true,
            group_share_mode: false,
            safe_mode: true,
            debug_mode: false,
            stream_mode: true,
            extra_message_context: false,
            show_reply_button: false,
            parse_mode: Some("Markdown".to_string()),
            photo_size_offset: -1,
        }
    }
}

impl TelegramConfig {
    pub fn is_known_token(&self, token: &str) -> bool {
        self.available_tokens.iter().any(|t| t.trim() == token)
    }

    /// Configured username for `token`, if one was given at the same index.
    pub fn bot_name_for(&self, token: &str) -> Option<&str> {
        let idx = self
            .available_tokens
            .iter()
            .position(|t| t.trim() == token)?;
        self.bot_names
            .get(idx)
            .map(|n| n.trim().trim_start_matches('@'))
            .filter(|n| !n.is_empty())
    }
}

/// History trimming policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub auto_trim: bool,
    /// Maximum items kept. With `auto_trim` on, a value <= 0 disables history.
    pub max_length: i64,
    /// Maximum summed token estimate kept. Negative disables budget trimming.
    pub max_tokens: i64,
    pub dedup_window: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            auto_trim: true,
            max_length: 20,
            max_tokens: 2048,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file backing the key-value store. Empty disables persistence.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    pub fn store_path(&self) -> Option<&str> {
        let path = self.path.trim();
        (!path.is_empty()).then_some(path)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.db", home)
}

impl RelayConfig {
    /// Load config from a TOML file with RELAY_* env var overrides.
    ///
    /// Nested keys use a double underscore: `RELAY_TELEGRAM__SAFE_MODE=false`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("RELAY_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::RelayError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relay/relay.toml", home)
}
