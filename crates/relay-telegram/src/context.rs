//! Per-message chat context and the process-wide bot identity cache.

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use relay_core::config::TelegramConfig;
use relay_core::{ChatScope, ChatType, DerivedKeys, UserConfig};
use relay_store::KvStore;

use crate::api::Messenger;
use crate::types::{Message, ReplyKeyboard};

/// The bot a webhook route belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    /// Numeric prefix of the token.
    pub id: i64,
    pub token: String,
    /// Username without `@`, once known.
    pub name: Option<String>,
}

/// `123456:ABC-DEF` → `123456`.
pub fn bot_id_from_token(token: &str) -> Option<i64> {
    token.split(':').next()?.trim().parse().ok()
}

/// Bot identities keyed by token. Created once at startup, never evicted.
#[derive(Default)]
pub struct BotIdentityCache {
    bots: DashMap<String, BotIdentity>,
}

impl BotIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity for `token`, seeded from the configured bot names.
    pub fn identity(&self, token: &str, config: &TelegramConfig) -> Option<BotIdentity> {
        if let Some(bot) = self.bots.get(token) {
            return Some(bot.clone());
        }
        let bot = BotIdentity {
            id: bot_id_from_token(token)?,
            token: token.to_string(),
            name: config.bot_name_for(token).map(String::from),
        };
        self.bots.insert(token.to_string(), bot.clone());
        Some(bot)
    }

    /// Bot username, asking Telegram on first use. Concurrent first calls may
    /// both hit `getMe`; either answer is the same.
    pub async fn resolve_name(&self, token: &str, messenger: &dyn Messenger) -> Option<String> {
        if let Some(name) = self.bots.get(token).and_then(|b| b.name.clone()) {
            return Some(name);
        }
        let name = match messenger.get_me().await {
            Ok(me) => me.username?,
            Err(e) => {
                warn!(error = %e, "getMe failed, bot name unknown");
                return None;
            }
        };
        debug!(bot = %name, "bot name resolved");
        if let Some(mut bot) = self.bots.get_mut(token) {
            bot.name = Some(name.clone());
        }
        Some(name)
    }
}

/// Draft state of the message the bot is currently answering with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveReply {
    pub chat_id: i64,
    /// Inbound message to reply to; set for group chats.
    pub reply_to_message_id: Option<i64>,
    /// Message being edited in place, once one was sent.
    pub message_id: Option<i64>,
    pub parse_mode: Option<String>,
    pub reply_markup: Option<ReplyKeyboard>,
    pub disable_link_preview: bool,
}

impl LiveReply {
    pub fn new(chat_id: i64) -> Self {
        Self {
            chat_id,
            ..Self::default()
        }
    }

    /// Same destination, but sent as a fresh message.
    pub fn fresh(&self) -> Self {
        Self {
            message_id: None,
            ..self.clone()
        }
    }
}

/// Everything the pipeline knows about the message being processed.
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub bot: BotIdentity,
    pub scope: ChatScope,
    pub keys: DerivedKeys,
    pub config: UserConfig,
    pub reply: LiveReply,
    extra_context: Option<String>,
    extra_context_used: bool,
}

impl ChatContext {
    pub fn new(bot: BotIdentity, scope: ChatScope, group_share_mode: bool, config: UserConfig) -> Self {
        let keys = DerivedKeys::derive(&scope, bot.id, group_share_mode);
        Self {
            reply: LiveReply::new(scope.chat_id),
            bot,
            scope,
            keys,
            config,
            extra_context: None,
            extra_context_used: false,
        }
    }

    /// Build the context for `message`. Per-chat overrides are read from
    /// `store` when one is configured; unreadable overrides are ignored.
    pub async fn resolve(
        message: &Message,
        bot: BotIdentity,
        telegram: &TelegramConfig,
        defaults: &UserConfig,
        store: Option<&dyn KvStore>,
    ) -> Self {
        let scope = ChatScope {
            chat_id: message.chat.id,
            chat_type: message.chat.kind,
            speaker_id: message.speaker_id(),
        };
        let mut ctx = Self::new(bot, scope, telegram.group_share_mode, defaults.clone());
        if let Some(store) = store {
            ctx.config = load_user_config(store, &ctx.keys.user_config, defaults).await;
        }

        ctx.reply.parse_mode = telegram.parse_mode.clone();
        if scope.chat_type != ChatType::Private {
            ctx.reply.reply_to_message_id = Some(message.message_id);
        }
        ctx
    }

    /// Store text carried over from a replied-to message. Refused once a
    /// value was set or consumed.
    pub fn set_extra_context(&mut self, text: impl Into<String>) -> bool {
        if self.extra_context.is_some() || self.extra_context_used {
            return false;
        }
        self.extra_context = Some(text.into());
        true
    }

    /// Hand out the carried-over text, at most once.
    pub fn take_extra_context(&mut self) -> Option<String> {
        let extra = self.extra_context.take()?;
        self.extra_context_used = true;
        Some(extra)
    }
}

/// Read the per-chat override object under `key`.
pub async fn load_overrides(store: &dyn KvStore, key: &str) -> Map<String, Value> {
    let raw = match store.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Map::new(),
        Err(e) => {
            warn!(key, error = %e, "user config read failed");
            return Map::new();
        }
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            warn!(key, "stored user config is not a JSON object, ignoring");
            Map::new()
        }
    }
}

async fn load_user_config(store: &dyn KvStore, key: &str, defaults: &UserConfig) -> UserConfig {
    let overrides = load_overrides(store, key).await;
    if overrides.is_empty() {
        return defaults.clone();
    }
    defaults.with_overrides(&overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chat, User};
    use relay_core::ProviderKind;
    use relay_store::MemoryKv;

    fn telegram() -> TelegramConfig {
        TelegramConfig {
            available_tokens: vec!["111:AAA".into(), "222:BBB".into()],
            bot_names: vec!["first_bot".into()],
            ..TelegramConfig::default()
        }
    }

    fn group_message() -> Message {
        Message {
            message_id: 9,
            from: Some(User {
                id: 7,
                ..User::default()
            }),
            chat: Chat {
                id: -100,
                kind: ChatType::Group,
                title: None,
            },
            text: Some("hi".into()),
            ..Message::default()
        }
    }

    #[test]
    fn identity_comes_from_token_and_config() {
        let cache = BotIdentityCache::new();
        let cfg = telegram();
        let first = cache.identity("111:AAA", &cfg).unwrap();
        assert_eq!(first.id, 111);
        assert_eq!(first.name.as_deref(), Some("first_bot"));
        let second = cache.identity("222:BBB", &cfg).unwrap();
        assert_eq!(second.name, None);
        assert!(cache.identity("not-a-token", &cfg).is_none());
    }

    #[tokio::test]
    async fn resolve_uses_speaker_keys_and_overrides() {
        let kv = MemoryKv::new();
        kv.put("user_config:-100:111:7", r#"{"ai_provider":"anthropic"}"#, None)
            .await
            .unwrap();
        let cfg = telegram();
        let bot = BotIdentityCache::new().identity("111:AAA", &cfg).unwrap();
        let ctx = ChatContext::resolve(
            &group_message(),
            bot,
            &cfg,
            &UserConfig::default(),
            Some(&kv as &dyn KvStore),
        )
        .await;
        assert_eq!(ctx.keys.history, "history:-100:111:7");
        assert_eq!(ctx.config.ai_provider, ProviderKind::Anthropic);
        assert_eq!(ctx.reply.reply_to_message_id, Some(9));
        assert_eq!(ctx.reply.parse_mode.as_deref(), Some("Markdown"));
    }

    #[tokio::test]
    async fn corrupt_overrides_fall_back_to_defaults() {
        let kv = MemoryKv::new();
        kv.put("user_config:-100:111:7", "[1,2]", None).await.unwrap();
        let cfg = telegram();
        let bot = BotIdentityCache::new().identity("111:AAA", &cfg).unwrap();
        let ctx = ChatContext::resolve(&group_message(), bot, &cfg, &UserConfig::default(), Some(&kv as &dyn KvStore)).await;
        assert_eq!(ctx.config, UserConfig::default());
    }

    #[test]
    fn extra_context_is_set_once_and_read_once() {
        let cfg = telegram();
        let bot = BotIdentityCache::new().identity("111:AAA", &cfg).unwrap();
        let scope = ChatScope {
            chat_id: 1,
            chat_type: ChatType::Private,
            speaker_id: 1,
        };
        let mut ctx = ChatContext::new(bot, scope, false, UserConfig::default());
        assert!(ctx.set_extra_context("quoted"));
        assert!(!ctx.set_extra_context("again"));
        assert_eq!(ctx.take_extra_context().as_deref(), Some("quoted"));
        assert_eq!(ctx.take_extra_context(), None);
        assert!(!ctx.set_extra_context("late"));
    }
}
