//! Slash commands handled before a message reaches the completion stage.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use relay_agent::GeneratedImage;
use relay_store::{HistoryItem, HistoryPolicy, HistoryRole, HistoryStore};

use crate::api::PhotoSource;
use crate::context::{load_overrides, ChatContext};
use crate::error::StageError;
use crate::orchestrator;
use crate::pipeline::{Reply, RequestEnv};
use crate::send::clip;
use crate::types::Message;

/// Consulted for every text message. `Ok(None)` lets the message through to
/// the completion stage.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        message: &Message,
        ctx: &mut ChatContext,
        env: &RequestEnv<'_>,
    ) -> Result<Option<Reply>, StageError>;
}

const HELP: &str = "\
Available commands:
/help - show this message
/start - show your chat id and start a new conversation
/new - start a new conversation
/redo - ask the last question again, optionally with new text
/img <prompt> - generate an image
/setenv KEY=VALUE - change a setting for this chat
/delenv KEY - reset a setting for this chat
/system - show the current provider settings
/version - show the running version";

const NEW_CONVERSATION: &str = "A new conversation has started";
const ERROR_MAX_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command<'a> {
    Help,
    Start,
    New,
    Redo(&'a str),
    Img(&'a str),
    SetEnv(&'a str),
    DelEnv(&'a str),
    System,
    Version,
}

impl<'a> Command<'a> {
    /// `/name@bot args` → command; anything else → `None`.
    fn parse(text: &'a str) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let (head, arg) = match text.split_once(char::is_whitespace) {
            Some((head, arg)) => (head, arg.trim()),
            None => (text, ""),
        };
        let name = head.split('@').next().unwrap_or(head);
        let command = match name.to_ascii_lowercase().as_str() {
            "/help" => Command::Help,
            "/start" => Command::Start,
            "/new" => Command::New,
            "/redo" => Command::Redo(arg),
            "/img" => Command::Img(arg),
            "/setenv" => Command::SetEnv(arg),
            "/delenv" => Command::DelEnv(arg),
            "/system" => Command::System,
            "/version" => Command::Version,
            _ => return None,
        };
        Some(command)
    }
}

/// The commands every bot understands.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinCommands;

#[async_trait]
impl CommandHandler for BuiltinCommands {
    async fn handle(
        &self,
        message: &Message,
        ctx: &mut ChatContext,
        env: &RequestEnv<'_>,
    ) -> Result<Option<Reply>, StageError> {
        let Some(command) = message.text.as_deref().and_then(Command::parse) else {
            return Ok(None);
        };
        debug!(chat_id = ctx.scope.chat_id, ?command, "command");

        let reply = match command {
            Command::Help => Reply::Text(HELP.to_string()),
            Command::Start => {
                HistoryStore::new(env.store).clear(&ctx.keys.history).await?;
                Reply::Text(format!(
                    "Your chat id: {}\n{NEW_CONVERSATION}",
                    ctx.scope.chat_id
                ))
            }
            Command::New => {
                HistoryStore::new(env.store).clear(&ctx.keys.history).await?;
                Reply::Text(NEW_CONVERSATION.to_string())
            }
            Command::Redo(text) => redo(env, ctx, text).await?,
            Command::Img(prompt) => image(env, ctx, prompt).await?,
            Command::SetEnv(arg) => set_env(env, ctx, arg).await?,
            Command::DelEnv(key) => del_env(env, ctx, key).await?,
            Command::System => Reply::Text(system_summary(env, ctx)),
            Command::Version => Reply::Text(format!(
                "{} {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
        };
        Ok(Some(reply))
    }
}

/// Drop the last exchange and ask again, with `text` or the dropped question.
async fn redo(env: &RequestEnv<'_>, ctx: &mut ChatContext, text: &str) -> Result<Reply, StageError> {
    let store = HistoryStore::new(env.store);
    let policy = HistoryPolicy::from(env.history);
    // Trim with the same estimator the completion will use.
    let provider = env.registry.chat(&ctx.config).ok();
    let estimate = |s: &str| match &provider {
        Some(provider) => provider.estimate_tokens(s),
        None => relay_store::history::char_count(s),
    };
    let mut history = store.load(&ctx.keys.history, &policy, estimate).await;
    let previous = pop_last_question(&mut history);

    let question = if text.is_empty() {
        match previous {
            Some(question) => question,
            None => return Ok(Reply::Text("Nothing to redo".to_string())),
        }
    } else {
        text.to_string()
    };
    if !policy.is_disabled() {
        store.replace(&ctx.keys.history, &history).await?;
    }
    Ok(orchestrator::complete(env, ctx, question, Vec::new()).await)
}

/// Remove items from the end up to and including the last user turn.
fn pop_last_question(history: &mut Vec<HistoryItem>) -> Option<String> {
    while let Some(item) = history.pop() {
        if item.role == HistoryRole::User {
            return Some(item.content);
        }
    }
    None
}

async fn image(env: &RequestEnv<'_>, ctx: &ChatContext, prompt: &str) -> Result<Reply, StageError> {
    if prompt.is_empty() {
        return Ok(Reply::Text("Please enter a prompt, e.g. /img a cat in space".to_string()));
    }
    let provider = match env.registry.image(&ctx.config) {
        Ok(provider) => provider,
        Err(e) => return Ok(Reply::Text(e.to_string())),
    };
    if let Err(e) = env.messenger.send_chat_action(ctx.scope.chat_id, "upload_photo").await {
        debug!(chat_id = ctx.scope.chat_id, error = %e, "upload_photo action failed");
    }

    let photo = match provider.generate_image(prompt, &ctx.config).await {
        Ok(GeneratedImage::Url(url)) => PhotoSource::Url(url),
        Ok(GeneratedImage::Bytes(bytes)) => PhotoSource::Bytes(bytes),
        Err(e) => {
            warn!(chat_id = ctx.scope.chat_id, provider = %provider.kind(), error = %e, "image generation failed");
            let message = format!("Error: {e}");
            return Ok(Reply::Text(clip(&message, ERROR_MAX_CHARS).to_string()));
        }
    };
    let message_id = env.messenger.send_photo(&ctx.reply, photo).await?;
    Ok(Reply::Delivered { message_id })
}

async fn set_env(env: &RequestEnv<'_>, ctx: &mut ChatContext, arg: &str) -> Result<Reply, StageError> {
    let Some((key, raw)) = arg.split_once('=') else {
        return Ok(Reply::Text("Usage: /setenv KEY=VALUE".to_string()));
    };
    let (key, value) = match ctx.config.parse_override(key, raw) {
        Ok(parsed) => parsed,
        Err(e) => return Ok(Reply::Text(format!("Invalid setting: {e}"))),
    };

    let mut overrides = load_overrides(env.store, &ctx.keys.user_config).await;
    overrides.insert(key.clone(), value);
    save_overrides(env, ctx, overrides).await?;
    info!(chat_id = ctx.scope.chat_id, key = %key, "user config updated");
    Ok(Reply::Text(format!("Updated {key}")))
}

async fn del_env(env: &RequestEnv<'_>, ctx: &mut ChatContext, key: &str) -> Result<Reply, StageError> {
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() {
        return Ok(Reply::Text("Usage: /delenv KEY".to_string()));
    }
    let mut overrides = load_overrides(env.store, &ctx.keys.user_config).await;
    if overrides.remove(&key).is_none() {
        return Ok(Reply::Text(format!("{key} is not set for this chat")));
    }
    save_overrides(env, ctx, overrides).await?;
    info!(chat_id = ctx.scope.chat_id, key = %key, "user config override removed");
    Ok(Reply::Text(format!("Reset {key}")))
}

/// Persist `overrides` and re-resolve the context's config from them.
async fn save_overrides(
    env: &RequestEnv<'_>,
    ctx: &mut ChatContext,
    overrides: serde_json::Map<String, Value>,
) -> Result<(), StageError> {
    let json = serde_json::to_string(&overrides)
        .map_err(|e| StageError::Internal(format!("user config serialization: {e}")))?;
    env.store.put(&ctx.keys.user_config, &json, None).await?;
    ctx.config = env.defaults.with_overrides(&overrides);
    Ok(())
}

fn system_summary(env: &RequestEnv<'_>, ctx: &ChatContext) -> String {
    let config = &ctx.config;
    let enabled: Vec<&str> = env
        .registry
        .enabled_chat_kinds(config)
        .into_iter()
        .map(|k| k.as_str())
        .collect();
    let chat_status = if env.registry.chat(config).is_ok() {
        "ready"
    } else {
        "not enabled"
    };
    let image_status = if env.registry.image(config).is_ok() {
        "ready"
    } else {
        "not enabled"
    };
    let overrides = if config.define_keys.is_empty() {
        "none".to_string()
    } else {
        config.define_keys.join(", ")
    };
    format!(
        "Chat provider: {} ({chat_status})\nImage provider: {} ({image_status})\nProviders with credentials: {}\nStream mode: {}\nChat overrides: {overrides}",
        config.ai_provider,
        config.ai_image_provider,
        if enabled.is_empty() {
            "none".to_string()
        } else {
            enabled.join(", ")
        },
        env.telegram.stream_mode,
    )
}
