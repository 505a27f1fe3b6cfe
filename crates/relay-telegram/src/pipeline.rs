//! Inbound message pipeline.
//!
//! Every update walks [`Stage::ORDER`]. A stage answers with an [`Outcome`];
//! errors raised inside a stage are turned into `Outcome::Fail` by the driver,
//! which is the only place besides the completion orchestrator that converts
//! errors into something the caller sees.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_agent::ProviderRegistry;
use relay_core::config::{HistoryConfig, TelegramConfig};
use relay_core::{ChatType, RelayConfig, UserConfig};
use relay_store::{dedup, KvStore};

use crate::api::Messenger;
use crate::commands::{BuiltinCommands, CommandHandler};
use crate::context::{BotIdentityCache, ChatContext, LiveReply};
use crate::error::StageError;
use crate::mention::check_mention;
use crate::orchestrator;
use crate::types::{find_photo_file_id, Message, Update};

/// Lifetime of the debug snapshot of an inbound message.
const SNAPSHOT_TTL: Duration = Duration::from_secs(3600);

/// What the chat gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Text the driver still has to send.
    Text(String),
    /// Already sent by the stage that produced it.
    Delivered { message_id: i64 },
    Silent,
}

#[derive(Debug)]
pub enum Outcome {
    Continue,
    Stop(Reply),
    Fail(StageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveContext,
    CheckReady,
    FilterUnsupported,
    GroupAddressing,
    AccessControl,
    SuppressDuplicates,
    SnapshotMessage,
    DispatchCommand,
    Complete,
}

impl Stage {
    pub const ORDER: [Stage; 9] = [
        Stage::ResolveContext,
        Stage::CheckReady,
        Stage::FilterUnsupported,
        Stage::GroupAddressing,
        Stage::AccessControl,
        Stage::SuppressDuplicates,
        Stage::SnapshotMessage,
        Stage::DispatchCommand,
        Stage::Complete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::ResolveContext => "resolve_context",
            Stage::CheckReady => "check_ready",
            Stage::FilterUnsupported => "filter_unsupported",
            Stage::GroupAddressing => "group_addressing",
            Stage::AccessControl => "access_control",
            Stage::SuppressDuplicates => "suppress_duplicates",
            Stage::SnapshotMessage => "snapshot_message",
            Stage::DispatchCommand => "dispatch_command",
            Stage::Complete => "complete",
        }
    }
}

/// Collaborators handed to commands and the orchestrator once storage is
/// known to be available.
pub struct RequestEnv<'a> {
    pub messenger: &'a Arc<dyn Messenger>,
    pub store: &'a dyn KvStore,
    pub registry: &'a ProviderRegistry,
    pub history: &'a HistoryConfig,
    pub telegram: &'a TelegramConfig,
    /// Process-wide user config that per-chat overrides are applied to.
    pub defaults: &'a UserConfig,
    /// Cancelled when the process shuts down; cuts rate-limit waits short.
    pub shutdown: &'a CancellationToken,
}

/// Per-update state threaded through the stages.
struct Request<'a> {
    token: &'a str,
    message: Message,
    ctx: Option<ChatContext>,
    messenger: Arc<dyn Messenger>,
}

fn unresolved() -> StageError {
    StageError::Internal("chat context not resolved".to_string())
}

pub struct Pipeline {
    telegram: TelegramConfig,
    history: HistoryConfig,
    defaults: UserConfig,
    store: Option<Arc<dyn KvStore>>,
    registry: Arc<ProviderRegistry>,
    bots: Arc<BotIdentityCache>,
    commands: Arc<dyn CommandHandler>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(
        config: &RelayConfig,
        store: Option<Arc<dyn KvStore>>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            telegram: config.telegram.clone(),
            history: config.history.clone(),
            defaults: config.defaults.clone(),
            store,
            registry,
            bots: Arc::new(BotIdentityCache::new()),
            commands: Arc::new(BuiltinCommands),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandHandler>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_bot_cache(mut self, bots: Arc<BotIdentityCache>) -> Self {
        self.bots = bots;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn telegram(&self) -> &TelegramConfig {
        &self.telegram
    }

    /// Entry point for one webhook delivery.
    pub async fn handle_update(
        &self,
        token: &str,
        update: Update,
        messenger: Arc<dyn Messenger>,
    ) -> Outcome {
        if update.edited_message.is_some() {
            debug!(update_id = update.update_id, "edited message ignored");
            return Outcome::Fail(StageError::EditedMessage);
        }
        let Some(message) = update.message else {
            debug!(update_id = update.update_id, "update without message");
            return Outcome::Fail(StageError::InvalidMessage);
        };
        self.run(token, message, messenger).await
    }

    /// Drive `message` through every stage until one stops or fails.
    pub async fn run(&self, token: &str, message: Message, messenger: Arc<dyn Messenger>) -> Outcome {
        let mut req = Request {
            token,
            message,
            ctx: None,
            messenger,
        };

        for stage in Stage::ORDER {
            let outcome = match self.run_stage(stage, &mut req).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Fail(e),
            };
            match outcome {
                Outcome::Continue => {}
                Outcome::Stop(reply) => return self.deliver(&req, stage, reply).await,
                Outcome::Fail(e) => {
                    let chat_id = req.message.chat.id;
                    if e.is_control_flow() {
                        info!(chat_id, stage = stage.name(), code = e.code(), "message dropped");
                    } else {
                        error!(chat_id, stage = stage.name(), error = %e, "pipeline failed");
                    }
                    return Outcome::Fail(e);
                }
            }
        }
        Outcome::Stop(Reply::Silent)
    }

    /// Send a pending text reply; anything else passes through.
    async fn deliver(&self, req: &Request<'_>, stage: Stage, reply: Reply) -> Outcome {
        let text = match reply {
            Reply::Text(text) => text,
            other => {
                debug!(chat_id = req.message.chat.id, stage = stage.name(), reply = ?other, "pipeline stopped");
                return Outcome::Stop(other);
            }
        };
        let target = match &req.ctx {
            Some(ctx) => ctx.reply.clone(),
            None => LiveReply::new(req.message.chat.id),
        };
        match req.messenger.send_text(&target, &text).await {
            Ok(message_id) => {
                debug!(chat_id = target.chat_id, stage = stage.name(), message_id, "reply sent");
                Outcome::Stop(Reply::Delivered { message_id })
            }
            Err(e) => {
                error!(chat_id = target.chat_id, stage = stage.name(), error = %e, "reply send failed");
                Outcome::Fail(e.into())
            }
        }
    }

    fn env<'a>(&'a self, messenger: &'a Arc<dyn Messenger>) -> Result<RequestEnv<'a>, StageError> {
        let store = self
            .store
            .as_deref()
            .ok_or_else(|| StageError::Internal("store not configured".to_string()))?;
        Ok(RequestEnv {
            messenger,
            store,
            registry: &self.registry,
            history: &self.history,
            telegram: &self.telegram,
            defaults: &self.defaults,
            shutdown: &self.shutdown,
        })
    }

    async fn run_stage(&self, stage: Stage, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        match stage {
            Stage::ResolveContext => self.resolve_context(req).await,
            Stage::CheckReady => Ok(self.check_ready()),
            Stage::FilterUnsupported => {
                if req.message.has_supported_content() {
                    Ok(Outcome::Continue)
                } else {
                    Err(StageError::UnsupportedMessage)
                }
            }
            Stage::GroupAddressing => self.group_addressing(req).await,
            Stage::AccessControl => self.access_control(req),
            Stage::SuppressDuplicates => self.suppress_duplicates(req).await,
            Stage::SnapshotMessage => self.snapshot_message(req).await,
            Stage::DispatchCommand => self.dispatch_command(req).await,
            Stage::Complete => self.complete(req).await,
        }
    }

    async fn resolve_context(&self, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        if !self.telegram.is_known_token(req.token) {
            return Err(StageError::UnknownBot);
        }
        let bot = self
            .bots
            .identity(req.token, &self.telegram)
            .ok_or(StageError::UnknownBot)?;
        let mut ctx = ChatContext::resolve(
            &req.message,
            bot,
            &self.telegram,
            &self.defaults,
            self.store.as_deref(),
        )
        .await;

        if self.telegram.extra_message_context {
            if let Some(replied) = &req.message.reply_to_message {
                let from_bot = replied.from.as_ref().is_some_and(|u| u.is_bot);
                let quoted = replied.content();
                if !from_bot && !quoted.is_empty() {
                    ctx.set_extra_context(quoted);
                }
            }
        }

        debug!(
            chat_id = ctx.scope.chat_id,
            chat_type = ctx.scope.chat_type.as_str(),
            provider = %ctx.config.ai_provider,
            "context resolved"
        );
        req.ctx = Some(ctx);
        Ok(Outcome::Continue)
    }

    fn check_ready(&self) -> Outcome {
        if self.store.is_none() {
            warn!("no store configured");
            return Outcome::Stop(Reply::Text("DATABASE Not Set".to_string()));
        }
        Outcome::Continue
    }

    async fn group_addressing(&self, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        let Request {
            token,
            message,
            ctx,
            messenger,
        } = req;
        let ctx = ctx.as_mut().ok_or_else(unresolved)?;
        if ctx.scope.chat_type == ChatType::Private {
            return Ok(Outcome::Continue);
        }

        let replies_to_bot = message
            .reply_to_message
            .as_ref()
            .and_then(|m| m.from.as_ref())
            .is_some_and(|u| u.id == ctx.bot.id);
        if replies_to_bot {
            return Ok(Outcome::Continue);
        }

        let name = match ctx.bot.name.clone() {
            Some(name) => name,
            None => self
                .bots
                .resolve_name(*token, &**messenger)
                .await
                .ok_or(StageError::BotNameUnavailable)?,
        };
        ctx.bot.name = Some(name.clone());

        let mut mentioned = false;
        if let Some(text) = message.text.as_deref() {
            let check = check_mention(text, &message.entities, &name, ctx.bot.id);
            if check.mentioned {
                mentioned = true;
                message.text = Some(check.content.trim().to_string());
            }
        }
        if let Some(caption) = message.caption.as_deref() {
            let check = check_mention(caption, &message.caption_entities, &name, ctx.bot.id);
            if check.mentioned {
                mentioned = true;
                message.caption = Some(check.content.trim().to_string());
            }
        }

        if mentioned {
            Ok(Outcome::Continue)
        } else {
            Err(StageError::NotMentioned)
        }
    }

    fn access_control(&self, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        if self.telegram.open_to_all {
            return Ok(Outcome::Continue);
        }
        let ctx = req.ctx.as_ref().ok_or_else(unresolved)?;
        let chat_id = ctx.scope.chat_id.to_string();
        let listed = |list: &[String]| list.iter().any(|id| id.trim() == chat_id);

        let chat_type = ctx.scope.chat_type;
        if chat_type == ChatType::Private {
            if !listed(&self.telegram.chat_allow_list) {
                return Ok(Outcome::Stop(Reply::Text(format!(
                    "You are not in the allow list, please contact the administrator to add you. Your chat_id: {chat_id}"
                ))));
            }
            return Ok(Outcome::Continue);
        }
        if chat_type.is_group() {
            if !self.telegram.group_chat_enabled {
                return Err(StageError::GroupChatDisabled);
            }
            if !listed(&self.telegram.group_allow_list) {
                return Ok(Outcome::Stop(Reply::Text(format!(
                    "Your group is not in the allow list, please contact the administrator to add it. Your chat_id: {chat_id}"
                ))));
            }
            return Ok(Outcome::Continue);
        }
        Ok(Outcome::Stop(Reply::Text(format!(
            "Not support chat type: {}",
            chat_type.as_str()
        ))))
    }

    async fn suppress_duplicates(&self, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        if !self.telegram.safe_mode {
            return Ok(Outcome::Continue);
        }
        let ctx = req.ctx.as_ref().ok_or_else(unresolved)?;
        let store = self.env(&req.messenger)?.store;
        let fresh = dedup::record_if_new(
            store,
            &ctx.keys.last_message_ids,
            req.message.message_id,
            self.history.dedup_window,
        )
        .await?;
        if fresh {
            Ok(Outcome::Continue)
        } else {
            Err(StageError::DuplicateMessage)
        }
    }

    async fn snapshot_message(&self, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        if !self.telegram.debug_mode {
            return Ok(Outcome::Continue);
        }
        let ctx = req.ctx.as_ref().ok_or_else(unresolved)?;
        let store = self.env(&req.messenger)?.store;
        match serde_json::to_string(&req.message) {
            Ok(raw) => {
                if let Err(e) = store.put(&ctx.keys.snapshot, &raw, Some(SNAPSHOT_TTL)).await {
                    warn!(key = %ctx.keys.snapshot, error = %e, "message snapshot failed");
                }
            }
            Err(e) => warn!(error = %e, "message snapshot serialization failed"),
        }
        Ok(Outcome::Continue)
    }

    async fn dispatch_command(&self, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        if req.message.text.is_none() {
            return Ok(Outcome::Continue);
        }
        let Request {
            message,
            ctx,
            messenger,
            ..
        } = req;
        let ctx = ctx.as_mut().ok_or_else(unresolved)?;
        let env = self.env(messenger)?;
        match self.commands.handle(message, ctx, &env).await? {
            Some(reply) => Ok(Outcome::Stop(reply)),
            None => Ok(Outcome::Continue),
        }
    }

    async fn complete(&self, req: &mut Request<'_>) -> Result<Outcome, StageError> {
        let Request {
            message,
            ctx,
            messenger,
            ..
        } = req;
        let ctx = ctx.as_mut().ok_or_else(unresolved)?;
        let env = self.env(messenger)?;

        let mut text = message.content().trim().to_string();
        if let Some(extra) = ctx.take_extra_context() {
            text = format!("{extra}\n{text}");
        }

        let mut images = Vec::new();
        if let Some(file_id) = find_photo_file_id(&message.photo, self.telegram.photo_size_offset) {
            images.push(messenger.file_url(file_id).await?);
        }

        let reply = orchestrator::complete(&env, ctx, text, images).await;
        Ok(Outcome::Stop(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_resolution_runs_first_and_completion_last() {
        assert_eq!(Stage::ORDER[0], Stage::ResolveContext);
        assert_eq!(Stage::ORDER[Stage::ORDER.len() - 1], Stage::Complete);
    }

    #[test]
    fn addressing_is_checked_before_access_control() {
        let pos = |s| Stage::ORDER.iter().position(|&x| x == s).unwrap();
        assert!(pos(Stage::GroupAddressing) < pos(Stage::AccessControl));
        assert!(pos(Stage::AccessControl) < pos(Stage::SuppressDuplicates));
        assert!(pos(Stage::DispatchCommand) < pos(Stage::Complete));
    }
}
