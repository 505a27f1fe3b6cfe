//! Runs one completion: placeholder, provider call, history, final answer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use relay_agent::{ChatProvider, CompletionRequest, ProviderError};
use relay_store::{HistoryItem, HistoryPolicy, HistoryStore};

use crate::api::Messenger;
use crate::context::ChatContext;
use crate::pipeline::{Reply, RequestEnv};
use crate::send::clip;
use crate::throttle::{Throttler, PLACEHOLDER};
use crate::types::ReplyKeyboard;

pub const NOT_ENABLED: &str = "LLM is not enabled";

/// Longest error text shown in the chat.
const ERROR_MAX_CHARS: usize = 2048;
const STREAM_BUFFER: usize = 64;

/// Answer `text` (plus any image URLs) in the chat of `ctx`.
///
/// Never fails: provider errors become an `Error: …` reply. The final reply
/// state is written back into `ctx.reply`.
pub async fn complete(
    env: &RequestEnv<'_>,
    ctx: &mut ChatContext,
    text: String,
    images: Vec<String>,
) -> Reply {
    let mut throttler = Throttler::new(Arc::clone(env.messenger), ctx.reply.clone())
        .with_cancellation(env.shutdown.child_token());
    throttler.start(PLACEHOLDER).await;
    spawn_typing(env.messenger, ctx.scope.chat_id);

    let provider = match env.registry.chat(&ctx.config) {
        Ok(provider) => provider,
        Err(e) => {
            info!(chat_id = ctx.scope.chat_id, error = %e, "no chat provider available");
            let reply = throttler.finish(NOT_ENABLED).await;
            ctx.reply = throttler.into_reply();
            return reply;
        }
    };

    let reply = match ask(env, ctx, provider.as_ref(), &mut throttler, text, images).await {
        Ok(answer) => {
            if env.telegram.show_reply_button {
                attach_reply_buttons(&**env.messenger, &mut throttler).await;
            }
            throttler.finish(&answer).await
        }
        Err(e) => {
            warn!(chat_id = ctx.scope.chat_id, provider = provider.name(), error = %e, "completion failed");
            throttler.reply_mut().disable_link_preview = true;
            let message = format!("Error: {e}");
            throttler.finish(clip(&message, ERROR_MAX_CHARS)).await
        }
    };
    ctx.reply = throttler.into_reply();
    reply
}

/// Load history, call the provider, persist the exchange.
async fn ask(
    env: &RequestEnv<'_>,
    ctx: &ChatContext,
    provider: &dyn ChatProvider,
    throttler: &mut Throttler,
    text: String,
    images: Vec<String>,
) -> Result<String, ProviderError> {
    let policy = HistoryPolicy::from(env.history);
    let history_store = HistoryStore::new(env.store);
    let estimate = |s: &str| provider.estimate_tokens(s);
    let history = history_store
        .load(&ctx.keys.history, &policy, estimate)
        .await;

    let req = CompletionRequest {
        message: text,
        system_prompt: ctx.config.system_init_message.clone(),
        history,
        images,
    };
    debug!(
        chat_id = ctx.scope.chat_id,
        provider = provider.name(),
        history = req.history.len(),
        stream = env.telegram.stream_mode,
        "requesting completion"
    );

    let answer = if env.telegram.stream_mode {
        // Partial answers are rarely valid markup.
        let parse_mode = throttler.reply_mut().parse_mode.take();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let (result, ()) = tokio::join!(
            provider.chat_complete(&req, &ctx.config, Some(tx)),
            throttler.drive(rx)
        );
        throttler.reply_mut().parse_mode = parse_mode;
        result?
    } else {
        provider.chat_complete(&req, &ctx.config, None).await?
    };

    history_store
        .append_and_save(
            &ctx.keys.history,
            req.history,
            HistoryItem::user(req.message),
            HistoryItem::assistant(answer.clone()),
            &policy,
            estimate,
        )
        .await;
    Ok(answer)
}

/// Swap the placeholder for a fresh message carrying `/new` and `/redo`.
async fn attach_reply_buttons(messenger: &dyn Messenger, throttler: &mut Throttler) {
    let reply = throttler.reply_mut();
    if let Some(message_id) = reply.message_id.take() {
        if let Err(e) = messenger.delete_message(reply.chat_id, message_id).await {
            warn!(chat_id = reply.chat_id, error = %e, "placeholder delete failed");
        }
    }
    reply.reply_markup = Some(ReplyKeyboard::commands(&["/new", "/redo"]));
}

fn spawn_typing(messenger: &Arc<dyn Messenger>, chat_id: i64) {
    let messenger = Arc::clone(messenger);
    tokio::spawn(async move {
        if let Err(e) = messenger.send_chat_action(chat_id, "typing").await {
            debug!(chat_id, error = %e, "typing action failed");
        }
    });
}
