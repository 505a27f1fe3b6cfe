use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use relay_core::{ProviderKind, UserConfig};
use relay_store::HistoryRole;

use crate::provider::{
    execute_completion, ChatProvider, CompletionRequest, Envelope, ProviderError, StreamChunk,
};

const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// Only `content_block_delta` events carry text; everything else
/// (`message_start`, `ping`, `message_stop`, ...) is skipped.
fn delta(v: &Value) -> Option<String> {
    if v.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    v.pointer("/delta/text")
        .and_then(Value::as_str)
        .map(String::from)
}

fn full(v: &Value) -> Option<String> {
    let blocks = v.get("content")?.as_array()?;
    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}

fn error(v: &Value) -> Option<String> {
    v.pointer("/error/message")
        .and_then(Value::as_str)
        .map(String::from)
}

const ENVELOPE: Envelope = Envelope { delta, full, error };

fn build_request_body(req: &CompletionRequest, config: &UserConfig, stream: bool) -> Value {
    // Messages must open with a user turn; trimming can leave an assistant first.
    let mut messages: Vec<Value> = req
        .history
        .iter()
        .skip_while(|item| item.role != HistoryRole::User)
        .map(|item| json!({ "role": item.role, "content": item.content }))
        .collect();

    if req.images.is_empty() {
        messages.push(json!({ "role": "user", "content": req.message }));
    } else {
        let mut parts: Vec<Value> = req
            .images
            .iter()
            .map(|url| json!({ "type": "image", "source": { "type": "url", "url": url } }))
            .collect();
        parts.push(json!({ "type": "text", "text": req.message }));
        messages.push(json!({ "role": "user", "content": parts }));
    }

    let mut body = json!({
        "model": config.anthropic_chat_model,
        "max_tokens": MAX_TOKENS,
        "messages": messages,
        "stream": stream,
    });
    // Anthropic takes the system prompt as a top-level field, not a turn.
    if let Some(prompt) = req.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        body["system"] = json!(prompt);
    }
    body
}

pub struct AnthropicProvider {
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn is_enabled(&self, config: &UserConfig) -> bool {
        config
            .anthropic_api_key
            .as_deref()
            .is_some_and(|k| !k.is_empty())
    }

    async fn chat_complete(
        &self,
        req: &CompletionRequest,
        config: &UserConfig,
        on_chunk: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<String, ProviderError> {
        let key = config
            .anthropic_api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ProviderError::NotEnabled(self.name().to_string()))?;
        let url = format!(
            "{}/messages",
            config.anthropic_api_base.trim_end_matches('/')
        );
        let body = build_request_body(req, config, on_chunk.is_some());
        debug!(model = %config.anthropic_chat_model, "sending request to Anthropic");

        let builder = self
            .client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        execute_completion(self.name(), builder, ENVELOPE, on_chunk).await
    }
}
