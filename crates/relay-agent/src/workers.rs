//! Cloudflare Workers AI adapter.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use relay_core::{ImageProviderKind, ProviderKind, UserConfig};

use crate::openai::build_messages;
use crate::provider::{
    api_error, execute_completion, ChatProvider, CompletionRequest, Envelope, GeneratedImage,
    ImageProvider, ProviderError, StreamChunk,
};

pub const WORKERS_API_BASE: &str = "https://api.cloudflare.com/client/v4";

fn delta(v: &Value) -> Option<String> {
    v.get("response").and_then(Value::as_str).map(String::from)
}

fn full(v: &Value) -> Option<String> {
    v.pointer("/result/response")
        .and_then(Value::as_str)
        .map(String::from)
}

fn error(v: &Value) -> Option<String> {
    v.pointer("/errors/0/message")
        .and_then(Value::as_str)
        .map(String::from)
}

const ENVELOPE: Envelope = Envelope { delta, full, error };

pub struct WorkersProvider {
    client: reqwest::Client,
    api_base: String,
}

impl WorkersProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base: WORKERS_API_BASE.to_string(),
        }
    }

    /// Point at a different API root (tests, proxies).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn credentials<'c>(&self, config: &'c UserConfig) -> Option<(&'c str, &'c str)> {
        match (&config.cloudflare_account_id, &config.cloudflare_token) {
            (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => {
                Some((id.as_str(), token.as_str()))
            }
            _ => None,
        }
    }

    fn run_url(&self, account_id: &str, model: &str) -> String {
        format!(
            "{}/accounts/{account_id}/ai/run/{model}",
            self.api_base.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatProvider for WorkersProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Workers
    }

    fn is_enabled(&self, config: &UserConfig) -> bool {
        self.credentials(config).is_some()
    }

    async fn chat_complete(
        &self,
        req: &CompletionRequest,
        config: &UserConfig,
        on_chunk: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<String, ProviderError> {
        let (account_id, token) = self
            .credentials(config)
            .ok_or_else(|| ProviderError::NotEnabled(self.name().to_string()))?;
        let url = self.run_url(account_id, &config.workers_chat_model);
        let body = json!({
            "messages": build_messages(req, config),
            "stream": on_chunk.is_some(),
        });
        let builder = self.client.post(&url).bearer_auth(token).json(&body);
        execute_completion(self.name(), builder, ENVELOPE, on_chunk).await
    }
}

#[async_trait]
impl ImageProvider for WorkersProvider {
    fn kind(&self) -> ImageProviderKind {
        ImageProviderKind::Workers
    }

    fn is_enabled(&self, config: &UserConfig) -> bool {
        self.credentials(config).is_some()
    }

    /// Workers AI answers image requests with the raw PNG bytes.
    async fn generate_image(
        &self,
        prompt: &str,
        config: &UserConfig,
    ) -> Result<GeneratedImage, ProviderError> {
        let (account_id, token) = self
            .credentials(config)
            .ok_or_else(|| ProviderError::NotEnabled("workers".to_string()))?;
        let url = self.run_url(account_id, &config.workers_image_model);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Workers AI image error");
            return Err(api_error(status, &text, error));
        }
        Ok(GeneratedImage::Bytes(resp.bytes().await?.to_vec()))
    }
}
