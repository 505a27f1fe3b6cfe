//! OpenAI and Azure OpenAI adapters. Both speak the same chat-completions
//! and image-generation wire format; they differ in URL and auth header.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::{ImageProviderKind, ProviderKind, UserConfig};

use crate::provider::{
    api_error, execute_completion, ChatProvider, CompletionRequest, Envelope, GeneratedImage,
    ImageProvider, ProviderError, StreamChunk,
};

pub(crate) fn delta_content(v: &Value) -> Option<String> {
    v.pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(String::from)
}

pub(crate) fn message_content(v: &Value) -> Option<String> {
    v.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(String::from)
}

pub(crate) fn error_message(v: &Value) -> Option<String> {
    v.pointer("/error/message")
        .and_then(Value::as_str)
        .map(String::from)
}

pub(crate) const ENVELOPE: Envelope = Envelope {
    delta: delta_content,
    full: message_content,
    error: error_message,
};

/// Flat role/content message list: optional system turn, history, then the
/// new user turn. Image URLs turn the user turn into vision content parts.
pub(crate) fn build_messages(req: &CompletionRequest, config: &UserConfig) -> Vec<Value> {
    let mut messages = Vec::with_capacity(req.history.len() + 2);
    if let Some(prompt) = req.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        messages.push(json!({
            "role": config.system_init_message_role,
            "content": prompt,
        }));
    }
    for item in &req.history {
        messages.push(json!({
            "role": item.role,
            "content": item.content,
        }));
    }

    if req.images.is_empty() {
        messages.push(json!({ "role": "user", "content": req.message }));
    } else {
        let mut parts = vec![json!({ "type": "text", "text": req.message })];
        parts.extend(
            req.images
                .iter()
                .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
        );
        messages.push(json!({ "role": "user", "content": parts }));
    }
    messages
}

/// Chat body for both OpenAI and Azure. Extra params are merged last and may
/// override anything but `messages` and `stream`.
pub(crate) fn build_chat_body(
    req: &CompletionRequest,
    config: &UserConfig,
    model: Option<&str>,
    stream: bool,
) -> Value {
    let mut body = Map::new();
    if let Some(model) = model {
        body.insert("model".into(), Value::String(model.to_string()));
    }
    for (k, v) in &config.openai_api_extra_params {
        body.insert(k.clone(), v.clone());
    }
    body.insert("messages".into(), Value::Array(build_messages(req, config)));
    body.insert("stream".into(), Value::Bool(stream));
    Value::Object(body)
}

fn image_body(prompt: &str, config: &UserConfig) -> Value {
    let mut body = json!({
        "prompt": prompt,
        "n": 1,
        "size": config.dall_e_image_size,
        "model": config.dall_e_model,
    });
    // quality and style only exist for dall-e-3
    if config.dall_e_model.ends_with('3') {
        body["quality"] = json!(config.dall_e_image_quality);
        body["style"] = json!(config.dall_e_image_style);
    }
    body
}

fn image_url(body: &Value) -> Result<GeneratedImage, ProviderError> {
    if let Some(message) = error_message(body) {
        return Err(ProviderError::Api {
            status: 200,
            message,
        });
    }
    body.pointer("/data/0/url")
        .and_then(Value::as_str)
        .map(|url| GeneratedImage::Url(url.to_string()))
        .ok_or_else(|| ProviderError::Parse("image response has no url".to_string()))
}

async fn post_image(
    builder: reqwest::RequestBuilder,
    provider: &str,
) -> Result<GeneratedImage, ProviderError> {
    let resp = builder.send().await?;
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(provider, status, body = %text, "image API error");
        return Err(api_error(status, &text, error_message));
    }
    let body: Value = resp
        .json()
        .await
        .map_err(|e| ProviderError::Parse(e.to_string()))?;
    image_url(&body)
}

fn pick_key(keys: &[String]) -> Option<&String> {
    keys.choose(&mut rand::thread_rng())
}

pub struct OpenAiProvider {
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn is_enabled(&self, config: &UserConfig) -> bool {
        !config.openai_api_key.is_empty()
    }

    async fn chat_complete(
        &self,
        req: &CompletionRequest,
        config: &UserConfig,
        on_chunk: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<String, ProviderError> {
        let key = pick_key(&config.openai_api_key)
            .ok_or_else(|| ProviderError::NotEnabled(self.name().to_string()))?;
        let url = format!(
            "{}/chat/completions",
            config.openai_api_base.trim_end_matches('/')
        );
        let body = build_chat_body(
            req,
            config,
            Some(&config.openai_chat_model),
            on_chunk.is_some(),
        );
        debug!(model = %config.openai_chat_model, "sending request to OpenAI");

        let builder = self.client.post(&url).bearer_auth(key).json(&body);
        execute_completion(self.name(), builder, ENVELOPE, on_chunk).await
    }
}

#[async_trait]
impl ImageProvider for OpenAiProvider {
    fn kind(&self) -> ImageProviderKind {
        ImageProviderKind::OpenAi
    }

    fn is_enabled(&self, config: &UserConfig) -> bool {
        !config.openai_api_key.is_empty()
    }

    async fn generate_image(
        &self,
        prompt: &str,
        config: &UserConfig,
    ) -> Result<GeneratedImage, ProviderError> {
        let key = pick_key(&config.openai_api_key)
            .ok_or_else(|| ProviderError::NotEnabled("openai".to_string()))?;
        let url = format!(
            "{}/images/generations",
            config.openai_api_base.trim_end_matches('/')
        );
        let builder = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&image_body(prompt, config));
        post_image(builder, "openai").await
    }
}

pub struct AzureProvider {
    client: reqwest::Client,
}

impl AzureProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatProvider for AzureProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn is_enabled(&self, config: &UserConfig) -> bool {
        config.azure_api_key.is_some() && config.azure_completions_api.is_some()
    }

    async fn chat_complete(
        &self,
        req: &CompletionRequest,
        config: &UserConfig,
        on_chunk: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<String, ProviderError> {
        let (Some(key), Some(url)) = (&config.azure_api_key, &config.azure_completions_api) else {
            return Err(ProviderError::NotEnabled(self.name().to_string()));
        };
        // The deployment in the URL selects the model.
        let body = build_chat_body(req, config, None, on_chunk.is_some());
        let builder = self.client.post(url).header("api-key", key).json(&body);
        execute_completion(self.name(), builder, ENVELOPE, on_chunk).await
    }
}

#[async_trait]
impl ImageProvider for AzureProvider {
    fn kind(&self) -> ImageProviderKind {
        ImageProviderKind::Azure
    }

    fn is_enabled(&self, config: &UserConfig) -> bool {
        config.azure_api_key.is_some() && config.azure_dalle_api.is_some()
    }

    async fn generate_image(
        &self,
        prompt: &str,
        config: &UserConfig,
    ) -> Result<GeneratedImage, ProviderError> {
        let (Some(key), Some(url)) = (&config.azure_api_key, &config.azure_dalle_api) else {
            return Err(ProviderError::NotEnabled("azure".to_string()));
        };
        let mut body = image_body(prompt, config);
        if let Some(obj) = body.as_object_mut() {
            obj.remove("model");
        }
        let builder = self.client.post(url).header("api-key", key).json(&body);
        post_image(builder, "azure").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::HistoryItem;

    fn request() -> CompletionRequest {
        CompletionRequest {
            message: "what now?".into(),
            system_prompt: Some("be brief".into()),
            history: vec![HistoryItem::user("hi"), HistoryItem::assistant("hello")],
            images: Vec::new(),
        }
    }

    #[test]
    fn messages_are_system_history_then_user() {
        let cfg = UserConfig::default();
        let msgs = build_messages(&request(), &cfg);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(msgs[1]["role"], "user");
        assert_eq!(msgs[2]["role"], "assistant");
        assert_eq!(msgs[3], json!({"role": "user", "content": "what now?"}));
    }

    #[test]
    fn no_prompt_means_no_system_turn() {
        let cfg = UserConfig::default();
        let req = CompletionRequest {
            system_prompt: None,
            ..request()
        };
        assert_eq!(build_messages(&req, &cfg)[0]["content"], "hi");
    }

    #[test]
    fn images_become_content_parts() {
        let cfg = UserConfig::default();
        let req = CompletionRequest {
            images: vec!["https://t.me/file/a.jpg".into()],
            ..request()
        };
        let msgs = build_messages(&req, &cfg);
        let parts = msgs[3]["content"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "what now?");
        assert_eq!(parts[1]["image_url"]["url"], "https://t.me/file/a.jpg");
    }

    #[test]
    fn extra_params_merge_into_body() {
        let mut cfg = UserConfig::default();
        cfg.openai_api_extra_params
            .insert("temperature".into(), json!(0.3));
        cfg.openai_api_extra_params
            .insert("stream".into(), json!(true));
        let body = build_chat_body(&request(), &cfg, Some("gpt-4o"), false);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], json!(0.3));
        // stream is decided by the caller
        assert_eq!(body["stream"], json!(false));
    }

    #[test]
    fn image_body_adds_dalle3_options() {
        let mut cfg = UserConfig::default();
        assert!(image_body("cat", &cfg).get("style").is_none());
        cfg.dall_e_model = "dall-e-3".into();
        let body = image_body("cat", &cfg);
        assert_eq!(body["style"], "vivid");
        assert_eq!(body["quality"], "standard");
    }

    #[test]
    fn image_url_extraction() {
        let ok = json!({"data": [{"url": "https://img/1.png"}]});
        assert_eq!(
            image_url(&ok).unwrap(),
            GeneratedImage::Url("https://img/1.png".into())
        );
        let err = json!({"error": {"message": "safety system"}});
        assert!(matches!(image_url(&err), Err(ProviderError::Api { .. })));
    }

    #[test]
    fn enablement_follows_credentials() {
        let client = reqwest::Client::new();
        let openai = OpenAiProvider::new(client.clone());
        let azure = AzureProvider::new(client);
        let mut cfg = UserConfig::default();
        assert!(!ChatProvider::is_enabled(&openai, &cfg));
        assert!(!ChatProvider::is_enabled(&azure, &cfg));
        cfg.openai_api_key = vec!["sk-1".into()];
        cfg.azure_api_key = Some("k".into());
        assert!(ChatProvider::is_enabled(&openai, &cfg));
        assert!(!ChatProvider::is_enabled(&azure, &cfg));
        cfg.azure_completions_api = Some("https://x.openai.azure.com/...".into());
        assert!(ChatProvider::is_enabled(&azure, &cfg));
        assert!(!ImageProvider::is_enabled(&azure, &cfg));
    }
}
