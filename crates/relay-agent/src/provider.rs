use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::{ImageProviderKind, ProviderKind, UserConfig};
use relay_store::HistoryItem;

use crate::stream::read_sse_stream;

/// One piece of streamed output.
///
/// Non-final chunks carry an incremental fragment; the final chunk carries
/// the full assembled answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub text: String,
    pub is_final: bool,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn full(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Everything an adapter needs to build one completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// The new user turn.
    pub message: String,
    pub system_prompt: Option<String>,
    pub history: Vec<HistoryItem>,
    /// Publicly reachable image URLs attached to the user turn.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedImage {
    Url(String),
    Bytes(Vec<u8>),
}

/// Common interface for chat completion backends.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Provider name for logging and error messages.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Whether the credentials this backend needs are present in `config`.
    fn is_enabled(&self, config: &UserConfig) -> bool;

    /// Text-length estimate used for history budgeting.
    fn estimate_tokens(&self, text: &str) -> usize {
        relay_store::history::char_count(text)
    }

    /// Send history + the new user turn and return the full answer.
    ///
    /// With `on_chunk` set the backend is asked to stream and every fragment
    /// is forwarded as it arrives, followed by one final chunk.
    async fn chat_complete(
        &self,
        req: &CompletionRequest,
        config: &UserConfig,
        on_chunk: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn kind(&self) -> ImageProviderKind;

    fn is_enabled(&self, config: &UserConfig) -> bool;

    async fn generate_image(
        &self,
        prompt: &str,
        config: &UserConfig,
    ) -> Result<GeneratedImage, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0} is not enabled")]
    NotEnabled(String),
}

/// Pulls a value out of a provider's JSON envelope.
pub type Extractor = fn(&Value) -> Option<String>;

/// Where each adapter keeps its text and errors inside response JSON.
#[derive(Clone, Copy)]
pub struct Envelope {
    /// Incremental text inside one streamed payload.
    pub delta: Extractor,
    /// Full answer inside a non-streaming response.
    pub full: Extractor,
    /// Human-readable message inside an error payload.
    pub error: Extractor,
}

/// Build a `ProviderError::Api` from a failed response body, preferring the
/// provider's own error message over the raw body.
pub fn api_error(status: u16, body: &str, error: Extractor) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| error(&v))
        .unwrap_or_else(|| body.to_string());
    ProviderError::Api { status, message }
}

/// Send a prepared completion request and collect the answer, streaming
/// through `on_chunk` when set.
pub(crate) async fn execute_completion(
    provider: &str,
    builder: RequestBuilder,
    envelope: Envelope,
    on_chunk: Option<mpsc::Sender<StreamChunk>>,
) -> Result<String, ProviderError> {
    debug!(provider, stream = on_chunk.is_some(), "sending completion request");
    let resp = builder.send().await?;

    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(provider, status, body = %text, "provider API error");
        return Err(api_error(status, &text, envelope.error));
    }

    if let Some(tx) = on_chunk {
        return read_sse_stream(resp, &tx, envelope).await;
    }

    let body: Value = resp
        .json()
        .await
        .map_err(|e| ProviderError::Parse(e.to_string()))?;
    if let Some(message) = (envelope.error)(&body) {
        return Err(ProviderError::Api { status, message });
    }
    (envelope.full)(&body)
        .ok_or_else(|| ProviderError::Parse(format!("{provider}: response has no content")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_error(v: &Value) -> Option<String> {
        v.pointer("/error/message")
            .and_then(Value::as_str)
            .map(String::from)
    }

    #[test]
    fn api_error_prefers_envelope_message() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        match api_error(401, body, openai_error) {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn api_error_falls_back_to_raw_body() {
        match api_error(502, "Bad Gateway", openai_error) {
            ProviderError::Api { message, .. } => assert_eq!(message, "Bad Gateway"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn stream_chunk_constructors() {
        assert!(!StreamChunk::delta("a").is_final);
        assert!(StreamChunk::full("ab").is_final);
    }
}
