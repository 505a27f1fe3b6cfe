//! Bot API client.
//!
//! Every call is `POST {api_domain}/bot{token}/{method}` and answers with
//! `{ok, result}` or `{ok: false, description, parameters}`. HTTP 429 turns
//! into [`TelegramError::RateLimited`] carrying the retry-after hint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::context::LiveReply;
use crate::error::TelegramError;
use crate::types::User;

/// Image to post with `sendPhoto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhotoSource {
    Url(String),
    Bytes(Vec<u8>),
}

/// Outbound side of one bot. Tests substitute their own implementation.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn get_me(&self) -> Result<User, TelegramError>;

    /// Edit `reply.message_id` when set, otherwise send a new message.
    /// Returns the id of the message now holding `text`.
    async fn send_text(&self, reply: &LiveReply, text: &str) -> Result<i64, TelegramError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError>;

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), TelegramError>;

    async fn send_photo(&self, reply: &LiveReply, photo: PhotoSource) -> Result<i64, TelegramError>;

    /// Download URL for an uploaded file.
    async fn file_url(&self, file_id: &str) -> Result<String, TelegramError>;
}

pub struct TelegramClient {
    http: reqwest::Client,
    api_domain: String,
    token: String,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, api_domain: &str, token: &str) -> Self {
        Self {
            http,
            api_domain: api_domain.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_domain, self.token)
    }

    async fn call(&self, method: &str, body: &Value) -> Result<Value, TelegramError> {
        let resp = self
            .http
            .post(self.method_url(method))
            .json(body)
            .send()
            .await?;
        read_envelope(method, resp).await
    }

    async fn call_multipart(
        &self,
        method: &str,
        form: reqwest::multipart::Form,
    ) -> Result<Value, TelegramError> {
        let resp = self
            .http
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await?;
        read_envelope(method, resp).await
    }

    /// Send or edit once with the given parse mode.
    async fn send_text_once(
        &self,
        reply: &LiveReply,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<i64, TelegramError> {
        let (method, body) = text_request(reply, text, parse_mode);
        let result = self.call(method, &body).await?;
        // Edits of inline messages answer `true` instead of the message.
        Ok(result
            .get("message_id")
            .and_then(Value::as_i64)
            .or(reply.message_id)
            .unwrap_or_default())
    }
}

/// Build the `sendMessage` / `editMessageText` request for `reply`.
pub fn text_request(reply: &LiveReply, text: &str, parse_mode: Option<&str>) -> (&'static str, Value) {
    let mut body = Map::new();
    body.insert("chat_id".into(), json!(reply.chat_id));
    body.insert("text".into(), json!(text));
    if let Some(mode) = parse_mode {
        body.insert("parse_mode".into(), json!(mode));
    }
    if reply.disable_link_preview {
        body.insert("link_preview_options".into(), json!({ "is_disabled": true }));
    }
    if let Some(markup) = &reply.reply_markup {
        body.insert("reply_markup".into(), json!(markup));
    }

    let method = match reply.message_id {
        Some(message_id) => {
            body.insert("message_id".into(), json!(message_id));
            "editMessageText"
        }
        None => {
            if let Some(reply_to) = reply.reply_to_message_id {
                body.insert(
                    "reply_parameters".into(),
                    json!({ "message_id": reply_to, "allow_sending_without_reply": true }),
                );
            }
            "sendMessage"
        }
    };
    (method, Value::Object(body))
}

/// Seconds from the `Retry-After` header, else from `parameters.retry_after`.
pub fn retry_after(header: Option<&str>, body: Option<&Value>) -> Option<Duration> {
    header
        .and_then(|h| h.trim().parse::<u64>().ok())
        .or_else(|| {
            body.and_then(|b| b.pointer("/parameters/retry_after"))
                .and_then(Value::as_u64)
        })
        .map(Duration::from_secs)
}

async fn read_envelope(method: &str, resp: reqwest::Response) -> Result<Value, TelegramError> {
    let status = resp.status().as_u16();
    let header = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let text = resp.text().await?;
    let payload: Option<Value> = serde_json::from_str(&text).ok();

    if status == 429 {
        let retry_after = retry_after(header.as_deref(), payload.as_ref());
        debug!(method, ?retry_after, "telegram rate limit");
        return Err(TelegramError::RateLimited { retry_after });
    }

    let payload = payload.ok_or_else(|| {
        TelegramError::Parse(format!("{method}: status {status}, non-JSON body"))
    })?;
    if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        let description = payload
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("telegram API returned ok=false")
            .to_string();
        return Err(TelegramError::Api {
            code: status,
            description,
        });
    }
    Ok(payload.get("result").cloned().unwrap_or(Value::Null))
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn get_me(&self) -> Result<User, TelegramError> {
        let result = self.call("getMe", &json!({})).await?;
        serde_json::from_value(result).map_err(|e| TelegramError::Parse(e.to_string()))
    }

    async fn send_text(&self, reply: &LiveReply, text: &str) -> Result<i64, TelegramError> {
        match self
            .send_text_once(reply, text, reply.parse_mode.as_deref())
            .await
        {
            Err(e) if reply.parse_mode.is_some() && e.is_parse_mode_rejection() => {
                warn!(error = %e, "parse mode rejected, resending as plain text");
                self.send_text_once(reply, text, None).await
            }
            other => other,
        }
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError> {
        self.call(
            "deleteMessage",
            &json!({ "chat_id": chat_id, "message_id": message_id }),
        )
        .await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), TelegramError> {
        self.call(
            "sendChatAction",
            &json!({ "chat_id": chat_id, "action": action }),
        )
        .await?;
        Ok(())
    }

    async fn send_photo(&self, reply: &LiveReply, photo: PhotoSource) -> Result<i64, TelegramError> {
        let result = match photo {
            PhotoSource::Url(url) => {
                let mut body = json!({ "chat_id": reply.chat_id, "photo": url });
                if let Some(reply_to) = reply.reply_to_message_id {
                    body["reply_parameters"] =
                        json!({ "message_id": reply_to, "allow_sending_without_reply": true });
                }
                self.call("sendPhoto", &body).await?
            }
            PhotoSource::Bytes(bytes) => {
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name("image.png")
                    .mime_str("image/png")?;
                let mut form = reqwest::multipart::Form::new()
                    .text("chat_id", reply.chat_id.to_string())
                    .part("photo", part);
                if let Some(reply_to) = reply.reply_to_message_id {
                    form = form.text(
                        "reply_parameters",
                        json!({ "message_id": reply_to, "allow_sending_without_reply": true })
                            .to_string(),
                    );
                }
                self.call_multipart("sendPhoto", form).await?
            }
        };
        Ok(result
            .get("message_id")
            .and_then(Value::as_i64)
            .unwrap_or_default())
    }

    async fn file_url(&self, file_id: &str) -> Result<String, TelegramError> {
        let result = self.call("getFile", &json!({ "file_id": file_id })).await?;
        let path = result
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| TelegramError::Parse("getFile result has no file_path".into()))?;
        Ok(format!(
            "{}/file/bot{}/{path}",
            self.api_domain, self.token
        ))
    }
}
