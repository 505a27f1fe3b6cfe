// Shared fakes for the pipeline scenarios.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use relay_agent::{ChatProvider, CompletionRequest, ProviderError, ProviderRegistry, StreamChunk};
use relay_core::{ProviderKind, RelayConfig, UserConfig};
use relay_store::{KvStore, MemoryKv};
use relay_telegram::types::{Message, User};
use relay_telegram::{LiveReply, Messenger, PhotoSource, Pipeline, TelegramError};

pub const TOKEN: &str = "111:AAA";
pub const BOT_ID: i64 = 111;
pub const BOT_NAME: &str = "relay_bot";

#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub chat_id: i64,
    pub text: String,
    pub edit_of: Option<i64>,
}

/// Records every outbound call; message ids count up from 1.
#[derive(Default)]
pub struct FakeMessenger {
    pub sent: Mutex<Vec<Sent>>,
    pub actions: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<i64>>,
    /// Number of upcoming edits answered with a 60 s rate limit.
    pub rate_limited_edits: Mutex<usize>,
    next_id: Mutex<i64>,
}

impl FakeMessenger {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|s| s.text.clone()).collect()
    }

    pub fn last_text(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|s| s.text.clone())
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn get_me(&self) -> Result<User, TelegramError> {
        Ok(User {
            id: BOT_ID,
            is_bot: true,
            first_name: "Relay".into(),
            username: Some(BOT_NAME.into()),
        })
    }

    async fn send_text(&self, reply: &LiveReply, text: &str) -> Result<i64, TelegramError> {
        if reply.message_id.is_some() {
            let mut limited = self.rate_limited_edits.lock().unwrap();
            if *limited > 0 {
                *limited -= 1;
                return Err(TelegramError::RateLimited {
                    retry_after: Some(Duration::from_secs(60)),
                });
            }
        }
        self.sent.lock().unwrap().push(Sent {
            chat_id: reply.chat_id,
            text: text.to_string(),
            edit_of: reply.message_id,
        });
        match reply.message_id {
            Some(id) => Ok(id),
            None => {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                Ok(*next)
            }
        }
    }

    async fn delete_message(&self, _chat_id: i64, message_id: i64) -> Result<(), TelegramError> {
        self.deleted.lock().unwrap().push(message_id);
        Ok(())
    }

    async fn send_chat_action(&self, _chat_id: i64, action: &str) -> Result<(), TelegramError> {
        self.actions.lock().unwrap().push(action.to_string());
        Ok(())
    }

    async fn send_photo(&self, _reply: &LiveReply, _photo: PhotoSource) -> Result<i64, TelegramError> {
        Ok(0)
    }

    async fn file_url(&self, file_id: &str) -> Result<String, TelegramError> {
        Ok(format!("https://files.example/{file_id}"))
    }
}

/// Answers `echo: {message}`, streaming it in two pieces when asked to.
#[derive(Default)]
pub struct EchoProvider {
    pub calls: AtomicUsize,
    pub last_request: Mutex<Option<CompletionRequest>>,
    /// Token estimate charged per history item; char count when unset.
    pub tokens_per_item: Option<usize>,
}

impl EchoProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for EchoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        self.tokens_per_item.unwrap_or_else(|| text.chars().count())
    }

    fn is_enabled(&self, _config: &UserConfig) -> bool {
        true
    }

    async fn chat_complete(
        &self,
        req: &CompletionRequest,
        _config: &UserConfig,
        on_chunk: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req.clone());
        let answer = format!("echo: {}", req.message);
        if let Some(tx) = on_chunk {
            let _ = tx.send(StreamChunk::delta("echo: ")).await;
            let _ = tx.send(StreamChunk::delta(req.message.clone())).await;
            let _ = tx.send(StreamChunk::full(answer.clone())).await;
        }
        Ok(answer)
    }
}

/// Always fails with a backend error.
pub struct FailingProvider;

#[async_trait]
impl ChatProvider for FailingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn is_enabled(&self, _config: &UserConfig) -> bool {
        true
    }

    async fn chat_complete(
        &self,
        _req: &CompletionRequest,
        _config: &UserConfig,
        _on_chunk: Option<mpsc::Sender<StreamChunk>>,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Api {
            status: 401,
            message: "Incorrect API key provided".into(),
        })
    }
}

pub fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.telegram.available_tokens = vec![TOKEN.into()];
    config.telegram.bot_names = vec![BOT_NAME.into()];
    config.telegram.chat_allow_list = vec!["42".into()];
    config.telegram.group_allow_list = vec!["-100".into()];
    config
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub store: Arc<MemoryKv>,
    pub messenger: Arc<FakeMessenger>,
}

impl Harness {
    pub fn new(config: RelayConfig, provider: Option<Arc<dyn ChatProvider>>) -> Self {
        let mut registry = ProviderRegistry::new();
        if let Some(provider) = provider {
            registry.register_chat(provider);
        }
        let store = Arc::new(MemoryKv::new());
        let pipeline = Pipeline::new(
            &config,
            Some(store.clone() as Arc<dyn KvStore>),
            Arc::new(registry),
        );
        Self {
            pipeline,
            store,
            messenger: Arc::new(FakeMessenger::default()),
        }
    }

    pub fn messenger(&self) -> Arc<dyn Messenger> {
        self.messenger.clone()
    }

    pub async fn stored_json(&self, key: &str) -> Option<Value> {
        let raw = self.store.get(key).await.unwrap()?;
        Some(serde_json::from_str(&raw).unwrap())
    }
}

pub fn private_message(message_id: i64, chat_id: i64, text: &str) -> Message {
    serde_json::from_value(json!({
        "message_id": message_id,
        "from": {"id": chat_id, "is_bot": false, "first_name": "Ann"},
        "chat": {"id": chat_id, "type": "private"},
        "date": 0,
        "text": text
    }))
    .unwrap()
}

pub fn group_message(message_id: i64, text: &str, entities: Value) -> Message {
    serde_json::from_value(json!({
        "message_id": message_id,
        "from": {"id": 7, "is_bot": false, "first_name": "Ann"},
        "chat": {"id": -100, "type": "group", "title": "team"},
        "date": 0,
        "text": text,
        "entities": entities
    }))
    .unwrap()
}
