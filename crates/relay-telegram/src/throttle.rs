//! Streaming throttler: turns a stream of completion chunks into a bounded
//! number of live edits of one Telegram message.
//!
//! States: `Idle → Sending → Backoff(until) → Done`. A chunk arriving while
//! the backoff window is open is dropped; later chunks supersede it because
//! every edit carries the whole accumulated text. The final answer always
//! goes out, after waiting out any open window.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relay_agent::StreamChunk;

use crate::api::Messenger;
use crate::context::LiveReply;
use crate::error::TelegramError;
use crate::pipeline::Reply;
use crate::send::{clip, split_chunks_smart, CHUNK_MAX};

pub const PLACEHOLDER: &str = "...";

/// Attempts for each part of the final answer.
const FINAL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleState {
    Idle,
    Sending,
    Backoff(Instant),
    Done,
}

pub struct Throttler {
    messenger: Arc<dyn Messenger>,
    reply: LiveReply,
    state: ThrottleState,
    accumulated: String,
    last_sent: Option<String>,
    cancel: CancellationToken,
}

impl Throttler {
    pub fn new(messenger: Arc<dyn Messenger>, reply: LiveReply) -> Self {
        Self {
            messenger,
            reply,
            state: ThrottleState::Idle,
            accumulated: String::new(),
            last_sent: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `cancel` cuts the final backoff wait short.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ThrottleState {
        self.state
    }

    pub fn reply(&self) -> &LiveReply {
        &self.reply
    }

    pub fn reply_mut(&mut self) -> &mut LiveReply {
        &mut self.reply
    }

    pub fn into_reply(self) -> LiveReply {
        self.reply
    }

    /// Post the placeholder the answer will be edited into.
    pub async fn start(&mut self, placeholder: &str) {
        self.state = ThrottleState::Sending;
        match self.messenger.send_text(&self.reply, placeholder).await {
            Ok(id) => self.reply.message_id = Some(id),
            Err(e) => warn!(chat_id = self.reply.chat_id, error = %e, "placeholder send failed"),
        }
        self.reply.reply_markup = None;
        self.state = ThrottleState::Idle;
    }

    /// Consume chunks until the sender side is dropped. Chunks queued while
    /// an edit was in flight are folded into the next edit.
    pub async fn drive(&mut self, mut rx: mpsc::Receiver<StreamChunk>) {
        while let Some(chunk) = rx.recv().await {
            self.absorb(chunk);
            while let Ok(more) = rx.try_recv() {
                self.absorb(more);
            }
            self.push_update().await;
        }
    }

    pub async fn on_chunk(&mut self, chunk: StreamChunk) {
        self.absorb(chunk);
        self.push_update().await;
    }

    fn absorb(&mut self, chunk: StreamChunk) {
        if chunk.is_final {
            self.accumulated = chunk.text;
        } else {
            self.accumulated.push_str(&chunk.text);
        }
    }

    /// End of an open backoff window, if any.
    fn backoff_until(&self) -> Option<Instant> {
        match self.state {
            ThrottleState::Backoff(until) if until > Instant::now() => Some(until),
            _ => None,
        }
    }

    async fn push_update(&mut self) {
        if self.state == ThrottleState::Done {
            return;
        }
        if self.backoff_until().is_some() {
            debug!(chat_id = self.reply.chat_id, "inside backoff window, update dropped");
            return;
        }
        let text = clip(&self.accumulated, CHUNK_MAX).to_string();
        if text.trim().is_empty() || self.last_sent.as_deref() == Some(text.as_str()) {
            return;
        }

        self.state = ThrottleState::Sending;
        match self.messenger.send_text(&self.reply, &text).await {
            Ok(id) => {
                self.reply.message_id = Some(id);
                self.last_sent = Some(text);
                self.state = ThrottleState::Idle;
            }
            Err(TelegramError::RateLimited {
                retry_after: Some(wait),
            }) => {
                debug!(chat_id = self.reply.chat_id, ?wait, "edit rate limited, backing off");
                self.state = ThrottleState::Backoff(Instant::now() + wait);
            }
            Err(e) => {
                warn!(chat_id = self.reply.chat_id, error = %e, "live edit failed");
                self.state = ThrottleState::Idle;
            }
        }
    }

    async fn wait_out_backoff(&mut self) {
        if let Some(until) = self.backoff_until() {
            debug!(
                chat_id = self.reply.chat_id,
                wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "waiting out rate limit"
            );
            tokio::select! {
                _ = tokio::time::sleep_until(until) => {}
                _ = self.cancel.cancelled() => {
                    debug!(chat_id = self.reply.chat_id, "backoff wait cancelled");
                }
            }
        }
        if matches!(self.state, ThrottleState::Backoff(_)) {
            self.state = ThrottleState::Idle;
        }
    }

    /// Deliver the complete answer. The first part replaces the live message,
    /// any further parts are sent as new messages.
    pub async fn finish(&mut self, text: &str) -> Reply {
        self.wait_out_backoff().await;

        let mut delivered = None;
        for (i, part) in split_chunks_smart(text).iter().enumerate() {
            let target = if i == 0 {
                self.reply.clone()
            } else {
                self.reply.fresh()
            };
            if let Some(id) = self.deliver(&target, part).await {
                if i == 0 {
                    self.reply.message_id = Some(id);
                    delivered = Some(id);
                }
            }
        }

        self.state = ThrottleState::Done;
        match delivered {
            Some(message_id) => Reply::Delivered { message_id },
            None => Reply::Silent,
        }
    }

    async fn deliver(&mut self, target: &LiveReply, text: &str) -> Option<i64> {
        for attempt in 1..=FINAL_ATTEMPTS {
            self.state = ThrottleState::Sending;
            match self.messenger.send_text(target, text).await {
                Ok(id) => return Some(id),
                Err(e) if e.is_not_modified() => return target.message_id,
                Err(TelegramError::RateLimited { retry_after }) if attempt < FINAL_ATTEMPTS => {
                    warn!(chat_id = target.chat_id, attempt, ?retry_after, "final send rate limited");
                    if let Some(wait) = retry_after {
                        self.state = ThrottleState::Backoff(Instant::now() + wait);
                        self.wait_out_backoff().await;
                    }
                }
                Err(e) => {
                    warn!(chat_id = target.chat_id, attempt, error = %e, "final send failed");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::api::PhotoSource;
    use crate::types::User;

    enum Script {
        RateLimit(Option<u64>),
        Fail,
    }

    #[derive(Debug, Clone)]
    struct Sent {
        at: Instant,
        text: String,
        edit_of: Option<i64>,
    }

    #[derive(Default)]
    struct FakeMessenger {
        script: Mutex<VecDeque<Option<Script>>>,
        sent: Mutex<Vec<Sent>>,
        next_id: Mutex<i64>,
    }

    impl FakeMessenger {
        fn scripted(script: Vec<Option<Script>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn get_me(&self) -> Result<User, TelegramError> {
            Ok(User::default())
        }

        async fn send_text(&self, reply: &LiveReply, text: &str) -> Result<i64, TelegramError> {
            let step = self.script.lock().unwrap().pop_front().flatten();
            match step {
                Some(Script::RateLimit(secs)) => {
                    return Err(TelegramError::RateLimited {
                        retry_after: secs.map(Duration::from_secs),
                    })
                }
                Some(Script::Fail) => {
                    return Err(TelegramError::Api {
                        code: 400,
                        description: "Bad Request".into(),
                    })
                }
                None => {}
            }
            self.sent.lock().unwrap().push(Sent {
                at: Instant::now(),
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

        async fn delete_message(&self, _: i64, _: i64) -> Result<(), TelegramError> {
            Ok(())
        }

        async fn send_chat_action(&self, _: i64, _: &str) -> Result<(), TelegramError> {
            Ok(())
        }

        async fn send_photo(&self, _: &LiveReply, _: PhotoSource) -> Result<i64, TelegramError> {
            Ok(0)
        }

        async fn file_url(&self, file_id: &str) -> Result<String, TelegramError> {
            Ok(file_id.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_suppresses_edits_until_window_elapses() {
        let fake = FakeMessenger::scripted(vec![None, Some(Script::RateLimit(Some(5)))]);
        let mut throttler = Throttler::new(fake.clone(), LiveReply::new(42));
        let t0 = Instant::now();

        throttler.start(PLACEHOLDER).await;
        throttler.on_chunk(StreamChunk::delta("Hel")).await;
        assert!(matches!(throttler.state(), ThrottleState::Backoff(_)));

        throttler.on_chunk(StreamChunk::delta("lo")).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        throttler.on_chunk(StreamChunk::delta(" world")).await;
        // only the placeholder made it out so far
        assert_eq!(fake.sent().len(), 1);

        let reply = throttler.finish("Hello world").await;
        let sent = fake.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].text, "Hello world");
        assert_eq!(sent[1].edit_of, Some(1));
        assert!(sent[1].at - t0 >= Duration::from_secs(5));
        assert_eq!(reply, Reply::Delivered { message_id: 1 });
        assert_eq!(throttler.state(), ThrottleState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_resume_after_window() {
        let fake = FakeMessenger::scripted(vec![None, Some(Script::RateLimit(Some(5)))]);
        let mut throttler = Throttler::new(fake.clone(), LiveReply::new(42));
        throttler.start(PLACEHOLDER).await;
        throttler.on_chunk(StreamChunk::delta("a")).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        throttler.on_chunk(StreamChunk::delta("b")).await;
        let sent = fake.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].text, "ab");
        assert_eq!(throttler.state(), ThrottleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_duration_is_one_shot() {
        let fake = FakeMessenger::scripted(vec![None, Some(Script::RateLimit(None))]);
        let mut throttler = Throttler::new(fake.clone(), LiveReply::new(42));
        throttler.start(PLACEHOLDER).await;
        throttler.on_chunk(StreamChunk::delta("a")).await;
        assert_eq!(throttler.state(), ThrottleState::Idle);
        throttler.on_chunk(StreamChunk::delta("b")).await;
        assert_eq!(fake.sent().last().unwrap().text, "ab");
    }

    #[tokio::test]
    async fn send_failures_never_abort() {
        let fake = FakeMessenger::scripted(vec![Some(Script::Fail), Some(Script::Fail)]);
        let mut throttler = Throttler::new(fake.clone(), LiveReply::new(42));
        throttler.start(PLACEHOLDER).await;
        assert_eq!(throttler.reply().message_id, None);
        throttler.on_chunk(StreamChunk::delta("partial")).await;
        let reply = throttler.finish("done").await;
        assert_eq!(reply, Reply::Delivered { message_id: 1 });
        assert_eq!(fake.sent()[0].text, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn final_send_waits_out_its_own_rate_limit() {
        let fake = FakeMessenger::scripted(vec![None, Some(Script::RateLimit(Some(3)))]);
        let mut throttler = Throttler::new(fake.clone(), LiveReply::new(42));
        throttler.start(PLACEHOLDER).await;
        let t0 = Instant::now();
        throttler.finish("answer").await;
        let sent = fake.sent();
        assert_eq!(sent.last().unwrap().text, "answer");
        assert!(sent.last().unwrap().at - t0 >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn long_answer_edits_first_part_and_sends_the_rest() {
        let fake = FakeMessenger::scripted(Vec::new());
        let mut throttler = Throttler::new(fake.clone(), LiveReply::new(42));
        throttler.start(PLACEHOLDER).await;
        let line = "x".repeat(3000);
        throttler.finish(&format!("{line}\n{line}")).await;
        let sent = fake.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].edit_of, Some(1));
        assert_eq!(sent[2].edit_of, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_backoff_wait_short() {
        let fake = FakeMessenger::scripted(vec![None, Some(Script::RateLimit(Some(60)))]);
        let cancel = CancellationToken::new();
        let mut throttler =
            Throttler::new(fake.clone(), LiveReply::new(42)).with_cancellation(cancel.clone());
        throttler.start(PLACEHOLDER).await;
        throttler.on_chunk(StreamChunk::delta("a")).await;
        let t0 = Instant::now();
        cancel.cancel();
        throttler.finish("final").await;
        let sent = fake.sent();
        assert_eq!(sent.last().unwrap().text, "final");
        assert!(sent.last().unwrap().at - t0 < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn drive_folds_queued_chunks() {
        let fake = FakeMessenger::scripted(Vec::new());
        let mut throttler = Throttler::new(fake.clone(), LiveReply::new(42));
        throttler.start(PLACEHOLDER).await;
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamChunk::delta("Hel")).await.unwrap();
        tx.send(StreamChunk::delta("lo")).await.unwrap();
        tx.send(StreamChunk::full("Hello")).await.unwrap();
        drop(tx);
        throttler.drive(rx).await;
        let sent = fake.sent();
        // placeholder plus one folded edit
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].text, "Hello");
    }
}
