//! Conversation history: load, dual trimming (item count + token budget), save.
//!
//! History is stored as one JSON array per chat key and replaced as a whole
//! after every exchange.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use relay_core::config::HistoryConfig;

use crate::kv::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub role: HistoryRole,
    #[serde(default)]
    pub content: String,
}

impl HistoryItem {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPolicy {
    pub auto_trim: bool,
    pub max_length: i64,
    /// Negative disables budget trimming.
    pub max_tokens: i64,
}

impl HistoryPolicy {
    /// Trimming with a non-positive length means no memory at all.
    pub fn is_disabled(&self) -> bool {
        self.auto_trim && self.max_length <= 0
    }
}

impl From<&HistoryConfig> for HistoryPolicy {
    fn from(cfg: &HistoryConfig) -> Self {
        Self {
            auto_trim: cfg.auto_trim,
            max_length: cfg.max_length,
            max_tokens: cfg.max_tokens,
        }
    }
}

/// Default token estimator: one token per character.
pub fn char_count(text: &str) -> usize {
    text.chars().count()
}

/// Keep the most recent items that fit both the item count and the token budget.
///
/// The result is always a suffix of `items`. The budget cut is tight: adding
/// back the newest dropped item would exceed `max_tokens`.
pub fn trim_history(
    mut items: Vec<HistoryItem>,
    policy: &HistoryPolicy,
    estimate: impl Fn(&str) -> usize,
) -> Vec<HistoryItem> {
    if !policy.auto_trim {
        return items;
    }
    if policy.is_disabled() {
        return Vec::new();
    }

    let max_length = policy.max_length as usize;
    if items.len() > max_length {
        items.drain(..items.len() - max_length);
    }

    if policy.max_tokens >= 0 {
        let budget = policy.max_tokens as usize;
        let mut total = 0usize;
        let mut cut = 0usize;
        for (i, item) in items.iter().enumerate().rev() {
            total += estimate(&item.content);
            if total > budget {
                cut = i + 1;
                break;
            }
        }
        items.drain(..cut);
    }

    items
}

pub struct HistoryStore<'a> {
    kv: &'a dyn KvStore,
}

impl<'a> HistoryStore<'a> {
    pub fn new(kv: &'a dyn KvStore) -> Self {
        Self { kv }
    }

    /// Load and trim the history under `key`.
    ///
    /// Missing or corrupt data yields an empty history; this never fails.
    pub async fn load(
        &self,
        key: &str,
        policy: &HistoryPolicy,
        estimate: impl Fn(&str) -> usize + Sync,
    ) -> Vec<HistoryItem> {
        if policy.is_disabled() {
            return Vec::new();
        }
        let raw = match self.kv.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(key, error = %e, "history read failed, starting empty");
                return Vec::new();
            }
        };
        let items: Vec<HistoryItem> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                warn!(key, error = %e, "corrupt history discarded");
                return Vec::new();
            }
        };
        let loaded = items.len();
        let trimmed = trim_history(items, policy, estimate);
        debug!(key, loaded, kept = trimmed.len(), "history loaded");
        trimmed
    }

    /// Append one exchange and persist the whole sequence.
    ///
    /// Trimming is re-applied so the stored history stays inside both bounds.
    /// Write failures are logged and swallowed.
    pub async fn append_and_save(
        &self,
        key: &str,
        mut history: Vec<HistoryItem>,
        user: HistoryItem,
        assistant: HistoryItem,
        policy: &HistoryPolicy,
        estimate: impl Fn(&str) -> usize + Sync,
    ) {
        if policy.is_disabled() {
            return;
        }
        history.push(user);
        history.push(assistant);
        let history = trim_history(history, policy, estimate);

        let json = match serde_json::to_string(&history) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "history serialization failed");
                return;
            }
        };
        if let Err(e) = self.kv.put(key, &json, None).await {
            warn!(key, error = %e, "history write failed");
        }
    }

    /// Overwrite the stored history as is.
    pub async fn replace(
        &self,
        key: &str,
        history: &[HistoryItem],
    ) -> Result<(), crate::error::StoreError> {
        let json = serde_json::to_string(history)?;
        self.kv.put(key, &json, None).await
    }

    pub async fn clear(&self, key: &str) -> Result<(), crate::error::StoreError> {
        self.kv.delete(key).await
    }
}
