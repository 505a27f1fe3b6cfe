//! Bounded window of recently processed message ids, one per chat.

use std::collections::VecDeque;

use tracing::warn;

use crate::error::StoreError;
use crate::kv::KvStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdWindow {
    ids: VecDeque<i64>,
    capacity: usize,
}

impl MessageIdWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::new(),
            capacity,
        }
    }

    /// Parse a stored JSON array. Corrupt data yields an empty window.
    pub fn parse(raw: Option<&str>, capacity: usize) -> Self {
        let ids: Vec<i64> = match raw.map(serde_json::from_str::<Vec<i64>>) {
            Some(Ok(ids)) => ids,
            Some(Err(e)) => {
                warn!(error = %e, "corrupt message id window discarded");
                Vec::new()
            }
            None => Vec::new(),
        };
        let mut window = Self::new(capacity);
        for id in ids {
            window.push(id);
        }
        window
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Record `id`, evicting the oldest entries beyond capacity.
    pub fn push(&mut self, id: i64) {
        self.ids.push_back(id);
        while self.ids.len() > self.capacity {
            self.ids.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(&self.ids)?)
    }
}

/// Returns `false` when `id` was already seen under `key`; otherwise records it.
pub async fn record_if_new(
    kv: &dyn KvStore,
    key: &str,
    id: i64,
    capacity: usize,
) -> Result<bool, StoreError> {
    let raw = match kv.get(key).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(key, error = %e, "message id window read failed");
            None
        }
    };
    let mut window = MessageIdWindow::parse(raw.as_deref(), capacity);
    if window.contains(id) {
        return Ok(false);
    }
    window.push(id);
    kv.put(key, &window.to_json()?, None).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn second_submission_is_rejected() {
        let kv = MemoryKv::new();
        assert!(record_if_new(&kv, "ids", 7, 100).await.unwrap());
        assert!(!record_if_new(&kv, "ids", 7, 100).await.unwrap());
        assert!(record_if_new(&kv, "ids", 8, 100).await.unwrap());
    }

    #[tokio::test]
    async fn window_never_exceeds_capacity() {
        let kv = MemoryKv::new();
        for id in 0..250 {
            assert!(record_if_new(&kv, "ids", id, 100).await.unwrap());
        }
        let raw = kv.get("ids").await.unwrap();
        let window = MessageIdWindow::parse(raw.as_deref(), 100);
        assert_eq!(window.len(), 100);
        // oldest evicted first
        assert!(!window.contains(149));
        assert!(window.contains(150));
        assert!(window.contains(249));
        // an evicted id is accepted again
        assert!(record_if_new(&kv, "ids", 0, 100).await.unwrap());
    }

    #[test]
    fn corrupt_window_is_empty() {
        assert!(MessageIdWindow::parse(Some("oops"), 100).is_empty());
        assert!(MessageIdWindow::parse(None, 100).is_empty());
    }
}
