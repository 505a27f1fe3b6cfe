pub mod db;
pub mod dedup;
pub mod error;
pub mod history;
pub mod kv;

pub use dedup::MessageIdWindow;
pub use error::StoreError;
pub use history::{HistoryItem, HistoryPolicy, HistoryRole, HistoryStore};
pub use kv::{KvStore, MemoryKv, SqliteKv};
