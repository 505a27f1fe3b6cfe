pub mod api;
pub mod commands;
pub mod context;
pub mod error;
pub mod mention;
pub mod orchestrator;
pub mod pipeline;
pub mod send;
pub mod throttle;
pub mod types;

pub use api::{Messenger, PhotoSource, TelegramClient};
pub use commands::{BuiltinCommands, CommandHandler};
pub use context::{BotIdentityCache, ChatContext, LiveReply};
pub use error::{StageError, TelegramError};
pub use pipeline::{Outcome, Pipeline, Reply, Stage};
pub use types::Update;
