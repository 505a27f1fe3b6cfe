use std::time::Duration;

use relay_core::RelayError;
use relay_store::StoreError;

/// Errors produced by the Bot API client.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited by Telegram (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Telegram API error ({code}): {description}")]
    Api { code: u16, description: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl TelegramError {
    /// Telegram rejected the markup of the text, not the request itself.
    pub fn is_parse_mode_rejection(&self) -> bool {
        matches!(self, TelegramError::Api { description, .. }
            if description.contains("can't parse entities"))
    }

    /// An edit whose text and markup equal the current message.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, TelegramError::Api { description, .. }
            if description.contains("message is not modified"))
    }
}

/// Why a pipeline stage halted. The first group are ordinary control-flow
/// signals; the rest wrap failures from collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Ignore edited message")]
    EditedMessage,

    #[error("Invalid message")]
    InvalidMessage,

    #[error("Unknown bot token")]
    UnknownBot,

    #[error("Not supported message type")]
    UnsupportedMessage,

    #[error("Not set bot name")]
    BotNameUnavailable,

    #[error("Not mention")]
    NotMentioned,

    #[error("Group chat is not enabled")]
    GroupChatDisabled,

    #[error("Ignore old message")]
    DuplicateMessage,

    #[error(transparent)]
    Telegram(#[from] TelegramError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] RelayError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Short error code used in logs and webhook failure bodies.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::EditedMessage => "EDITED_MESSAGE",
            StageError::InvalidMessage => "INVALID_MESSAGE",
            StageError::UnknownBot => "UNKNOWN_BOT",
            StageError::UnsupportedMessage => "UNSUPPORTED_MESSAGE",
            StageError::BotNameUnavailable => "BOT_NAME_UNAVAILABLE",
            StageError::NotMentioned => "NOT_MENTIONED",
            StageError::GroupChatDisabled => "GROUP_CHAT_DISABLED",
            StageError::DuplicateMessage => "DUPLICATE_MESSAGE",
            StageError::Telegram(_) => "TELEGRAM_ERROR",
            StageError::Store(_) => "STORE_ERROR",
            StageError::Config(_) => "CONFIG_ERROR",
            StageError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Expected short-circuits, as opposed to something going wrong.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            StageError::EditedMessage
                | StageError::InvalidMessage
                | StageError::UnknownBot
                | StageError::UnsupportedMessage
                | StageError::BotNameUnavailable
                | StageError::NotMentioned
                | StageError::GroupChatDisabled
                | StageError::DuplicateMessage
        )
    }
}
