//! Chat scope and the storage keys derived from it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatType {
    pub fn is_group(self) -> bool {
        matches!(self, ChatType::Group | ChatType::Supergroup)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChatType::Private => "private",
            ChatType::Group => "group",
            ChatType::Supergroup => "supergroup",
            ChatType::Channel => "channel",
        }
    }
}

/// Where a message came from and who sent it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatScope {
    pub chat_id: i64,
    pub chat_type: ChatType,
    /// Sender id; equals `chat_id` for messages without a sender (channel posts).
    pub speaker_id: i64,
}

/// Storage keys for one (chat, bot, speaker) triple.
///
/// | Key                | Format |
/// |--------------------|--------|
/// | `history`          | `history:{chat}:{bot}[:{speaker}]` |
/// | `last_message_ids` | `last_message_id:{history}` |
/// | `user_config`      | `user_config:{chat}:{bot}[:{speaker}]` |
/// | `snapshot`         | `last_message:{history}` |
///
/// The speaker suffix is added for group chats unless share mode is on, in
/// which case every member of the group maps to the same keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedKeys {
    pub history: String,
    pub last_message_ids: String,
    pub user_config: String,
    pub snapshot: String,
}

impl DerivedKeys {
    pub fn derive(scope: &ChatScope, bot_id: i64, group_share_mode: bool) -> Self {
        let mut base = format!("{}:{}", scope.chat_id, bot_id);
        if scope.chat_type.is_group() && !group_share_mode {
            base.push(':');
            base.push_str(&scope.speaker_id.to_string());
        }
        let history = format!("history:{base}");
        Self {
            last_message_ids: format!("last_message_id:{history}"),
            snapshot: format!("last_message:{history}"),
            user_config: format!("user_config:{base}"),
            history,
        }
    }
}
