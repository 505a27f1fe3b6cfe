//! The subset of Bot API objects the relay reads and writes.

use serde::{Deserialize, Serialize};

use relay_core::ChatType;

/// Webhook payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_message: Option<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Offsets and lengths are in UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caption_entities: Vec<MessageEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photo: Vec<PhotoSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message: Option<Box<Message>>,
}

impl Message {
    /// Text, else caption, else empty.
    pub fn content(&self) -> &str {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("")
    }

    pub fn has_supported_content(&self) -> bool {
        self.text.is_some() || self.caption.is_some() || !self.photo.is_empty()
    }

    /// Sender id, or the chat id for messages without a sender.
    pub fn speaker_id(&self) -> i64 {
        self.from.as_ref().map(|u| u.id).unwrap_or(self.chat.id)
    }
}

/// Pick a photo size: non-negative offsets count from the smallest,
/// negative ones from the largest. Out-of-range offsets are clamped.
pub fn find_photo_file_id(photos: &[PhotoSize], offset: i64) -> Option<&str> {
    if photos.is_empty() {
        return None;
    }
    let len = photos.len() as i64;
    let index = if offset >= 0 { offset } else { len + offset };
    let index = index.clamp(0, len - 1) as usize;
    Some(photos[index].file_id.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardButton {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyKeyboard {
    pub keyboard: Vec<Vec<KeyboardButton>>,
    pub selective: bool,
    pub resize_keyboard: bool,
    pub one_time_keyboard: bool,
}

impl ReplyKeyboard {
    /// One row of command buttons, hidden after use.
    pub fn commands(commands: &[&str]) -> Self {
        Self {
            keyboard: vec![commands
                .iter()
                .map(|c| KeyboardButton {
                    text: (*c).to_string(),
                })
                .collect()],
            selective: true,
            resize_keyboard: true,
            one_time_keyboard: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn photo(id: &str) -> PhotoSize {
        PhotoSize {
            file_id: id.into(),
            file_unique_id: String::new(),
            width: 0,
            height: 0,
            file_size: None,
        }
    }

    #[test]
    fn parses_group_message_with_reply() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 10,
            "message": {
                "message_id": 5,
                "from": {"id": 7, "is_bot": false, "first_name": "Ann"},
                "chat": {"id": -100, "type": "supergroup", "title": "g"},
                "date": 0,
                "text": "@relay_bot hi",
                "entities": [{"type": "mention", "offset": 0, "length": 10}],
                "reply_to_message": {
                    "message_id": 4,
                    "from": {"id": 1, "is_bot": true, "first_name": "Relay"},
                    "chat": {"id": -100, "type": "supergroup"},
                    "date": 0,
                    "text": "earlier"
                }
            }
        }))
        .unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.kind, ChatType::Supergroup);
        assert_eq!(msg.entities[0].kind, "mention");
        assert_eq!(msg.reply_to_message.unwrap().from.unwrap().id, 1);
        assert!(update.edited_message.is_none());
    }

    #[test]
    fn content_and_speaker_fallbacks() {
        let msg = Message {
            message_id: 1,
            chat: Chat {
                id: 42,
                kind: ChatType::Channel,
                title: None,
            },
            caption: Some("look".into()),
            ..Message::default()
        };
        assert_eq!(msg.content(), "look");
        assert_eq!(msg.speaker_id(), 42);
        assert!(msg.has_supported_content());
        assert!(!Message::default().has_supported_content());
    }

    #[test]
    fn photo_offset_selection() {
        let photos = vec![photo("s"), photo("m"), photo("l")];
        assert_eq!(find_photo_file_id(&photos, -1), Some("l"));
        assert_eq!(find_photo_file_id(&photos, 0), Some("s"));
        assert_eq!(find_photo_file_id(&photos, 1), Some("m"));
        assert_eq!(find_photo_file_id(&photos, 9), Some("l"));
        assert_eq!(find_photo_file_id(&photos, -9), Some("s"));
        assert_eq!(find_photo_file_id(&[], -1), None);
    }
}
