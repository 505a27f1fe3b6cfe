//! Detect and strip mentions of the bot in group messages.
//!
//! Entity offsets are UTF-16 code units, so the text is edited as UTF-16.

use crate::types::MessageEntity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionCheck {
    pub mentioned: bool,
    /// Text with every mention of this bot removed.
    pub content: String,
}

/// Look for `@bot_name`, a text mention of `bot_id`, or `/cmd@bot_name`.
pub fn check_mention(
    text: &str,
    entities: &[MessageEntity],
    bot_name: &str,
    bot_id: i64,
) -> MentionCheck {
    let bot_name = bot_name.trim_start_matches('@');
    let handle = format!("@{bot_name}");
    let mut units: Vec<u16> = text.encode_utf16().collect();
    let mut mentioned = false;

    // Right to left so earlier offsets stay valid after each splice.
    let mut ordered: Vec<&MessageEntity> = entities.iter().collect();
    ordered.sort_by(|a, b| b.offset.cmp(&a.offset));

    for entity in ordered {
        let start = entity.offset;
        let end = entity.offset.saturating_add(entity.length);
        if end > units.len() || start >= end {
            continue;
        }
        let fragment = String::from_utf16_lossy(&units[start..end]);
        let replacement: Option<String> = match entity.kind.as_str() {
            "mention" if fragment.eq_ignore_ascii_case(&handle) => Some(String::new()),
            "text_mention" if entity.user.as_ref().is_some_and(|u| u.id == bot_id) => {
                Some(String::new())
            }
            "bot_command" => strip_suffix_ignore_case(&fragment, &handle).map(String::from),
            _ => None,
        };
        if let Some(replacement) = replacement {
            mentioned = true;
            units.splice(start..end, replacement.encode_utf16());
        }
    }

    MentionCheck {
        mentioned,
        content: String::from_utf16_lossy(&units),
    }
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let split = s.len().checked_sub(suffix.len())?;
    if !s.is_char_boundary(split) {
        return None;
    }
    let (head, tail) = s.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(head)
}
