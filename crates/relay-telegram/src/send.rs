//! Fitting long answers into Telegram messages.
//!
//! Telegram's message limit is 4096 characters; chunks are capped at 4090.

/// Maximum characters per Telegram message.
pub const CHUNK_MAX: usize = 4090;

/// Longest prefix of `text` with at most `max` characters.
pub fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Code-fence-aware splitter.
///
/// Splits on line boundaries. When a split falls inside a fenced code block
/// the fence is closed at the end of the chunk and re-opened at the start of
/// the next one. Lines longer than a chunk are force-split.
pub fn split_chunks_smart(text: &str) -> Vec<String> {
    if char_len(text) <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let line_len = char_len(line);
        let cost = if current.is_empty() {
            line_len
        } else {
            1 + line_len
        };

        // room for the closing fence
        let reserve = if fence_lang.is_some() { 4 } else { 0 };
        if !current.is_empty() && current_len + cost + reserve > CHUNK_MAX {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
            if let Some(lang) = &fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current_len = 3 + char_len(lang);
            }
        }

        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;

        if let Some(after_fence) = line.trim_start().strip_prefix("```") {
            fence_lang = match fence_lang {
                Some(_) => None,
                None => Some(after_fence.trim().to_string()),
            };
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    let mut result = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mut remaining = chunk.as_str();
        while char_len(remaining) > CHUNK_MAX {
            let window = clip(remaining, CHUNK_MAX);
            let split_at = window
                .rfind('\n')
                .or_else(|| window.rfind(' '))
                .filter(|&i| i > 0)
                .unwrap_or(window.len());
            result.push(remaining[..split_at].to_string());
            remaining = remaining[split_at..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}
