//! Conversation titles derived from the first message

/// Longest title, in characters
pub const TITLE_MAX_CHARS: usize = 50;

/// Longest word-boundary prefix of `text` of at most [`TITLE_MAX_CHARS`]
/// characters. A single word longer than the limit is cut at the limit.
/// Empty text has no title.
pub fn derive_title(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let cut = match text.char_indices().nth(TITLE_MAX_CHARS) {
        Some((byte_index, _)) => byte_index,
        None => return Some(text.to_string()),
    };

    let head = &text[..cut];
    if text[cut..].starts_with(char::is_whitespace) {
        return Some(head.trim_end().to_string());
    }

    let title = match head.rfind(char::is_whitespace) {
        Some(boundary) => head[..boundary].trim_end(),
        None => head,
    };
    Some(title.to_string())
}
