//! Bounded text buffers.

/// Append `text` and keep only the last `max_chars` characters.
pub fn push_bounded_tail(tail: &mut String, text: &str, max_chars: usize) {
    tail.push_str(text);
    // Byte length bounds the char count from above.
    if tail.len() <= max_chars {
        return;
    }
    let count = tail.chars().count();
    if count > max_chars {
        let cut = tail
            .char_indices()
            .nth(count - max_chars)
            .map_or(0, |(idx, _)| idx);
        tail.drain(..cut);
    }
}

/// The last `max_chars` characters of `text`.
#[must_use]
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let cut = text
        .char_indices()
        .nth(count - max_chars)
        .map_or(0, |(idx, _)| idx);
    &text[cut..]
}
