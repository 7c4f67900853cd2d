//! Incremental decoding of child-process output.
//!
//! [`ChunkDecoder`] turns arbitrary byte chunks into text without splitting
//! multi-byte characters; [`LineSplitter`] turns that text into complete
//! newline-terminated lines for the NDJSON stream modes.

/// UTF-8 decoder that carries an incomplete trailing sequence to the next chunk.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    carry: Vec<u8>,
}

impl ChunkDecoder {
    /// Fresh decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, holding back up to three bytes of an unfinished character.
    ///
    /// Invalid sequences are replaced with U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.carry.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            // A genuinely invalid byte; decode lossily up to the end.
            Err(_) => incomplete_suffix_start(&self.carry),
        };
        let rest = self.carry.split_off(valid_up_to);
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry = rest;
        text
    }

    /// Flush whatever is still carried, lossily.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        text
    }
}

/// Start index of a trailing incomplete UTF-8 sequence, or `bytes.len()`.
fn incomplete_suffix_start(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=3.min(len) {
        let idx = len - back;
        let byte = bytes[idx];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => return len,
        };
        return if back < needed { idx } else { len };
    }
    len
}

/// Splits text into trimmed, non-empty lines, buffering the unterminated tail.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: String,
}

impl LineSplitter {
    /// Fresh splitter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text; returns every line completed by it.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut lines = Vec::new();
        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=idx).collect();
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_owned());
            }
        }
        lines
    }

    /// Return the unterminated remainder, if any, at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    }
}
