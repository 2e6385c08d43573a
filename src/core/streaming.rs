//! UTF-8 assembly for token-at-a-time decoding.
//!
//! A single token's bytes may end in the middle of a multi-byte code point.
//! [`Utf8Assembler`] buffers raw bytes and releases only complete, valid
//! UTF-8, holding back a trailing incomplete sequence until its
//! continuation bytes arrive. Callers inspect the held-back bytes at end of
//! stream to distinguish "still incomplete" from "done".

/// Incremental byte buffer that yields the longest complete-UTF-8 prefix.
#[derive(Debug, Default)]
pub struct Utf8Assembler {
    buffer: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(16),
        }
    }

    /// Append `bytes` and return any newly completed text.
    ///
    /// Returns `None` while the buffered bytes form only the prefix of a
    /// multi-byte code point (or are genuinely invalid; invalid bytes stay
    /// buffered so the caller's end-of-stream validation sees them).
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.buffer.extend_from_slice(bytes);
        let valid_len = self.complete_prefix_len();
        if valid_len == 0 {
            return None;
        }
        let complete: Vec<u8> = self.buffer.drain(..valid_len).collect();
        // Verified UTF-8 by complete_prefix_len.
        Some(unsafe { String::from_utf8_unchecked(complete) })
    }

    /// Bytes still waiting for continuation.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Take the buffered bytes, leaving the assembler empty.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Length of the longest valid UTF-8 prefix whose remainder could still
    /// become valid with more bytes.
    fn complete_prefix_len(&self) -> usize {
        let bytes = &self.buffer;
        let len = bytes.len();
        if len == 0 {
            return 0;
        }
        if std::str::from_utf8(bytes).is_ok() {
            return len;
        }
        // A split code point leaves at most 3 trailing bytes; check whether
        // chopping them yields a valid prefix plus a plausible start of a
        // multi-byte sequence.
        for held_back in 1..=3.min(len) {
            let keep = len - held_back;
            if keep == 0 {
                continue;
            }
            if std::str::from_utf8(&bytes[..keep]).is_ok()
                && could_be_incomplete_sequence(&bytes[keep..])
            {
                return keep;
            }
        }
        // Invalid bytes somewhere: release nothing and let the caller's
        // final validation surface the error.
        0
    }
}

/// Whether `bytes` could be the start of a not-yet-complete UTF-8 sequence.
fn could_be_incomplete_sequence(bytes: &[u8]) -> bool {
    let Some(&first) = bytes.first() else {
        return false;
    };
    match first {
        0xC0..=0xDF => bytes.len() < 2,
        0xE0..=0xEF => bytes.len() < 3 && bytes[1..].iter().all(|b| (0x80..=0xBF).contains(b)),
        0xF0..=0xF7 => bytes.len() < 4 && bytes[1..].iter().all(|b| (0x80..=0xBF).contains(b)),
        _ => false,
    }
}
