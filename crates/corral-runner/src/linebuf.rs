//! Line buffering for process output
//!
//! Subprocess pipes deliver arbitrary byte chunks; a chunk boundary in the
//! middle of a line must never appear truncated in logs. `LineBuffer` holds
//! the partial tail until the newline arrives, and defers UTF-8 decoding to
//! complete lines so a multibyte character split across two chunks decodes
//! intact instead of as replacement characters.

/// Accumulates partial output chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the complete lines it closed, stripped of line
    /// terminators (`\n` and a trailing `\r`) and decoded lossily.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        self.partial.extend_from_slice(chunk);

        while let Some(idx) = self.partial.iter().position(|&b| b == b'\n') {
            let rest = self.partial.split_off(idx + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        lines
    }

    /// Drain the unterminated tail, if any. Call once after the stream ends
    /// so a final line without a newline is still emitted.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.partial);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}
