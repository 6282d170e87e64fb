// src/command/line_buffer.rs - Assemble command lines from a raw byte stream

/// Accumulates bytes until a `\n` or `\r`, then yields the trimmed line.
/// Blank lines (including the empty half of a `\r\n` pair) are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush an unterminated final line, e.g. at end of input.
    pub fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn take_line(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}
