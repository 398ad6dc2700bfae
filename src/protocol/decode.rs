use anyhow::Result;
use tracing::warn;

use super::types::StreamMessage;

/// Upper bound on a buffered partial line. Tool-result lines can run to
/// hundreds of kilobytes; anything past this is treated as a runaway line
/// and dropped rather than held in memory.
const MAX_PENDING_LINE: usize = 1024 * 1024;

/// Parse a single stream-json line into a `StreamMessage`.
///
/// Returns `Ok(None)` for blank lines.
/// Returns `Err` for malformed JSON (caller should warn, not crash).
pub fn parse_line(line: &str) -> Result<Option<StreamMessage>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let msg: StreamMessage = serde_json::from_str(line)?;
    Ok(Some(msg))
}

/// Incremental decoder over the agent's stdout byte stream.
///
/// Chunks may be split anywhere, including mid-line and mid-UTF-8-code-point:
/// bytes are buffered until a `\n` completes a line, and only complete lines
/// are interpreted as text. A line that fails to parse is dropped with a
/// diagnostic; decoding always continues at the next newline.
pub struct StreamDecoder {
    buf: Vec<u8>,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
    dropped: u64,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            discarding: false,
            dropped: 0,
        }
    }

    /// Feed a chunk of raw output, invoking `sink` once per decoded message,
    /// in input order.
    pub fn feed<F: FnMut(StreamMessage)>(&mut self, mut chunk: &[u8], sink: &mut F) {
        while let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let (head, rest) = chunk.split_at(pos);
            chunk = &rest[1..];
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if !self.buffer_bytes(head) {
                // The line we were accumulating ends at this newline.
                self.discarding = false;
                continue;
            }
            self.finish_line(sink);
        }
        if !self.discarding {
            self.buffer_bytes(chunk);
        }
    }

    /// Flush a trailing line that was not newline-terminated.
    ///
    /// Call once at end of stream.
    pub fn finish<F: FnMut(StreamMessage)>(&mut self, sink: &mut F) {
        if self.discarding {
            self.discarding = false;
            self.buf.clear();
            return;
        }
        if !self.buf.is_empty() {
            self.finish_line(sink);
        }
    }

    /// Number of lines dropped so far (malformed or oversized).
    pub fn dropped_lines(&self) -> u64 {
        self.dropped
    }

    fn buffer_bytes(&mut self, bytes: &[u8]) -> bool {
        if self.buf.len() + bytes.len() > MAX_PENDING_LINE {
            warn!(
                pending = self.buf.len() + bytes.len(),
                "dropping oversized line from agent stream"
            );
            self.buf.clear();
            self.discarding = true;
            self.dropped += 1;
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    fn finish_line<F: FnMut(StreamMessage)>(&mut self, sink: &mut F) {
        let raw = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&raw);
        match parse_line(&text) {
            Ok(Some(msg)) => sink(msg),
            Ok(None) => {}
            Err(e) => {
                self.dropped += 1;
                let preview: String = text.chars().take(200).collect();
                warn!(error = %e, line = %preview, "dropping unparseable line from agent stream");
            }
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
