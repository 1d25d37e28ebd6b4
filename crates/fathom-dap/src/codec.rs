//! DAP wire framing.
//!
//! Messages are framed with an HTTP-like header section:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```
//!
//! The decoder is incremental: it accumulates raw bytes and yields every
//! complete message they contain, keeping a partial trailing message for the
//! next chunk. Header blocks without `Content-Length` and bodies that fail to
//! parse are discarded and framing advances past them.

use serde_json::Value;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Frame a message for the wire.
pub fn encode(message: &Value) -> Vec<u8> {
    // `Value` serialization cannot fail: every key is a string.
    let body = serde_json::to_vec(message).unwrap_or_default();
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    out
}

/// Incremental frame decoder over a growing byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every message it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            let Some(header_end) = find(&self.buf, HEADER_TERMINATOR) else {
                break;
            };
            let body_start = header_end + HEADER_TERMINATOR.len();

            let Some(length) = content_length(&self.buf[..header_end]) else {
                tracing::debug!("discarding framed block without a Content-Length header");
                self.buf.drain(..body_start);
                continue;
            };

            if self.buf.len() < body_start + length {
                break;
            }

            match serde_json::from_slice(&self.buf[body_start..body_start + length]) {
                Ok(message) => messages.push(message),
                Err(err) => tracing::debug!("discarding malformed DAP payload: {err}"),
            }
            self.buf.drain(..body_start + length);
        }
        messages
    }
}

fn content_length(header: &[u8]) -> Option<usize> {
    for line in header.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
