//! Envelope framing for the event stream: one `data: <json>\n\n` frame per envelope.
//!
//! Encoding is stateless. [`FrameDecoder`] is the client side: it accepts bytes
//! in arbitrary chunks and yields envelopes as frames complete.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Token,
    End,
    Error,
}

/// One unit of streamed output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Envelope {
    pub fn token(chunk: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Token,
            data: Some(chunk.into()),
        }
    }

    pub fn end() -> Self {
        Self {
            kind: EnvelopeKind::End,
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            data: Some(message.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EnvelopeKind::End | EnvelopeKind::Error)
    }

    /// Encode as a single blank-line-terminated frame
    pub fn to_frame(&self) -> String {
        encode_frame(self)
    }
}

/// `data: <json>\n\n`
pub fn encode_frame(envelope: &Envelope) -> String {
    // Two string fields and a unit enum always serialize
    let json = serde_json::to_string(envelope).unwrap_or_default();
    format!("data: {}\n\n", json)
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame is not valid UTF-8")]
    Utf8,
    #[error("invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Incremental decoder for `data:` frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and collect every frame they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Envelope, WireError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some((end, sep_len)) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            if let Some(result) = decode_frame(&frame) {
                out.push(result);
            }
        }
        out
    }

    /// Bytes received that do not yet form a complete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Position and length of the first blank-line separator
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buf, b"\n\n").map(|i| (i, 2));
    let crlf = find(buf, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decode one frame. Frames without `data:` lines (comments, keep-alives) yield nothing.
fn decode_frame(frame: &[u8]) -> Option<Result<Envelope, WireError>> {
    let text = match std::str::from_utf8(frame) {
        Ok(text) => text,
        Err(_) => return Some(Err(WireError::Utf8)),
    };

    let data: Vec<&str> = text
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();

    if data.is_empty() {
        return None;
    }
    Some(serde_json::from_str(&data.join("\n")).map_err(WireError::from))
}
