//! Incremental parser for line-delimited JSON generate responses.
//!
//! The backend streams one JSON object per line:
//!
//! ```text
//! {"model":"llama3.1","response":"Hi","done":false}
//! {"model":"llama3.1","response":" there","done":false}
//! {"model":"llama3.1","response":"","done":true}
//! ```
//!
//! Network chunks may split a line (or a multi-byte character) anywhere, so
//! bytes are buffered until a newline arrives.
//!
//! # Examples
//!
//! ```
//! use cithia::llm::ndjson::{GenerateLine, NdjsonLineParser};
//!
//! let mut parser = NdjsonLineParser::new();
//! let lines = parser.push(b"{\"response\":\"Hi\"}\n{\"respo");
//! assert_eq!(lines.len(), 1);
//! assert_eq!(
//!     GenerateLine::parse(&lines[0]).ok().map(|l| l.response),
//!     Some("Hi".to_owned())
//! );
//! ```

use serde::Deserialize;

/// One decoded line of a generate response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GenerateLine {
    /// Text fragment produced since the previous line.
    #[serde(default)]
    pub response: String,
    /// Whether the backend finished generating.
    #[serde(default)]
    pub done: bool,
    /// Error reported in-band by the backend.
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerateLine {
    /// Decode one line of JSON.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the line is not a JSON object.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Splits a byte stream into complete, non-blank text lines.
#[derive(Debug, Default)]
pub struct NdjsonLineParser {
    buffer: Vec<u8>,
}

impl NdjsonLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes; returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Return the trailing unterminated line, if any. Call when the stream ends.
    pub fn flush(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        decode_line(&raw)
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
