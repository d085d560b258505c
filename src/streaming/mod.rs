use serde_json::Value;
use tracing::trace;

use crate::error::ClientError;
use crate::models::openai::ChatCompletionChunk;

// ==================================================================================================
// Server-Sent Events parsing
// ==================================================================================================

/// Terminal marker of an OpenAI-compatible completion stream.
const DONE_MARKER: &str = "[DONE]";

/// Incremental parser for a `text/event-stream` chat-completion body.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// sequences and JSON payloads split across network chunks are reassembled
/// before decoding. Only `data:` lines carry payloads; comments (`:`),
/// `event:`, `id:` and `retry:` lines are ignored.
#[derive(Debug, Default, Clone)]
pub struct SseParser {
    buffer: Vec<u8>,
    done: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` marker has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed bytes into the parser and extract complete chunks.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ChatCompletionChunk>, ClientError> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(chunk) = self.parse_line(&line)? {
                chunks.push(chunk);
            }
        }

        Ok(chunks)
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finalize(&mut self) -> Result<Vec<ChatCompletionChunk>, ClientError> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return Ok(Vec::new());
        }

        let line = std::mem::take(&mut self.buffer);
        Ok(self.parse_line(&line)?.into_iter().collect())
    }

    fn parse_line(&mut self, raw: &[u8]) -> Result<Option<ChatCompletionChunk>, ClientError> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);

        let Some(payload) = line.strip_prefix("data:") else {
            if !line.is_empty() {
                trace!(line = %line, "Ignoring non-data SSE line");
            }
            return Ok(None);
        };

        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(None);
        }
        if payload == DONE_MARKER {
            self.done = true;
            return Ok(None);
        }

        let json: Value = serde_json::from_str(payload).map_err(|e| {
            ClientError::Protocol(format!(
                "invalid JSON in stream event: {} - {}",
                e,
                payload.chars().take(100).collect::<String>()
            ))
        })?;

        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ClientError::Protocol(format!("endpoint reported: {}", message)));
        }

        let chunk = serde_json::from_value(json)
            .map_err(|e| ClientError::Protocol(format!("unexpected chunk shape: {}", e)))?;
        Ok(Some(chunk))
    }
}
