//! Server-sent events reader shared by every streaming adapter.
//!
//! SSE format: `event: <type>\ndata: <json>\n\n`. Only `data` lines matter
//! here; `data: [DONE]` ends the stream.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::provider::{Envelope, ProviderError, StreamChunk};

#[derive(Debug, PartialEq, Eq)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Parse a single SSE line.
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event:") {
        Some(SseParsed::Event(event_type.trim().to_string()))
    } else {
        line.strip_prefix("data:")
            .map(|data| SseParsed::Data(data.trim_start().to_string()))
    }
}

/// Splits a byte stream into complete lines. Bytes are buffered until a
/// newline arrives, so multi-byte characters split across network chunks
/// survive intact.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    /// Whatever is left after the stream closed without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// What one `data` payload contributed.
#[derive(Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Done,
    Skip,
}

/// Interpret one `data` payload. Malformed JSON is skipped, not fatal;
/// an error envelope aborts the stream.
pub fn interpret_payload(data: &str, envelope: &Envelope) -> Result<Payload, ProviderError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Payload::Done);
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "skipping malformed stream payload");
            return Ok(Payload::Skip);
        }
    };
    if let Some(message) = (envelope.error)(&value) {
        return Err(ProviderError::Api {
            status: 200,
            message,
        });
    }
    Ok(match (envelope.delta)(&value) {
        Some(text) if !text.is_empty() => Payload::Text(text),
        _ => Payload::Skip,
    })
}

/// Read a streaming response to the end, forwarding each fragment and
/// finishing with one `StreamChunk::full`. Returns the assembled answer.
pub async fn read_sse_stream(
    resp: reqwest::Response,
    tx: &mpsc::Sender<StreamChunk>,
    envelope: Envelope,
) -> Result<String, ProviderError> {
    use futures_util::StreamExt;

    let mut answer = String::new();
    let mut lines = LineBuffer::default();
    let mut receiver_open = true;
    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk?;
        for line in lines.push(&chunk) {
            if let Some(SseParsed::Data(data)) = parse_sse_line(&line) {
                match interpret_payload(&data, &envelope)? {
                    Payload::Done => break 'outer,
                    Payload::Skip => {}
                    Payload::Text(text) => {
                        answer.push_str(&text);
                        if receiver_open && tx.send(StreamChunk::delta(text)).await.is_err() {
                            // Keep assembling the answer even if nobody listens.
                            receiver_open = false;
                        }
                    }
                }
            }
        }
    }
    if let Some(line) = lines.finish() {
        if let Some(SseParsed::Data(data)) = parse_sse_line(&line) {
            if let Payload::Text(text) = interpret_payload(&data, &envelope)? {
                answer.push_str(&text);
            }
        }
    }

    if receiver_open {
        let _ = tx.send(StreamChunk::full(answer.clone())).await;
    }
    Ok(answer)
}
