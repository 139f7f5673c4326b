//! SSE stream decoding
//!
//! Turns the raw body of a streaming chat completion into `StreamEvent`s and
//! folds the deltas into the response text, publishing each snapshot as it
//! grows. Handles both chunk shapes seen in the wild: incremental
//! (`choices[0].delta.content`) and full-message (`choices[0].message.content`).

use crate::error::AttemptError;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;

/// Chunked response body as handed over by a transport
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, AttemptError>> + Send>>;

/// Terminal payload of an SSE completion stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text fragment to append
    Delta(String),
    /// `data: [DONE]` seen, nothing follows
    Done,
    /// Data line whose payload was not valid JSON (skipped)
    Malformed(String),
    /// In-band upstream error (`{"error": {...}}`), carrying its message
    Error(String),
}

/// How a decoded stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Termination {
    /// Saw the `[DONE]` sentinel
    Closed,
    /// Transport ended without a sentinel
    #[default]
    Exhausted,
    /// Transport failed mid-stream
    Interrupted,
}

/// Result of folding a stream
#[derive(Debug, Clone, Default)]
pub struct DecodedStream {
    pub text: String,
    pub termination: Termination,
    /// Read error that cut the stream short, next to the partial text
    pub error: Option<AttemptError>,
    /// Number of skipped malformed frames
    pub malformed: usize,
    /// Most recent skipped malformed frame
    pub last_malformed: Option<String>,
    /// Message of the last in-band error frame
    pub upstream_error: Option<String>,
}

// Internal types for parsing stream chunks
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChunkContent>,
    message: Option<ChunkContent>,
}

#[derive(Debug, Deserialize)]
struct ChunkContent {
    content: Option<String>,
}

impl StreamChunk {
    fn into_event(self) -> Option<StreamEvent> {
        if let Some(error) = &self.error {
            return Some(StreamEvent::Error(error_message(error)));
        }
        self.content().map(StreamEvent::Delta)
    }

    /// Text of the first choice, delta form first
    fn content(self) -> Option<String> {
        let choice = self.choices.into_iter().next()?;
        choice
            .delta
            .and_then(|d| d.content)
            .or_else(|| choice.message.and_then(|m| m.content))
            .filter(|s| !s.is_empty())
    }
}

/// `error.message`, a bare string error, or the raw error JSON
fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(String::from)
        .unwrap_or_else(|| error.to_string())
}

/// Decode a single SSE line. `None` means the line carries no event.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }

    let Some(payload) = line.strip_prefix("data:") else {
        if ["event:", "id:", "retry:"].iter().any(|f| line.starts_with(f)) {
            return None;
        }
        // Plain JSON error body sent instead of an event stream
        return match serde_json::from_str::<StreamChunk>(line) {
            Ok(StreamChunk {
                error: Some(error), ..
            }) => Some(StreamEvent::Error(error_message(&error))),
            _ => Some(StreamEvent::Malformed(line.to_string())),
        };
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    if payload.trim() == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk.into_event(),
        Err(_) => Some(StreamEvent::Malformed(line.to_string())),
    }
}

/// Splits bytes into lines across chunk boundaries
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    /// Unterminated remainder once the source is exhausted
    fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

struct SseState<S> {
    source: S,
    lines: LineBuffer,
    source_done: bool,
    finished: bool,
}

impl<S> SseState<S>
where
    S: Stream<Item = Result<Vec<u8>, AttemptError>> + Unpin,
{
    async fn next_event(&mut self) -> Option<Result<StreamEvent, AttemptError>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(line) = self.lines.next_line() {
                match decode_line(&line) {
                    Some(StreamEvent::Done) => {
                        self.finished = true;
                        return Some(Ok(StreamEvent::Done));
                    }
                    Some(event) => return Some(Ok(event)),
                    None => continue,
                }
            }

            if self.source_done {
                self.finished = true;
                let rest = self.lines.take_rest()?;
                return decode_line(&rest).map(Ok);
            }

            match self.source.next().await {
                Some(Ok(bytes)) => self.lines.push(&bytes),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => self.source_done = true,
            }
        }
    }
}

/// Lazily decode a byte stream into events.
///
/// Yields nothing after `Done`; a transport error is yielded once and ends
/// the sequence. Only waiting on `source` suspends.
pub fn sse_events<S>(source: S) -> impl Stream<Item = Result<StreamEvent, AttemptError>>
where
    S: Stream<Item = Result<Vec<u8>, AttemptError>> + Unpin,
{
    let state = SseState {
        source,
        lines: LineBuffer::default(),
        source_done: false,
        finished: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        let item = state.next_event().await?;
        Some((item, state))
    })
}

/// Decode a stream to completion, calling `on_snapshot` with the accumulated
/// text after every delta.
pub async fn decode_stream<S, F>(source: S, mut on_snapshot: F) -> DecodedStream
where
    S: Stream<Item = Result<Vec<u8>, AttemptError>> + Unpin,
    F: FnMut(&str),
{
    let mut events = std::pin::pin!(sse_events(source));
    let mut decoded = DecodedStream::default();

    while let Some(item) = events.next().await {
        match item {
            Ok(StreamEvent::Delta(fragment)) => {
                decoded.text.push_str(&fragment);
                on_snapshot(&decoded.text);
            }
            Ok(StreamEvent::Malformed(line)) => {
                decoded.malformed += 1;
                tracing::debug!(target: "llm", line = %line, "Skipping malformed stream frame");
                decoded.last_malformed = Some(line);
            }
            Ok(StreamEvent::Error(message)) => {
                tracing::warn!(target: "llm", error = %message, "Upstream error in stream");
                decoded.upstream_error = Some(message);
            }
            Ok(StreamEvent::Done) => decoded.termination = Termination::Closed,
            Err(e) => {
                tracing::warn!(
                    target: "llm",
                    error = %e,
                    partial_len = decoded.text.len(),
                    "Stream interrupted"
                );
                decoded.termination = Termination::Interrupted;
                decoded.error = Some(e);
            }
        }
    }

    decoded
}
