//! Streamed completion decoding and the shared accumulator
//!
//! The producer never blocks on the accumulator lock: when a reader holds
//! it, deltas go to a producer-owned spill buffer that is merged, in order,
//! on the next successful acquisition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::{Error, Result};

/// Shared state of one in-flight chat call
#[derive(Debug, Default)]
pub struct StreamState {
    text: Mutex<String>,
    cancelled: AtomicBool,
}

impl StreamState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the producer to stop at the next chunk
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Text merged so far (excludes any pending spill)
    #[must_use]
    pub fn snapshot(&self) -> String {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.text.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of a [`StreamState`]
#[derive(Debug)]
pub struct Accumulator<'a> {
    state: &'a StreamState,
    spill: String,
}

impl<'a> Accumulator<'a> {
    #[must_use]
    pub const fn new(state: &'a StreamState) -> Self {
        Self {
            state,
            spill: String::new(),
        }
    }

    /// Append a delta without blocking
    pub fn push(&mut self, delta: &str) {
        let guard = match self.state.text.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };

        match guard {
            Some(mut text) => {
                text.push_str(&self.spill);
                text.push_str(delta);
                drop(text);
                self.spill.clear();
            }
            None => self.spill.push_str(delta),
        }
    }

    /// Whether deltas are waiting in the spill buffer
    #[must_use]
    pub fn has_spill(&self) -> bool {
        !self.spill.is_empty()
    }

    /// Merge any spill and return the complete text
    #[must_use]
    pub fn finish(self) -> String {
        let mut text = self.state.lock();
        text.push_str(&self.spill);
        text.clone()
    }

    /// Drop pending spill after cancellation
    pub fn discard(&mut self) {
        self.spill.clear();
    }
}

/// One decoded line of a streamed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    /// A text fragment
    Delta(String),
    /// End-of-stream sentinel
    Done,
    /// Blank, keep-alive, malformed or content-free line
    Skip,
}

/// Decode one `data: <json>` line
#[must_use]
pub fn parse_line(line: &str) -> StreamLine {
    let line = line.trim();
    if line.is_empty() {
        return StreamLine::Skip;
    }

    let payload = line
        .strip_prefix("data:")
        .map_or(line, str::trim_start);
    if payload == "[DONE]" {
        return StreamLine::Done;
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(v) => completion_text(&v).map_or(StreamLine::Skip, StreamLine::Delta),
        Err(e) => {
            tracing::debug!(error = %e, line = payload, "skipping malformed stream line");
            StreamLine::Skip
        }
    }
}

/// `choices[0].delta.content`, falling back to `choices[0].message.content`
#[must_use]
pub fn completion_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.get(0)?;
    let content = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
        })?;

    (!content.is_empty()).then(|| content.to_string())
}

/// Splits a byte stream into lines, holding partial lines across chunks
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    /// Feed a chunk and return every complete line it finishes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Trailing data without a final newline
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Drain a streamed response body into `state`
///
/// Cancellation is checked as each chunk arrives; a cancelled read drops
/// its spill and returns `Timeout` without touching the rest of the body.
///
/// # Errors
///
/// Returns `Timeout` once cancelled, or the transport error of a failed chunk
pub async fn read_stream<S, B>(chunks: S, state: &StreamState) -> Result<String>
where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    let mut chunks = std::pin::pin!(chunks);
    let mut acc = Accumulator::new(state);
    let mut decoder = LineDecoder::default();

    while let Some(chunk) = chunks.next().await {
        if state.is_cancelled() {
            acc.discard();
            return Err(Error::Timeout("chat stream cancelled".to_string()));
        }

        for line in decoder.feed(chunk?.as_ref()) {
            match parse_line(&line) {
                StreamLine::Delta(delta) => acc.push(&delta),
                StreamLine::Done => return Ok(acc.finish()),
                StreamLine::Skip => {}
            }
        }
    }

    if let Some(StreamLine::Delta(delta)) = decoder.finish().as_deref().map(parse_line) {
        acc.push(&delta);
    }
    Ok(acc.finish())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn deltas_accumulate_in_order() {
        let state = StreamState::new();
        let mut acc = Accumulator::new(&state);
        acc.push("你好");
        acc.push("，世界");
        assert_eq!(acc.finish(), "你好，世界");
    }

    #[test]
    fn contended_delta_goes_through_spill() {
        let state = StreamState::new();
        let mut acc = Accumulator::new(&state);
        acc.push("你好");

        {
            // A reader holds the lock while the next delta arrives
            let _reader = state.text.lock().unwrap();
            acc.push("，世界");
            assert!(acc.has_spill());
        }

        assert_eq!(state.snapshot(), "你好");
        assert_eq!(acc.finish(), "你好，世界");
    }

    #[test]
    fn spill_merges_before_next_delta() {
        let state = StreamState::new();
        let mut acc = Accumulator::new(&state);
        {
            let _reader = state.text.lock().unwrap();
            acc.push("a");
            acc.push("b");
        }
        acc.push("c");
        assert!(!acc.has_spill());
        assert_eq!(state.snapshot(), "abc");
    }

    #[test]
    fn discard_drops_spill() {
        let state = StreamState::new();
        let mut acc = Accumulator::new(&state);
        acc.push("kept");
        {
            let _reader = state.text.lock().unwrap();
            acc.push("lost");
        }
        state.cancel();
        assert!(state.is_cancelled());
        acc.discard();
        assert_eq!(acc.finish(), "kept");
    }

    #[test]
    fn parses_sse_lines() {
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"content":"你好"}}]}"#),
            StreamLine::Delta("你好".into())
        );
        assert_eq!(parse_line("data: [DONE]"), StreamLine::Done);
        assert_eq!(parse_line(""), StreamLine::Skip);
        assert_eq!(parse_line(": keep-alive"), StreamLine::Skip);
        assert_eq!(parse_line("data: {broken"), StreamLine::Skip);
        assert_eq!(
            parse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            StreamLine::Skip
        );
    }

    #[test]
    fn message_content_is_accepted_in_stream() {
        assert_eq!(
            parse_line(r#"{"choices":[{"message":{"content":"full"}}]}"#),
            StreamLine::Delta("full".into())
        );
    }

    #[test]
    fn line_decoder_handles_split_chunks() {
        let mut dec = LineDecoder::default();
        let bytes = "data: 你好\ndata: [DONE]".as_bytes();
        // Split inside the multi-byte character
        let (a, b) = bytes.split_at(8);

        assert!(dec.feed(a).is_empty());
        let lines = dec.feed(b);
        assert_eq!(lines, vec!["data: 你好\n".to_string()]);
        assert_eq!(dec.finish().as_deref(), Some("data: [DONE]"));
        assert!(dec.finish().is_none());
    }

    fn sse_chunk(delta: &str) -> reqwest::Result<Vec<u8>> {
        let chunk = serde_json::json!({ "choices": [{ "delta": { "content": delta } }] });
        Ok(format!("data: {chunk}\n\n").into_bytes())
    }

    #[tokio::test]
    async fn read_stream_stops_at_done() {
        let state = StreamState::new();
        let chunks = futures::stream::iter(vec![
            sse_chunk("你好"),
            Ok(b"data: [DONE]\n\n".to_vec()),
            sse_chunk("ignored"),
        ]);

        assert_eq!(read_stream(chunks, &state).await.unwrap(), "你好");
    }

    #[tokio::test]
    async fn read_stream_keeps_unterminated_last_line() {
        let state = StreamState::new();
        let last = r#"data: {"choices":[{"delta":{"content":"尾"}}]}"#;
        let chunks = futures::stream::iter(vec![sse_chunk("头"), Ok(last.as_bytes().to_vec())]);

        assert_eq!(read_stream(chunks, &state).await.unwrap(), "头尾");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_mid_stream_drops_spill_and_returns() {
        let state = Arc::new(StreamState::new());
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let reader = tokio::spawn({
            let state = Arc::clone(&state);
            async move { read_stream(rx, &state).await }
        });

        tx.unbounded_send(sse_chunk("你好")).unwrap();
        while state.snapshot().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        {
            // Delta arriving under a held lock lands in the spill
            let _reader = state.lock();
            tx.unbounded_send(sse_chunk("，世界")).unwrap();
            std::thread::sleep(Duration::from_millis(100));
            state.cancel();
        }
        tx.unbounded_send(sse_chunk("不该出现")).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(state.snapshot(), "你好");
    }
}
