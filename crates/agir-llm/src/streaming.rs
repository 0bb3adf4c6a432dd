use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

use agir_core::error::{AgirError, Result};

/// Parse a raw SSE byte stream into individual events.
/// SSE format: `event: <type>\ndata: <json>\n\n`
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

/// A parsed SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed text into the parser and extract complete events.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        // Some servers (Ollama behind proxies) frame with CRLF
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();

            let mut event_type = None;
            let mut data_lines = Vec::new();

            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val).to_string());
                }
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// A stream of SSE events from raw bytes. Transport errors end the stream with an error item.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: Vec<SseEvent>,
    // Holds a partial UTF-8 sequence split across chunks
    carry: Vec<u8>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: Vec::new(),
            carry: Vec::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                return Poll::Ready(Some(Ok(this.pending.remove(0))));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.carry.extend_from_slice(&bytes);
                    let complete = complete_prefix(&this.carry);
                    let text: Vec<u8> = this.carry.drain(..complete).collect();
                    let text = String::from_utf8_lossy(&text);
                    this.pending = this.parser.feed(&text);
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(AgirError::LlmStream(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    // Flush an unterminated final event
                    this.pending = this.parser.feed("\n\n");
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Length of the prefix of `buf` that can be decoded now.
///
/// Invalid bytes are included (they decode to U+FFFD); only a trailing
/// sequence that may still be completed by the next chunk is held back.
fn complete_prefix(buf: &[u8]) -> usize {
    let mut pos = 0;
    loop {
        match std::str::from_utf8(&buf[pos..]) {
            Ok(_) => return buf.len(),
            Err(e) => match e.error_len() {
                Some(bad) => pos += e.valid_up_to() + bad,
                None => return pos + e.valid_up_to(),
            },
        }
    }
}

/// Incremental output of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    TextDelta(String),
    Usage { input_tokens: u64, output_tokens: u64 },
    Stop(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Drain a delta stream into the full response text.
///
/// A stream that yields neither text nor a stop reason is not a completion
/// (an HTML error page, a non-streaming JSON body) and fails with `LlmParse`.
pub async fn collect_text<S>(mut stream: S) -> Result<String>
where
    S: Stream<Item = Result<StreamDelta>> + Unpin,
{
    let mut text = String::new();
    let mut completed = false;
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        if matches!(delta, StreamDelta::TextDelta(_) | StreamDelta::Stop(_)) {
            completed = true;
        }
        match delta {
            StreamDelta::TextDelta(t) => text.push_str(&t),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                tracing::debug!(input_tokens, output_tokens, "Token usage");
            }
            StreamDelta::Stop(StopReason::MaxTokens) => {
                tracing::debug!("Completion truncated at max_tokens");
            }
            StreamDelta::Stop(_) => {}
        }
    }
    if !completed {
        return Err(AgirError::LlmParse(
            "response stream contained no completion".into(),
        ));
    }
    Ok(text)
}
