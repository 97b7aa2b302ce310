//! Server-sent event demultiplexer.
//!
//! Events are separated by lines; each `data: ` line is either the
//! sentinel `[DONE]` or a JSON document whose content delta lives at
//! `choices[0].delta.content` or `choices[0].text`. Malformed JSON frames
//! are skipped rather than failing the stream, mirroring the source's
//! per-line best-effort parse in `OpenAICompatibleProvider::generate_stream`.

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("stream read error: {0}")]
    Http(String),
}

/// Stateful line decoder: `reqwest`'s `bytes_stream` yields chunks at
/// arbitrary boundaries, not aligned to lines, so partial lines carry
/// over between `feed` calls.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(event) = Self::parse_line(line) {
                events.push(event);
            }
        }
        events
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        let line = line.trim();
        let data = line.strip_prefix("data:")?.trim_start();
        if data.is_empty() {
            return None;
        }
        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }
        let value: serde_json::Value = serde_json::from_str(data).ok()?;
        let content = value["choices"][0]["delta"]["content"]
            .as_str()
            .or_else(|| value["choices"][0]["text"].as_str());
        content.map(|c| SseEvent::Delta(c.to_string()))
    }
}

/// Decode a streaming gateway response into a channel of events. Runs the
/// byte-level read on a spawned task so the caller can race consumption
/// against a stall timer with `tokio::select!` without holding the
/// response body across the select.
pub fn decode_stream(response: reqwest::Response) -> ReceiverStream<Result<SseEvent, DemuxError>> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut decoder = SseDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.feed(&bytes) {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(DemuxError::Http(e.to_string()))).await;
                    return;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Recognizes `x-usage-{prompt,completion,total}-tokens`,
/// `vercel-ai-*-tokens`, `openai-*-tokens`, and generically any header
/// whose name contains `tokens` combined with `prompt|completion|total`.
pub fn usage_from_headers(headers: &reqwest::header::HeaderMap) -> (Option<u32>, Option<u32>) {
    let mut prompt = None;
    let mut completion = None;
    for (name, value) in headers.iter() {
        let name = name.as_str().to_ascii_lowercase();
        if !name.contains("token") {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        let Ok(n) = value.parse::<u32>() else { continue };
        if name.contains("prompt") {
            prompt = Some(n);
        } else if name.contains("completion") {
            completion = Some(n);
        }
    }
    (prompt, completion)
}
