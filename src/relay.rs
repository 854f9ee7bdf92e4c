//! Streaming relay: one producer task per request reads the upstream SSE
//! body, normalizes each fragment into the internal Gemini shape, runs the
//! dialect state machine, and pushes client events onto a channel consumed
//! by the HTTP writer. A failed send means the client is gone; the producer
//! returns, dropping the upstream response and aborting the HTTP call.

use crate::auth::Provider;
use crate::error::RelayError;
use crate::translate::claude::ClaudeStream;
use crate::translate::openai::OpenaiStream;
use crate::upstream::codex;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use castor_schema::gemini::{GenerateContentResponse, parse_response_payload};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

// Capacity 1: the producer stays at most one event ahead of the client
// writer, so a blocked client backpressures upstream reads.
const RELAY_CHANNEL_CAPACITY: usize = 1;

/// Dialect-specific chunk emission for one stream.
pub trait StreamTranslator: Send + 'static {
    /// Zero or more client events for one upstream fragment.
    fn on_fragment(&mut self, fragment: &GenerateContentResponse) -> Vec<Event>;

    /// Terminal events after a clean upstream close.
    fn on_close(&mut self) -> Vec<Event>;

    /// A final error chunk; headers are long gone, so this is all the
    /// client will see of a mid-stream failure.
    fn on_error(&mut self, error: &RelayError) -> Vec<Event>;
}

/// Build the SSE response for a dispatched upstream stream.
pub fn sse_relay(
    upstream: reqwest::Response,
    provider: Provider,
    translator: Box<dyn StreamTranslator>,
) -> Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>> {
    Sse::new(relay_stream(upstream, provider, translator)).keep_alive(KeepAlive::default())
}

/// The relay's event channel without the response wrapper.
pub fn relay_stream(
    upstream: reqwest::Response,
    provider: Provider,
    translator: Box<dyn StreamTranslator>,
) -> ReceiverStream<Result<Event, Infallible>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(relay_producer(upstream, provider, translator, tx));
    ReceiverStream::new(rx)
}

async fn relay_producer(
    upstream: reqwest::Response,
    provider: Provider,
    mut translator: Box<dyn StreamTranslator>,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    let mut events = Box::pin(upstream.bytes_stream().eventsource());

    loop {
        match events.next().await {
            Some(Ok(event)) => {
                if event.data.is_empty() || event.data == "[DONE]" {
                    continue;
                }
                let Some(fragment) = normalize_fragment(provider, &event.data) else {
                    continue;
                };
                for out in translator.on_fragment(&fragment) {
                    if tx.send(Ok(out)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let error = RelayError::StreamProtocol(e.to_string());
                warn!(error = %error, "upstream stream failed mid-flight");
                for out in translator.on_error(&error) {
                    if tx.send(Ok(out)).await.is_err() {
                        return;
                    }
                }
                return;
            }
            None => {
                for out in translator.on_close() {
                    if tx.send(Ok(out)).await.is_err() {
                        return;
                    }
                }
                return;
            }
        }
    }
}

/// Parse one SSE payload into the internal fragment shape. Unparseable
/// lines are logged and dropped; they never terminate the stream.
fn normalize_fragment(provider: Provider, data: &str) -> Option<GenerateContentResponse> {
    match provider {
        Provider::CodexOauth => {
            let value: serde_json::Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "skipping invalid codex SSE payload");
                    return None;
                }
            };
            codex::fragment_from_event(&value)
        }
        _ => match parse_response_payload(data) {
            Ok(fragment) => Some(fragment),
            Err(e) => {
                warn!(error = %e, payload = %format!("{data:.120}"), "skipping invalid SSE payload");
                None
            }
        },
    }
}

fn json_event(payload: &impl serde::Serialize) -> Option<Event> {
    match Event::default().json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "failed to serialize SSE event");
            None
        }
    }
}

// --- dialect adapters ---

/// OpenAI chat-completions SSE: `data:` chunks closed by `data: [DONE]`.
pub struct OpenaiSse {
    inner: OpenaiStream,
}

impl OpenaiSse {
    pub fn new(model: &str, with_reasoning: bool) -> Self {
        OpenaiSse {
            inner: OpenaiStream::new(model, with_reasoning),
        }
    }
}

impl StreamTranslator for OpenaiSse {
    fn on_fragment(&mut self, fragment: &GenerateContentResponse) -> Vec<Event> {
        self.inner
            .on_fragment(fragment)
            .iter()
            .filter_map(json_event)
            .collect()
    }

    fn on_close(&mut self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .inner
            .on_close()
            .iter()
            .filter_map(json_event)
            .collect();
        events.push(Event::default().data("[DONE]"));
        events
    }

    fn on_error(&mut self, error: &RelayError) -> Vec<Event> {
        let payload = json!({
            "error": {"message": error.to_string(), "type": "api_error"}
        });
        let mut events: Vec<Event> = json_event(&payload).into_iter().collect();
        events.push(Event::default().data("[DONE]"));
        events
    }
}

/// Anthropic messages SSE: named events ending with `message_stop`.
pub struct ClaudeSse {
    inner: ClaudeStream,
}

impl ClaudeSse {
    pub fn new(model: &str) -> Self {
        ClaudeSse {
            inner: ClaudeStream::new(model),
        }
    }

    fn named(event: &castor_schema::claude::StreamEvent) -> Option<Event> {
        match Event::default().event(event.event_name()).json_data(event) {
            Ok(out) => Some(out),
            Err(e) => {
                warn!(error = %e, "failed to serialize Anthropic SSE event");
                None
            }
        }
    }
}

impl StreamTranslator for ClaudeSse {
    fn on_fragment(&mut self, fragment: &GenerateContentResponse) -> Vec<Event> {
        self.inner
            .on_fragment(fragment)
            .iter()
            .filter_map(Self::named)
            .collect()
    }

    fn on_close(&mut self) -> Vec<Event> {
        self.inner.on_close().iter().filter_map(Self::named).collect()
    }

    fn on_error(&mut self, error: &RelayError) -> Vec<Event> {
        let payload = json!({
            "type": "error",
            "error": {"type": "api_error", "message": error.to_string()}
        });
        Event::default()
            .event("error")
            .json_data(&payload)
            .ok()
            .into_iter()
            .collect()
    }
}

/// Gemini-native SSE: fragments pass through re-serialized, with no
/// terminal sentinel.
pub struct GeminiSse;

impl StreamTranslator for GeminiSse {
    fn on_fragment(&mut self, fragment: &GenerateContentResponse) -> Vec<Event> {
        json_event(fragment).into_iter().collect()
    }

    fn on_close(&mut self) -> Vec<Event> {
        Vec::new()
    }

    fn on_error(&mut self, error: &RelayError) -> Vec<Event> {
        let payload = json!({
            "error": {
                "code": 502,
                "message": error.to_string(),
                "status": "UNAVAILABLE"
            }
        });
        json_event(&payload).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_fragments_pass_through() {
        let mut translator = GeminiSse;
        let fragment = parse_response_payload(
            r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}}"#,
        )
        .unwrap();
        assert_eq!(translator.on_fragment(&fragment).len(), 1);
        assert!(translator.on_close().is_empty());
    }

    #[test]
    fn openai_close_always_appends_done() {
        let mut translator = OpenaiSse::new("m", true);
        let events = translator.on_close();
        assert_eq!(events.len(), 1, "no finish chunk for a silent stream, only [DONE]");
    }

    #[test]
    fn normalize_drops_garbage_lines() {
        assert!(normalize_fragment(Provider::GeminiOauth, "{not json").is_none());
        assert!(normalize_fragment(Provider::CodexOauth, "{not json").is_none());
        assert!(
            normalize_fragment(
                Provider::GeminiOauth,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"ok"}]}}]}"#
            )
            .is_some()
        );
    }
}
