//! Relay pipeline over a synthetic SSE upstream: fragments arrive in
//! order, unparseable lines are dropped without terminating the stream,
//! and terminal events fire exactly once on upstream close.

use axum::response::sse::Event;
use axum::{Router, http::header, routing::get};
use castor::auth::Provider;
use castor::error::RelayError;
use castor::relay::{ClaudeSse, OpenaiSse, StreamTranslator, relay_stream};
use castor_schema::gemini::GenerateContentResponse;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Serve a fixed SSE body once, on an ephemeral local port.
async fn spawn_upstream(body: &'static str) -> SocketAddr {
    let app = Router::new().route(
        "/sse",
        get(move || async move {
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                body,
            )
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn fetch(addr: SocketAddr) -> reqwest::Response {
    reqwest::get(format!("http://{addr}/sse")).await.unwrap()
}

#[derive(Default)]
struct SpyState {
    fragments: Vec<GenerateContentResponse>,
    closes: usize,
    errors: usize,
}

/// Records what the relay feeds it; emits one event per callback so the
/// channel sees traffic.
struct SpyTranslator {
    state: Arc<Mutex<SpyState>>,
}

impl StreamTranslator for SpyTranslator {
    fn on_fragment(&mut self, fragment: &GenerateContentResponse) -> Vec<Event> {
        self.state.lock().unwrap().fragments.push(fragment.clone());
        vec![Event::default().data("fragment")]
    }

    fn on_close(&mut self) -> Vec<Event> {
        self.state.lock().unwrap().closes += 1;
        vec![Event::default().data("close")]
    }

    fn on_error(&mut self, _error: &RelayError) -> Vec<Event> {
        self.state.lock().unwrap().errors += 1;
        vec![Event::default().data("error")]
    }
}

#[tokio::test]
async fn fragments_relay_in_upstream_order() {
    let addr = spawn_upstream(concat!(
        "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Par\"}]}}]}}\n\n",
        "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"is\"}]},\"finishReason\":\"STOP\"}]}}\n\n",
    ))
    .await;

    let state = Arc::new(Mutex::new(SpyState::default()));
    let translator = SpyTranslator {
        state: Arc::clone(&state),
    };
    let mut stream = relay_stream(
        fetch(addr).await,
        Provider::GeminiOauth,
        Box::new(translator),
    );

    let mut delivered = 0;
    while stream.next().await.is_some() {
        delivered += 1;
    }
    assert_eq!(delivered, 3, "two fragments plus the close event");

    let state = state.lock().unwrap();
    let texts: Vec<String> = state
        .fragments
        .iter()
        .map(|f| {
            f.primary_content().unwrap().parts[0]
                .text
                .clone()
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(texts, ["Par", "is"]);
    assert_eq!(state.closes, 1);
    assert_eq!(state.errors, 0);
}

#[tokio::test]
async fn bad_lines_and_done_sentinels_are_dropped() {
    let addr = spawn_upstream(concat!(
        "data: this is not json\n\n",
        "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"ok\"}]}}]}\n\n",
        "data: [DONE]\n\n",
    ))
    .await;

    let state = Arc::new(Mutex::new(SpyState::default()));
    let translator = SpyTranslator {
        state: Arc::clone(&state),
    };
    let mut stream = relay_stream(
        fetch(addr).await,
        Provider::GeminiOauth,
        Box::new(translator),
    );
    while stream.next().await.is_some() {}

    let state = state.lock().unwrap();
    assert_eq!(state.fragments.len(), 1, "only the valid line survives");
    assert_eq!(state.closes, 1);
}

#[tokio::test]
async fn codex_events_normalize_to_gemini_fragments() {
    let addr = spawn_upstream(concat!(
        "data: {\"type\":\"response.created\"}\n\n",
        "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hello\"}\n\n",
        "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":4,\"output_tokens\":1,\"total_tokens\":5}}}\n\n",
    ))
    .await;

    let state = Arc::new(Mutex::new(SpyState::default()));
    let translator = SpyTranslator {
        state: Arc::clone(&state),
    };
    let mut stream = relay_stream(
        fetch(addr).await,
        Provider::CodexOauth,
        Box::new(translator),
    );
    while stream.next().await.is_some() {}

    let state = state.lock().unwrap();
    assert_eq!(state.fragments.len(), 2, "created event carries nothing");
    assert_eq!(
        state.fragments[0].primary_content().unwrap().parts[0]
            .text
            .as_deref(),
        Some("Hello")
    );
    assert_eq!(state.fragments[1].finish_reason(), Some("STOP"));
}

#[tokio::test]
async fn openai_translator_ends_with_done_sentinel() {
    let addr = spawn_upstream(concat!(
        "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"hi\"}]},\"finishReason\":\"STOP\"}]}}\n\n",
    ))
    .await;

    let mut stream = relay_stream(
        fetch(addr).await,
        Provider::GeminiOauth,
        Box::new(OpenaiSse::new("gemini-2.5-pro", true)),
    );

    let mut events = Vec::new();
    while let Some(Ok(event)) = stream.next().await {
        events.push(event);
    }
    // role prelude, content delta, finish chunk, [DONE]
    assert_eq!(events.len(), 4);
}

#[tokio::test]
async fn claude_translator_closes_with_message_stop() {
    let addr = spawn_upstream(concat!(
        "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"hi\"}]}}]}}\n\n",
    ))
    .await;

    let mut stream = relay_stream(
        fetch(addr).await,
        Provider::GeminiOauth,
        Box::new(ClaudeSse::new("gemini-2.5-pro")),
    );

    let mut count = 0;
    while stream.next().await.is_some() {
        count += 1;
    }
    // message_start, content_block_start, content_block_delta,
    // content_block_stop, message_delta, message_stop
    assert_eq!(count, 6);
}
