//! OpenAI-compatible mock endpoint that streams synthetic completions.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::models::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatCompletionUsage,
};

/// Behaviour of the mock endpoint.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Port to listen on (0 for random)
    pub port: u16,
    /// Simulated latency per chunk in milliseconds
    pub chunk_latency_ms: u64,
    /// Content chunks per response, one word each; capped by `max_tokens`
    pub chunk_count: usize,
    /// Error rate (0.0 to 1.0)
    pub error_rate: f64,
    /// Whether streams end with a usage event when the client asks for one
    pub stream_usage: bool,
    /// Fixed prompt token count; derived from the prompt length when unset
    pub prompt_tokens: Option<u64>,
    /// Fixed completion token count; the number of chunks sent when unset
    pub completion_tokens: Option<u64>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            chunk_latency_ms: 10,
            chunk_count: 32,
            error_rate: 0.0,
            stream_usage: true,
            prompt_tokens: None,
            completion_tokens: None,
        }
    }
}

/// Requests served so far, by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MockServerStats {
    pub streaming: usize,
    pub non_streaming: usize,
}

struct MockState {
    config: MockServerConfig,
    streaming: AtomicUsize,
    non_streaming: AtomicUsize,
}

/// Mock chat-completion server for standalone runs and tests
pub struct MockServer {
    state: Arc<MockState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

impl MockServer {
    pub fn new(config: MockServerConfig) -> Self {
        Self {
            state: Arc::new(MockState {
                config,
                streaming: AtomicUsize::new(0),
                non_streaming: AtomicUsize::new(0),
            }),
            shutdown_tx: None,
            port: 0,
        }
    }

    /// Start serving on the current tokio runtime and return the bound port.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("127.0.0.1:{}", self.state.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        self.port = port;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = Router::new()
            .route("/v1/chat/completions", post(handle_chat_completions))
            .with_state(self.state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        info!(port, "Mock endpoint listening");
        Ok(port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn stats(&self) -> MockServerStats {
        MockServerStats {
            streaming: self.state.streaming.load(Ordering::Relaxed),
            non_streaming: self.state.non_streaming.load(Ordering::Relaxed),
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_chat_completions(
    State(state): State<Arc<MockState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let config = &state.config;
    if config.error_rate > 0.0 && rand::thread_rng().gen::<f64>() < config.error_rate {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Simulated error").into_response();
    }

    let chunks = request
        .max_tokens
        .map(|max| config.chunk_count.min(max as usize))
        .unwrap_or(config.chunk_count);
    let usage = ChatCompletionUsage::new(
        config
            .prompt_tokens
            .unwrap_or_else(|| estimate_prompt_tokens(&request)),
        config.completion_tokens.unwrap_or(chunks as u64),
    );
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());

    debug!(
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Mock completion request"
    );

    if request.stream {
        state.streaming.fetch_add(1, Ordering::Relaxed);
        let with_usage = config.stream_usage && request.wants_usage();
        let stream = generate_stream(
            id,
            request.model,
            chunks,
            config.chunk_latency_ms,
            with_usage.then_some(usage),
        );
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(stream),
        )
            .into_response()
    } else {
        state.non_streaming.fetch_add(1, Ordering::Relaxed);
        let content = generate_content(chunks);
        Json(ChatCompletionResponse::new(id, request.model, content, usage)).into_response()
    }
}

/// Rough token estimate: one token per four characters of message text.
fn estimate_prompt_tokens(request: &ChatCompletionRequest) -> u64 {
    let chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    (chars as u64 / 4).max(1)
}

fn sse_event(payload: &impl Serialize) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_default();
    Bytes::from(format!("data: {}\n\n", json))
}

/// Stream `chunks` one-word content events, an optional usage event, then `[DONE]`.
fn generate_stream(
    id: String,
    model: String,
    chunks: usize,
    chunk_latency_ms: u64,
    usage: Option<ChatCompletionUsage>,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let chunk_latency = tokio::time::Duration::from_millis(chunk_latency_ms);

        for i in 0..chunks {
            tokio::time::sleep(chunk_latency).await;

            let mut word = generate_content(1);
            if i > 0 {
                word.insert(0, ' ');
            }
            yield Ok(sse_event(&ChatCompletionChunk::content(id.clone(), model.clone(), word)));

            if i % 5 == 0 {
                tokio::task::yield_now().await;
            }
        }

        if let Some(usage) = usage {
            yield Ok(sse_event(&ChatCompletionChunk::usage(id.clone(), model.clone(), usage)));
        }
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    }
}

/// Random words, `count` of them.
fn generate_content(count: usize) -> String {
    const WORDS: &[&str] = &[
        "once", "upon", "a", "time", "there", "was", "a", "quiet", "village", "where",
        "everyone", "lived", "happily", "ever", "after", "story", "ending", "long",
    ];

    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
        .collect::<Vec<_>>()
        .join(" ")
}
