use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::models::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatCompletionUsage,
    ChatMessage,
};
use crate::streaming::SseParser;
use crate::utils::unix_now;

/// One outgoing chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub agent_index: usize,
    pub headers: Vec<(String, String)>,
}

/// Timed outcome of one completed request. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub body: String,
    pub launch_time: f64,
    pub first_token_time: Option<f64>,
    pub finish_time: f64,
    pub prompt_tokens: u64,
    pub generation_tokens: u64,
    pub agent_index: usize,
}

impl Response {
    /// Time to first token; zero when no content was ever produced.
    pub fn ttft(&self) -> f64 {
        self.first_token_time
            .map(|t| t - self.launch_time)
            .unwrap_or(0.0)
    }

    /// Time from first token to completion; zero when no content was produced.
    pub fn generation_time(&self) -> f64 {
        self.first_token_time
            .map(|t| self.finish_time - t)
            .unwrap_or(0.0)
    }
}

/// Issues streaming chat-completion calls and reduces each stream to a [`Response`].
pub struct StreamingRequestClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Fully-qualified chat-completions URL
    endpoint: String,

    /// Model per agent slot
    models: Vec<String>,

    /// Bearer token, if the endpoint wants one
    api_key: Option<String>,
}

impl StreamingRequestClient {
    /// Create a new client.
    ///
    /// `timeout` of `None` leaves request duration entirely to the endpoint.
    pub fn new(
        base_url: &str,
        models: Vec<String>,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let mut builder = Client::builder().pool_max_idle_per_host(500);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            endpoint: chat_completions_url(base_url),
            models,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Model mapped to an agent slot.
    pub fn model_for(&self, agent_index: usize) -> Result<&str, ClientError> {
        self.models
            .get(agent_index)
            .map(String::as_str)
            .ok_or(ClientError::UnknownAgent(agent_index))
    }

    /// Perform one streaming call and reduce it to a timed [`Response`].
    ///
    /// When the stream ends without complete usage counters, a single
    /// non-streaming call with the same messages recovers them. That call's
    /// latency is included in the finish time; its failure only leaves the
    /// counters as reported.
    pub async fn execute(&self, request: &ChatRequest) -> Result<Response, ClientError> {
        let model = self.model_for(request.agent_index)?;
        let body = ChatCompletionRequest::streaming(
            model,
            request.messages.clone(),
            request.max_tokens,
        );

        debug!(
            model = %model,
            agent = request.agent_index,
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            "Sending streaming request"
        );

        let launch_time = unix_now();
        let response = self
            .request_builder(&request.headers)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        let mut reduced = StreamReduction::default();

        while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            for chunk in parser.feed(&bytes)? {
                reduced.absorb(&chunk);
            }
            if parser.is_done() {
                break;
            }
        }
        for chunk in parser.finalize()? {
            reduced.absorb(&chunk);
        }

        let mut usage = reduced.usage.unwrap_or_default();
        if !usage.is_complete() {
            warn!(
                model = %model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "No token counts from streaming, issuing non-streaming call for usage"
            );
            match self.fetch_usage(model, &request.messages, &request.headers).await {
                Ok(Some(recovered)) => usage = recovered,
                Ok(None) => warn!(model = %model, "Fallback response carried no usage"),
                Err(e) => warn!(model = %model, error = %e, "Failed to get token counts from fallback call"),
            }
        }

        Ok(Response {
            body: reduced.text,
            launch_time,
            first_token_time: reduced.first_token_time,
            finish_time: unix_now(),
            prompt_tokens: usage.prompt_tokens,
            generation_tokens: usage.completion_tokens,
            agent_index: request.agent_index,
        })
    }

    /// Non-streaming call used only to recover usage counters.
    async fn fetch_usage(
        &self,
        model: &str,
        messages: &[ChatMessage],
        headers: &[(String, String)],
    ) -> Result<Option<ChatCompletionUsage>, ClientError> {
        let body = ChatCompletionRequest::non_streaming(model, messages.to_vec());
        let response = self.request_builder(headers).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        Ok(completion.usage)
    }

    fn request_builder(&self, headers: &[(String, String)]) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");

        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
    }
}

/// Running reduction of a completion stream.
#[derive(Debug, Default)]
struct StreamReduction {
    text: String,
    first_token_time: Option<f64>,
    usage: Option<ChatCompletionUsage>,
}

impl StreamReduction {
    fn absorb(&mut self, chunk: &ChatCompletionChunk) {
        if let Some(delta) = chunk.delta_text() {
            if self.first_token_time.is_none() && !delta.is_empty() {
                self.first_token_time = Some(unix_now());
            }
            self.text.push_str(delta);
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }
}

/// Normalize a base URL to the chat-completions endpoint, adding `/v1` if absent.
fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}
