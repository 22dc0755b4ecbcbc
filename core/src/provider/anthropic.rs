//! Anthropic Messages Adapter
//!
//! Streams responses from the Anthropic Messages API.
//!
//! # Wire Format
//!
//! `POST {base_url}/v1/messages` with `stream: true` returns server-sent
//! events with typed payloads. The ones that matter here:
//!
//! - `content_block_delta` carries `text_delta` / `thinking_delta` /
//!   `input_json_delta` fragments
//! - `content_block_start` announces a `tool_use` block with id and name
//! - `message_start` carries input token usage, `message_delta` output usage
//! - `message_stop` ends the stream

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::{MessageRole, TokenUsage};

use super::traits::{
    classify_status, classify_transport, Delta, PromptContext, ProviderAdapter, ProviderError,
    ProviderKind, RetryPolicy,
};

/// Default Anthropic API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages streaming adapter
#[derive(Clone)]
pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    http_client: reqwest::Client,
}

impl AnthropicAdapter {
    /// Create a new adapter
    ///
    /// # Errors
    ///
    /// Returns `Unknown` if the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Unknown(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            retry,
            http_client,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, ctx: &PromptContext) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = ctx
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    MessageRole::Assistant => "assistant",
                    // Anthropic has no system role in the message list
                    MessageRole::User | MessageRole::System => "user",
                };
                serde_json::json!({"role": role, "content": msg.text})
            })
            .collect();

        let max_tokens = if ctx.params.max_tokens > 0 {
            ctx.params.max_tokens
        } else {
            4096
        };
        let mut request = serde_json::json!({
            "model": ctx.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
            "temperature": ctx.params.temperature,
        });
        if let Some(ref system) = ctx.system {
            request["system"] = serde_json::json!(system);
        }
        if let Some(top_p) = ctx.params.top_p {
            request["top_p"] = serde_json::json!(top_p);
        }
        request
    }

    async fn establish(
        &self,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Unknown("cancelled before start".to_string()));
            }

            let result = self
                .http_client
                .post(self.messages_url())
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(body)
                .send()
                .await;

            let err = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    classify_status(status, &text)
                }
                Err(e) => classify_transport(&e),
            };

            if err.is_transient() && attempt < self.retry.retries {
                let delay = self.retry.delay_for(attempt);
                tracing::debug!(attempt, ?delay, "retrying provider request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }
}

/// Per-stream parser state: the current tool block and accumulated usage
#[derive(Default)]
struct SseState {
    tool_id: Option<String>,
    tool_name: String,
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl SseState {
    /// Translate one SSE data payload into zero or more deltas.
    /// Returns `(deltas, done)`.
    fn on_event(&mut self, json: &serde_json::Value) -> (Vec<Delta>, bool) {
        let mut deltas = Vec::new();
        match json.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(tokens) = json
                    .pointer("/message/usage/input_tokens")
                    .and_then(serde_json::Value::as_u64)
                {
                    self.prompt_tokens = tokens as u32;
                }
            }
            Some("content_block_start") => {
                let block = json.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(|t| t.as_str())
                    == Some("tool_use")
                {
                    self.tool_id = block
                        .and_then(|b| b.get("id"))
                        .and_then(|i| i.as_str())
                        .map(String::from);
                    self.tool_name = block
                        .and_then(|b| b.get("name"))
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                }
            }
            Some("content_block_delta") => {
                let delta = json.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.and_then(|d| d.get("text")).and_then(|t| t.as_str())
                        {
                            deltas.push(Delta::Text(text.to_string()));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) =
                            delta.and_then(|d| d.get("thinking")).and_then(|t| t.as_str())
                        {
                            deltas.push(Delta::Reasoning(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(|p| p.as_str())
                        {
                            deltas.push(Delta::ToolCall {
                                id: self.tool_id.clone().unwrap_or_default(),
                                name: self.tool_name.clone(),
                                arguments: partial.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                self.tool_id = None;
                self.tool_name.clear();
            }
            Some("message_delta") => {
                if let Some(tokens) = json
                    .pointer("/usage/output_tokens")
                    .and_then(serde_json::Value::as_u64)
                {
                    self.completion_tokens = tokens as u32;
                }
            }
            Some("message_stop") => {
                if self.prompt_tokens > 0 || self.completion_tokens > 0 {
                    deltas.push(Delta::Usage(TokenUsage::new(
                        self.prompt_tokens,
                        self.completion_tokens,
                    )));
                }
                deltas.push(Delta::Done);
                return (deltas, true);
            }
            Some("error") => {
                let message = json
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("provider error")
                    .to_string();
                deltas.push(Delta::Failed(ProviderError::Unknown(message)));
                return (deltas, true);
            }
            _ => {}
        }
        (deltas, false)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn start(
        &self,
        ctx: &PromptContext,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Delta>, ProviderError> {
        let body = self.build_request(ctx);
        let response = self.establish(&body, &cancel).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut state = SseState::default();

            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = tx.send(Delta::Cancelled).await;
                        return;
                    }
                    chunk = stream.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);

                            let Some(data) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let Ok(json) =
                                serde_json::from_str::<serde_json::Value>(data.trim())
                            else {
                                continue;
                            };

                            let (deltas, done) = state.on_event(&json);
                            for delta in deltas {
                                if tx.send(delta).await.is_err() {
                                    return;
                                }
                            }
                            if done {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Delta::Failed(classify_transport(&e))).await;
                        return;
                    }
                    None => {
                        let _ = tx
                            .send(Delta::Failed(ProviderError::TransientNetwork(
                                "stream closed before completion".to_string(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
