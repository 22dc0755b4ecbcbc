//! OpenAI-Compatible Adapter
//!
//! Streams chat completions from OpenAI or any API-compatible proxy.
//!
//! # Wire Format
//!
//! `POST {base_url}/chat/completions` with `stream: true` returns
//! server-sent events: `data: {json}` lines terminated by a `data: [DONE]`
//! sentinel. Text arrives in `choices[0].delta.content`, reasoning in
//! `delta.reasoning_content`, tool calls in `delta.tool_calls`, and the
//! final usage summary in a trailing chunk when `stream_options` requests it.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::TokenUsage;

use super::traits::{
    classify_status, classify_transport, Delta, PromptContext, ProviderAdapter, ProviderError,
    ProviderKind, RetryPolicy,
};

/// Default OpenAI API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible streaming adapter
#[derive(Clone)]
pub struct OpenAiAdapter {
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    http_client: reqwest::Client,
}

impl OpenAiAdapter {
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

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, ctx: &PromptContext) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = ctx.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for msg in &ctx.messages {
            messages.push(serde_json::json!({
                "role": role_str(msg.role),
                "content": msg.text,
            }));
        }

        let mut request = serde_json::json!({
            "model": ctx.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
            "temperature": ctx.params.temperature,
        });
        if ctx.params.max_tokens > 0 {
            request["max_tokens"] = serde_json::json!(ctx.params.max_tokens);
        }
        if let Some(top_p) = ctx.params.top_p {
            request["top_p"] = serde_json::json!(top_p);
        }
        request
    }

    /// Send the request, retrying transient failures with backoff
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
                .post(self.completions_url())
                .bearer_auth(&self.api_key)
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

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
            let mut usage: Option<TokenUsage> = None;

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
                            let data = data.trim();
                            if data == "[DONE]" {
                                if let Some(usage) = usage {
                                    let _ = tx.send(Delta::Usage(usage)).await;
                                }
                                let _ = tx.send(Delta::Done).await;
                                return;
                            }

                            let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
                                continue;
                            };
                            if let Some(u) = parse_usage(&json) {
                                usage = Some(u);
                            }
                            for delta in parse_choice_deltas(&json) {
                                if tx.send(delta).await.is_err() {
                                    // Receiver dropped, stop streaming
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Delta::Failed(classify_transport(&e))).await;
                        return;
                    }
                    None => {
                        // Body ended without the [DONE] sentinel
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

fn role_str(role: crate::messages::MessageRole) -> &'static str {
    match role {
        crate::messages::MessageRole::User => "user",
        crate::messages::MessageRole::Assistant => "assistant",
        crate::messages::MessageRole::System => "system",
    }
}

fn parse_usage(json: &serde_json::Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: usage.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: usage
            .get("total_tokens")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or_default() as u32,
    })
}

fn parse_choice_deltas(json: &serde_json::Value) -> Vec<Delta> {
    let mut deltas = Vec::new();
    let Some(delta) = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
    else {
        return deltas;
    };

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            deltas.push(Delta::Text(text.to_string()));
        }
    }
    if let Some(text) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            deltas.push(Delta::Reasoning(text.to_string()));
        }
    }
    if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for call in calls {
            let id = call
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string();
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or_default()
                .to_string();
            let arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .unwrap_or_default()
                .to_string();
            deltas.push(Delta::ToolCall {
                id,
                name,
                arguments,
            });
        }
    }
    deltas
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageRole;
    use crate::provider::traits::{GenerationParams, PromptMessage};

    fn test_ctx() -> PromptContext {
        PromptContext {
            messages: vec![PromptMessage {
                role: MessageRole::User,
                text: "Hello".to_string(),
            }],
            model: "gpt-4o".to_string(),
            params: GenerationParams::default(),
            system: Some("Be helpful".to_string()),
        }
    }

    #[test]
    fn test_build_request_shape() {
        let adapter = OpenAiAdapter::new(DEFAULT_BASE_URL, "key", RetryPolicy::default()).unwrap();
        let request = adapter.build_request(&test_ctx());

        assert_eq!(request["model"], "gpt-4o");
        assert_eq!(request["stream"], true);
        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][1]["role"], "user");
        assert_eq!(request["messages"][1]["content"], "Hello");
        assert!(request.get("max_tokens").is_none());
    }

    #[test]
    fn test_parse_text_delta() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
        )
        .unwrap();
        let deltas = parse_choice_deltas(&json);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(&deltas[0], Delta::Text(t) if t == "Hi"));
    }

    #[test]
    fn test_parse_tool_call_delta() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_1","function":{"name":"search","arguments":"{\"q\":"}}]}}]}"#,
        )
        .unwrap();
        let deltas = parse_choice_deltas(&json);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(
            &deltas[0],
            Delta::ToolCall { id, name, .. } if id == "call_1" && name == "search"
        ));
    }

    #[test]
    fn test_parse_usage_chunk() {
        let json: serde_json::Value = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#,
        )
        .unwrap();
        let usage = parse_usage(&json).unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn test_completions_url_trailing_slash() {
        let adapter =
            OpenAiAdapter::new("https://proxy.local/v1/", "key", RetryPolicy::default()).unwrap();
        assert_eq!(
            adapter.completions_url(),
            "https://proxy.local/v1/chat/completions"
        );
    }
}
