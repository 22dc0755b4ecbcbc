//! Ollama Adapter
//!
//! Streams chat completions from a local Ollama server.
//!
//! # Ollama API
//!
//! Ollama provides a REST API for:
//! - `/api/chat` - Chat completions with message history
//! - `/api/tags` - List available models
//!
//! The chat endpoint returns newline-delimited JSON objects. Text arrives
//! in `message.content`, and the final object carries `done: true` with
//! `prompt_eval_count` / `eval_count` token totals.

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

/// Ollama streaming adapter
#[derive(Clone)]
pub struct OllamaAdapter {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    retry: RetryPolicy,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaAdapter {
    /// Create a new Ollama adapter
    ///
    /// # Errors
    ///
    /// Returns `Unknown` if the HTTP client cannot be constructed.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        retry: RetryPolicy,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Unknown(e.to_string()))?;

        Ok(Self {
            host: host.into(),
            port,
            retry,
            http_client,
        })
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Check whether the server is reachable
    pub async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    fn build_request(&self, ctx: &PromptContext) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = ctx.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for msg in &ctx.messages {
            let role = match msg.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            };
            messages.push(serde_json::json!({"role": role, "content": msg.text}));
        }

        let mut request = serde_json::json!({
            "model": ctx.model,
            "messages": messages,
            "stream": true,
            "options": {"temperature": ctx.params.temperature},
        });
        if ctx.params.max_tokens > 0 {
            request["options"]["num_predict"] = serde_json::json!(ctx.params.max_tokens);
        }
        if let Some(top_p) = ctx.params.top_p {
            request["options"]["top_p"] = serde_json::json!(top_p);
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

            let result = self.http_client.post(self.chat_url()).json(body).send().await;

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
impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
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

            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = tx.send(Delta::Cancelled).await;
                        return;
                    }
                    chunk = stream.next() => chunk,
                };

                match chunk {
                    None => {
                        // Stream ended without done signal
                        let _ = tx
                            .send(Delta::Failed(ProviderError::TransientNetwork(
                                "stream closed before completion".to_string(),
                            )))
                            .await;
                        return;
                    }
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        // Parse newline-delimited JSON
                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);
                            if line.is_empty() {
                                continue;
                            }
                            let Ok(data) = serde_json::from_str::<serde_json::Value>(&line)
                            else {
                                continue;
                            };

                            if let Some(token) =
                                data.pointer("/message/content").and_then(|r| r.as_str())
                            {
                                if !token.is_empty()
                                    && tx.send(Delta::Text(token.to_string())).await.is_err()
                                {
                                    // Receiver dropped, stop streaming
                                    return;
                                }
                            }

                            if data
                                .get("done")
                                .and_then(serde_json::Value::as_bool)
                                .unwrap_or(false)
                            {
                                if let Some(usage) = parse_usage(&data) {
                                    let _ = tx.send(Delta::Usage(usage)).await;
                                }
                                let _ = tx.send(Delta::Done).await;
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Delta::Failed(classify_transport(&e))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn parse_usage(data: &serde_json::Value) -> Option<TokenUsage> {
    let prompt = data
        .get("prompt_eval_count")
        .and_then(serde_json::Value::as_u64)? as u32;
    let completion = data.get("eval_count").and_then(serde_json::Value::as_u64)? as u32;
    Some(TokenUsage::new(prompt, completion))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::traits::{GenerationParams, PromptMessage};

    fn test_ctx() -> PromptContext {
        PromptContext {
            messages: vec![PromptMessage {
                role: MessageRole::User,
                text: "Hello".to_string(),
            }],
            model: "llama3".to_string(),
            params: GenerationParams::default(),
            system: None,
        }
    }

    #[test]
    fn test_adapter_urls() {
        let adapter = OllamaAdapter::new("localhost", 11434, RetryPolicy::default()).unwrap();
        assert_eq!(adapter.base_url(), "http://localhost:11434");
        assert_eq!(adapter.chat_url(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_build_request_shape() {
        let adapter = OllamaAdapter::new("localhost", 11434, RetryPolicy::default()).unwrap();
        let request = adapter.build_request(&test_ctx());

        assert_eq!(request["model"], "llama3");
        assert_eq!(request["stream"], true);
        assert_eq!(request["messages"][0]["role"], "user");
        assert!(request["options"].get("num_predict").is_none());
    }

    #[test]
    fn test_build_request_max_tokens() {
        let adapter = OllamaAdapter::new("localhost", 11434, RetryPolicy::default()).unwrap();
        let mut ctx = test_ctx();
        ctx.params.max_tokens = 512;
        let request = adapter.build_request(&ctx);
        assert_eq!(request["options"]["num_predict"], 512);
    }

    #[test]
    fn test_parse_usage_from_done_object() {
        let data: serde_json::Value = serde_json::from_str(
            r#"{"done":true,"prompt_eval_count":5,"eval_count":2}"#,
        )
        .unwrap();
        let usage = parse_usage(&data).unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 7);
    }
}
