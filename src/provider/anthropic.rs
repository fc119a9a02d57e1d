// src/provider/anthropic.rs — Anthropic Messages API provider

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};

use super::{
    http_error, stream_error, usage_u32, ChatChunk, ChatRequest, ChatResponse, ChatStream,
    ModelProvider, Role, TokenUsage,
};
use crate::infra::errors::ChatHubError;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self::with_base_url("https://api.anthropic.com/v1".into())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// System messages are lifted out of the list into the top-level
    /// `system` field; the rest keep their order.
    fn build_request_body(request: &ChatRequest) -> serde_json::Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }
        body
    }

    fn post(&self, api_key: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    async fn chat(
        &self,
        api_key: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, ChatHubError> {
        let body = Self::build_request_body(&request);

        let response = self
            .post(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatHubError::provider(PROVIDER, e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_error(PROVIDER, response).await);
        }

        let resp: serde_json::Value = response.json().await.map_err(|e| {
            ChatHubError::provider(PROVIDER, format!("Failed to parse response: {}", e))
        })?;

        let blocks = resp["content"]
            .as_array()
            .ok_or_else(|| ChatHubError::provider(PROVIDER, "Response contained no content"))?;

        let content = blocks
            .iter()
            .filter(|c| c["type"] == "text")
            .map(|c| c["text"].as_str().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("");

        let usage = TokenUsage {
            input_tokens: usage_u32(&resp["usage"]["input_tokens"]),
            output_tokens: usage_u32(&resp["usage"]["output_tokens"]),
        };

        Ok(ChatResponse { content, usage })
    }

    async fn chat_stream(
        &self,
        api_key: &str,
        request: ChatRequest,
    ) -> Result<ChatStream, ChatHubError> {
        let mut body = Self::build_request_body(&request);
        body["stream"] = serde_json::json!(true);

        let mut es = self
            .post(api_key)
            .json(&body)
            .eventsource()
            .map_err(|e| ChatHubError::provider(PROVIDER, e.to_string()))?;

        let stream = async_stream::stream! {
            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        let parsed: serde_json::Value = match serde_json::from_str(&msg.data) {
                            Ok(v) => v,
                            Err(e) => {
                                yield Err(ChatHubError::provider(
                                    PROVIDER,
                                    format!("Failed to parse SSE data: {}", e),
                                ));
                                break;
                            }
                        };

                        match parsed["type"].as_str().unwrap_or("") {
                            "content_block_delta" => {
                                if parsed["delta"]["type"] == "text_delta" {
                                    let text = parsed["delta"]["text"]
                                        .as_str()
                                        .unwrap_or("")
                                        .to_string();
                                    if !text.is_empty() {
                                        yield Ok(ChatChunk { delta: text, usage: None });
                                    }
                                }
                            }
                            "message_start" => {
                                let usage = &parsed["message"]["usage"];
                                yield Ok(ChatChunk {
                                    delta: String::new(),
                                    usage: Some(TokenUsage {
                                        input_tokens: usage_u32(&usage["input_tokens"]),
                                        output_tokens: usage_u32(&usage["output_tokens"]),
                                    }),
                                });
                            }
                            "message_delta" => {
                                let output_tokens = usage_u32(&parsed["usage"]["output_tokens"]);
                                if output_tokens > 0 {
                                    yield Ok(ChatChunk {
                                        delta: String::new(),
                                        usage: Some(TokenUsage {
                                            input_tokens: 0,
                                            output_tokens,
                                        }),
                                    });
                                }
                            }
                            "message_stop" => break,
                            "error" => {
                                let message = parsed["error"]["message"]
                                    .as_str()
                                    .unwrap_or("stream error")
                                    .to_string();
                                yield Err(ChatHubError::provider(PROVIDER, message));
                                break;
                            }
                            _ => {}
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        yield Err(stream_error(PROVIDER, e).await);
                        break;
                    }
                }
            }
            es.close();
        };

        Ok(Box::pin(stream))
    }

    async fn check_key(&self, api_key: &str) -> Result<(), ChatHubError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map_err(|e| ChatHubError::provider(PROVIDER, e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_error(PROVIDER, response).await);
        }
        Ok(())
    }
}
