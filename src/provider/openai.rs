// src/provider/openai.rs — OpenAI Chat Completions provider

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};

use super::{
    http_error, stream_error, usage_u32, ChatChunk, ChatRequest, ChatResponse, ChatStream,
    ModelProvider, TokenUsage,
};
use crate::infra::errors::ChatHubError;

const PROVIDER: &str = "openai";

pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new() -> Self {
        Self::with_base_url("https://api.openai.com/v1".into())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn build_body(request: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_usage(usage: &serde_json::Value) -> Option<TokenUsage> {
    if !usage.is_object() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: usage_u32(&usage["prompt_tokens"]),
        output_tokens: usage_u32(&usage["completion_tokens"]),
    })
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    async fn chat(
        &self,
        api_key: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, ChatHubError> {
        let body = Self::build_body(&request, false);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
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

        let content = resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ChatHubError::provider(PROVIDER, "Response contained no message"))?
            .to_string();

        let usage = parse_usage(&resp["usage"]).unwrap_or_default();

        Ok(ChatResponse { content, usage })
    }

    async fn chat_stream(
        &self,
        api_key: &str,
        request: ChatRequest,
    ) -> Result<ChatStream, ChatHubError> {
        let body = Self::build_body(&request, true);

        let mut es = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .eventsource()
            .map_err(|e| ChatHubError::provider(PROVIDER, e.to_string()))?;

        let stream = async_stream::stream! {
            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        if msg.data == "[DONE]" {
                            break;
                        }
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

                        let delta = parsed["choices"][0]["delta"]["content"]
                            .as_str()
                            .unwrap_or("")
                            .to_string();

                        // Final chunk carries usage when include_usage is set
                        let usage = parse_usage(&parsed["usage"]);

                        if !delta.is_empty() || usage.is_some() {
                            yield Ok(ChatChunk { delta, usage });
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
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| ChatHubError::provider(PROVIDER, e.to_string()))?;

        if !response.status().is_success() {
            return Err(http_error(PROVIDER, response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn test_body_includes_full_history() {
        let req = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("again"),
            ],
            max_tokens: None,
        };
        let body = OpenAIProvider::build_body(&req, false);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[2]["role"], "assistant");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_stream_body_requests_usage() {
        let req = ChatRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![Message::user("hi")],
            max_tokens: Some(100),
        };
        let body = OpenAIProvider::build_body(&req, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 100);
    }

    #[test]
    fn test_parse_usage() {
        let v = serde_json::json!({"prompt_tokens": 9, "completion_tokens": 3});
        let u = parse_usage(&v).unwrap();
        assert_eq!(u.input_tokens, 9);
        assert_eq!(u.output_tokens, 3);
        assert!(parse_usage(&serde_json::Value::Null).is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let p = OpenAIProvider::with_base_url("http://localhost:8080/v1/".into());
        assert_eq!(p.base_url, "http://localhost:8080/v1");
    }
}
