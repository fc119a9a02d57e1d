// src/provider/google.rs — Google Gemini API provider

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};

use super::{
    http_error, stream_error, usage_u32, ChatChunk, ChatRequest, ChatResponse, ChatStream,
    ModelProvider, Role, TokenUsage,
};
use crate::infra::errors::ChatHubError;

const PROVIDER: &str = "google";

pub struct GoogleProvider {
    client: reqwest::Client,
    base_url: String,
}

impl GoogleProvider {
    pub fn new() -> Self {
        Self::with_base_url("https://generativelanguage.googleapis.com/v1beta".into())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn build_request_body(request: &ChatRequest) -> serde_json::Value {
        let mut contents = Vec::new();
        let mut system = Vec::new();

        for m in &request.messages {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
                Role::System => {
                    system.push(m.content.as_str());
                    continue;
                }
            };
            contents.push(serde_json::json!({
                "role": role,
                "parts": [{ "text": m.content }],
            }));
        }

        let mut body = serde_json::json!({ "contents": contents });

        if !system.is_empty() {
            body["system_instruction"] = serde_json::json!({
                "parts": [{ "text": system.join("\n\n") }],
            });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["generationConfig"] = serde_json::json!({ "maxOutputTokens": max_tokens });
        }
        body
    }
}

impl Default for GoogleProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenate the text parts of the first candidate.
fn candidate_text(resp: &serde_json::Value) -> Option<String> {
    let parts = resp["candidates"][0]["content"]["parts"].as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join(""),
    )
}

fn parse_usage(resp: &serde_json::Value) -> Option<TokenUsage> {
    let meta = &resp["usageMetadata"];
    if !meta.is_object() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: usage_u32(&meta["promptTokenCount"]),
        output_tokens: usage_u32(&meta["candidatesTokenCount"]),
    })
}

// The key travels in the query string, so transport errors drop the URL.
fn transport_error(e: reqwest::Error) -> ChatHubError {
    ChatHubError::provider(PROVIDER, e.without_url().to_string())
}

#[async_trait]
impl ModelProvider for GoogleProvider {
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
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, request.model
            ))
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(http_error(PROVIDER, response).await);
        }

        let resp: serde_json::Value = response.json().await.map_err(|e| {
            ChatHubError::provider(PROVIDER, format!("Failed to parse response: {}", e))
        })?;

        let content = candidate_text(&resp).ok_or_else(|| {
            let reason = resp["promptFeedback"]["blockReason"]
                .as_str()
                .unwrap_or("no candidates returned");
            ChatHubError::provider(PROVIDER, format!("Empty response: {}", reason))
        })?;

        let usage = parse_usage(&resp).unwrap_or_default();

        Ok(ChatResponse { content, usage })
    }

    async fn chat_stream(
        &self,
        api_key: &str,
        request: ChatRequest,
    ) -> Result<ChatStream, ChatHubError> {
        let body = Self::build_request_body(&request);

        let mut es = self
            .client
            .post(format!(
                "{}/models/{}:streamGenerateContent",
                self.base_url, request.model
            ))
            .query(&[("alt", "sse"), ("key", api_key)])
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

                        let delta = candidate_text(&parsed).unwrap_or_default();
                        // Gemini repeats cumulative usage on each chunk
                        let usage = parse_usage(&parsed);

                        if !delta.is_empty() || usage.is_some() {
                            yield Ok(ChatChunk { delta, usage });
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(reqwest_eventsource::Error::Transport(e)) => {
                        yield Err(transport_error(e));
                        break;
                    }
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
            .query(&[("key", api_key)])
            .send()
            .await
            .map_err(transport_error)?;

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
    fn test_roles_mapped() {
        let req = ChatRequest {
            model: "gemini-2.5-flash".into(),
            messages: vec![
                Message::system("be kind"),
                Message::user("hi"),
                Message::assistant("hello"),
            ],
            max_tokens: None,
        };
        let body = GoogleProvider::build_request_body(&req);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "be kind");
    }

    #[test]
    fn test_candidate_text_joins_parts() {
        let v = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "Hel"}, {"text": "lo"}]}}]
        });
        assert_eq!(candidate_text(&v).as_deref(), Some("Hello"));
        assert!(candidate_text(&serde_json::json!({})).is_none());
    }

    #[test]
    fn test_parse_usage_metadata() {
        let v = serde_json::json!({
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 2}
        });
        let u = parse_usage(&v).unwrap();
        assert_eq!(u.input_tokens, 7);
        assert_eq!(u.output_tokens, 2);
    }
}
