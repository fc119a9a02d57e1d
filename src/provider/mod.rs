// src/provider/mod.rs — Model provider layer

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod resolver;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::infra::errors::ChatHubError;

pub use resolver::ProviderTable;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, ChatHubError>> + Send>>;

/// One vendor integration. The credential is passed per call because keys
/// belong to users, not to the process.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn chat(&self, api_key: &str, request: ChatRequest)
        -> Result<ChatResponse, ChatHubError>;

    /// Lazy, finite stream of text fragments. Not restartable.
    async fn chat_stream(&self, api_key: &str, request: ChatRequest)
        -> Result<ChatStream, ChatHubError>;

    /// Cheap authenticated call used to validate a key.
    async fn check_key(&self, api_key: &str) -> Result<(), ChatHubError>;
}

/// The three supported vendors.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAI, Provider::Anthropic, Provider::Google];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Google => "Google",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = ChatHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::OpenAI),
            "anthropic" => Ok(Provider::Anthropic),
            "google" => Ok(Provider::Google),
            other => Err(ChatHubError::UnknownProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// A streamed fragment. `usage` carries whatever counts the vendor reported
/// on this event; a zero field means "not reported here".
#[derive(Debug, Clone, Default)]
pub struct ChatChunk {
    pub delta: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Fold a partial report into this one, keeping the larger count per side.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
    }
}

pub(crate) fn usage_u32(v: &serde_json::Value) -> u32 {
    v.as_u64()
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Read the body of a failed vendor response into an opaque provider error.
pub(crate) async fn http_error(provider: &str, response: reqwest::Response) -> ChatHubError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ChatHubError::provider(provider, format!("HTTP {}: {}", status, body))
}

/// Map an event-source failure into a provider error, reading the vendor
/// body when the stream was refused with an HTTP status.
pub(crate) async fn stream_error(
    provider: &str,
    err: reqwest_eventsource::Error,
) -> ChatHubError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(_, response) => {
            http_error(provider, response).await
        }
        other => ChatHubError::provider(provider, format!("SSE stream error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Provider tests ─────────────────────────────────────────

    #[test]
    fn test_provider_parse_known() {
        assert_eq!("openai".parse::<Provider>().unwrap(), Provider::OpenAI);
        assert_eq!("anthropic".parse::<Provider>().unwrap(), Provider::Anthropic);
        assert_eq!("google".parse::<Provider>().unwrap(), Provider::Google);
    }

    #[test]
    fn test_provider_parse_unknown() {
        let err = "mistral".parse::<Provider>().unwrap_err();
        assert!(matches!(err, ChatHubError::UnknownProvider(ref p) if p == "mistral"));
    }

    #[test]
    fn test_provider_parse_is_case_sensitive() {
        assert!("OpenAI".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_display_names() {
        assert_eq!(Provider::OpenAI.display_name(), "OpenAI");
        assert_eq!(Provider::Anthropic.display_name(), "Anthropic");
        assert_eq!(Provider::Google.display_name(), "Google");
    }

    #[test]
    fn test_provider_serde_lowercase() {
        let s = serde_json::to_string(&Provider::Google).unwrap();
        assert_eq!(s, "\"google\"");
    }

    // ─── TokenUsage tests ───────────────────────────────────────

    #[test]
    fn test_token_usage_total() {
        let u = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        };
        assert_eq!(u.total(), 150);
    }

    #[test]
    fn test_token_usage_total_saturates() {
        let u = TokenUsage {
            input_tokens: u32::MAX,
            output_tokens: 7,
        };
        assert_eq!(u.total(), u32::MAX);
    }

    #[test]
    fn test_usage_u32_clamps_vendor_counts() {
        assert_eq!(usage_u32(&serde_json::json!(42)), 42);
        assert_eq!(usage_u32(&serde_json::json!(5_000_000_000u64)), u32::MAX);
        assert_eq!(usage_u32(&serde_json::json!(-3)), 0);
        assert_eq!(usage_u32(&serde_json::Value::Null), 0);
    }

    #[test]
    fn test_token_usage_merge_partial_reports() {
        let mut u = TokenUsage::default();
        u.merge(&TokenUsage {
            input_tokens: 12,
            output_tokens: 1,
        });
        u.merge(&TokenUsage {
            input_tokens: 0,
            output_tokens: 40,
        });
        assert_eq!(u.input_tokens, 12);
        assert_eq!(u.output_tokens, 40);
    }

    // ─── Message tests ──────────────────────────────────────────

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn test_role_parse_roundtrip() {
        for r in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(Role::parse(r.as_str()), Some(r));
        }
        assert_eq!(Role::parse("tool"), None);
    }
}
