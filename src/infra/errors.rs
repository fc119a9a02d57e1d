// src/infra/errors.rs — Error types for chathub

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatHubError {
    // Vendor call failures. Never retried; the message is surfaced verbatim.
    #[error("Provider '{provider}' error: {message}")]
    Provider { provider: String, message: String },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("API key not configured for {provider_name}. Please add your API key in Settings.")]
    MissingApiKey { provider_name: String },

    // Request errors
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Email already registered")]
    EmailTaken,

    // Infra
    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatHubError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        ChatHubError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// The text shown to the client and stored on error-flagged messages.
    /// Vendor failures surface the raw vendor text without the wrapper.
    pub fn client_message(&self) -> String {
        match self {
            ChatHubError::Provider { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_client_message_is_raw() {
        let e = ChatHubError::provider("openai", "HTTP 401: invalid key");
        assert_eq!(e.client_message(), "HTTP 401: invalid key");
        assert_eq!(e.to_string(), "Provider 'openai' error: HTTP 401: invalid key");
    }

    #[test]
    fn test_missing_api_key_names_provider() {
        let e = ChatHubError::MissingApiKey {
            provider_name: "Anthropic".into(),
        };
        assert!(e.client_message().contains("Anthropic"));
    }

    #[test]
    fn test_not_found_message() {
        let e = ChatHubError::NotFound("Conversation".into());
        assert_eq!(e.to_string(), "Conversation not found");
    }
}
