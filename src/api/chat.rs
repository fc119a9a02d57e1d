// src/api/chat.rs — POST /api/chat, buffered JSON or server-sent events

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use std::time::Duration;

use crate::api::auth::require_user;
use crate::api::types::{
    api_error, bad_request, internal, not_found, ApiError, ChatErrorBody, ChatRequestBody,
    ChatResponseBody,
};
use crate::api::ApiState;
use crate::core::chat::ChatInput;
use crate::infra::errors::ChatHubError;

const KEEP_ALIVE_SECS: u64 = 15;

/// Status for failures that happen before the vendor is called.
fn reject(e: ChatHubError) -> ApiError {
    match e {
        ChatHubError::Validation(_)
        | ChatHubError::UnknownProvider(_)
        | ChatHubError::MissingApiKey { .. } => bad_request(e.to_string()),
        ChatHubError::NotFound(_) => not_found(e.to_string()),
        ChatHubError::Unauthorized(_) => api_error(StatusCode::UNAUTHORIZED, e.to_string()),
        other => internal(other),
    }
}

fn is_store_failure(e: &ChatHubError) -> bool {
    matches!(
        e,
        ChatHubError::Database(_) | ChatHubError::Storage(_) | ChatHubError::Io(_) | ChatHubError::Other(_)
    )
}

pub async fn chat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Result<Response, ApiError> {
    let user = require_user(&state, &headers).await?;
    let stream = body.stream;
    let input = ChatInput {
        message: body.message,
        provider: body.provider,
        model: body.model,
        conversation_id: body.conversation_id,
        api_key: body.api_key,
    };

    let prepared = state.chat.prepare(&user.id, input).await.map_err(reject)?;
    tracing::info!(
        "Chat turn for conversation {} via {}/{} (stream={})",
        prepared.conversation_id,
        prepared.provider,
        prepared.model,
        stream
    );

    if stream {
        let mut rx = state.chat.stream(prepared);
        let events = async_stream::stream! {
            while let Some(ev) = rx.recv().await {
                let data = serde_json::to_string(&ev).unwrap_or_default();
                yield Ok::<Event, Infallible>(Event::default().data(data));
            }
        };
        return Ok(Sse::new(events)
            .keep_alive(
                KeepAlive::new()
                    .interval(Duration::from_secs(KEEP_ALIVE_SECS))
                    .text("keep-alive"),
            )
            .into_response());
    }

    let conversation_id = prepared.conversation_id.clone();
    let provider = prepared.provider.as_str().to_string();
    let model = prepared.model.clone();

    match state.chat.complete(prepared).await {
        Ok(reply) => Ok(Json(ChatResponseBody {
            response: reply.content,
            conversation_id,
            provider,
            model,
            usage: reply.usage,
        })
        .into_response()),
        Err(e) if is_store_failure(&e) => Err(internal(e)),
        Err(e) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ChatErrorBody {
                error: e.client_message(),
                conversation_id,
                provider,
                model,
            }),
        )
            .into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_statuses() {
        let (s, Json(b)) = reject(ChatHubError::Validation("Message is required".into()));
        assert_eq!(s, StatusCode::BAD_REQUEST);
        assert_eq!(b.error, "Message is required");

        let (s, Json(b)) = reject(ChatHubError::MissingApiKey {
            provider_name: "Anthropic".into(),
        });
        assert_eq!(s, StatusCode::BAD_REQUEST);
        assert!(b.error.contains("Anthropic"));

        let (s, _) = reject(ChatHubError::NotFound("Conversation".into()));
        assert_eq!(s, StatusCode::NOT_FOUND);

        let (s, Json(b)) = reject(ChatHubError::Storage("disk full".into()));
        assert_eq!(s, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(b.error, "Internal server error");
    }

    #[test]
    fn test_vendor_errors_are_not_store_failures() {
        assert!(!is_store_failure(&ChatHubError::provider("openai", "HTTP 500")));
        assert!(is_store_failure(&ChatHubError::Other(anyhow::anyhow!("db gone"))));
    }
}
