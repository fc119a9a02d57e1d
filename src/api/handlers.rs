// src/api/handlers.rs

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use std::collections::BTreeMap;

use crate::api::auth::{current_user as session_user, require_user};
use crate::api::types::*;
use crate::api::ApiState;
use crate::core::chat::{DEFAULT_MODEL, NEW_CHAT_TITLE};
use crate::core::credentials::KeyStatus;
use crate::core::pricing::{self, ProviderCatalog};
use crate::provider::Provider;
use crate::store::{Conversation, ConversationUpdate, ListOptions, User};

/// Load a conversation the user owns. Foreign ids answer 404 like missing ones.
async fn owned_conversation(state: &ApiState, user: &User, id: &str) -> Result<Conversation, ApiError> {
    state
        .store
        .get_conversation(id)
        .await
        .map_err(internal)?
        .filter(|c| c.user_id == user.id)
        .ok_or_else(|| not_found("Conversation not found"))
}

fn parse_provider(name: &str) -> Result<Provider, ApiError> {
    name.parse::<Provider>()
        .map_err(|e| bad_request(e.to_string()))
}

/// GET /api/user
pub async fn current_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Option<UserResponse>>, ApiError> {
    let user = session_user(&state, &headers).await?;
    Ok(Json(user.as_ref().map(UserResponse::from)))
}

/// GET /api/models
pub async fn models() -> Json<BTreeMap<&'static str, ProviderCatalog>> {
    Json(pricing::catalog())
}

/// GET /api/keys
pub async fn key_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<&'static str, KeyStatus>>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let status = state.credentials.status(&user.id).await.map_err(internal)?;
    Ok(Json(status))
}

/// POST /api/keys
pub async fn save_keys(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<SaveKeysRequest>,
) -> Result<Json<SaveKeysResponse>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let updates = [
        (Provider::OpenAI, req.openai),
        (Provider::Anthropic, req.anthropic),
        (Provider::Google, req.google),
    ];
    let saved = state
        .credentials
        .save(&user.id, &updates)
        .await
        .map_err(internal)?;

    Ok(Json(SaveKeysResponse {
        success: true,
        saved: saved.iter().map(|p| p.as_str().to_string()).collect(),
    }))
}

/// POST /api/keys/test — validate the given or resolved key with the vendor.
pub async fn test_key(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<TestKeyRequest>,
) -> Result<Json<TestKeyResponse>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let provider = parse_provider(&req.provider)?;

    let Some(key) = state
        .credentials
        .resolve(&user.id, provider, req.api_key.as_deref())
        .await
        .map_err(internal)?
    else {
        return Ok(Json(TestKeyResponse {
            success: false,
            error: Some(format!("No API key configured for {}", provider.display_name())),
        }));
    };

    let adapter = state
        .chat
        .providers()
        .get(provider)
        .map_err(|e| bad_request(e.to_string()))?;

    match adapter.check_key(&key).await {
        Ok(()) => Ok(Json(TestKeyResponse {
            success: true,
            error: None,
        })),
        Err(e) => {
            tracing::info!("{} key check failed for user {}", provider, user.id);
            Ok(Json(TestKeyResponse {
                success: false,
                error: Some(e.client_message()),
            }))
        }
    }
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let opts = ListOptions {
        include_archived: query.include_archived.unwrap_or(false),
        limit: query.limit,
        search: query.q.filter(|q| !q.trim().is_empty()),
    };
    let list = state
        .store
        .list_conversations(&user.id, opts)
        .await
        .map_err(internal)?;
    Ok(Json(list))
}

/// POST /api/conversations — an empty conversation titled "New Chat".
pub async fn create_conversation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<Json<Conversation>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let req = body.map(|Json(b)| b).unwrap_or_default();

    let provider = match req.provider.as_deref() {
        Some(p) => parse_provider(p)?,
        None => Provider::OpenAI,
    };
    let model = req.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let conv = state
        .store
        .create_conversation(&user.id, NEW_CHAT_TITLE, provider.as_str(), &model)
        .await
        .map_err(internal)?;
    Ok(Json(conv))
}

/// GET /api/conversations/{id}
pub async fn get_conversation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ConversationDetail>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let conversation = owned_conversation(&state, &user, &id).await?;
    let messages = state.store.get_messages(&id).await.map_err(internal)?;
    Ok(Json(ConversationDetail {
        conversation,
        messages,
    }))
}

/// PATCH /api/conversations/{id}
pub async fn update_conversation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateConversationRequest>,
) -> Result<Json<Conversation>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let conversation = owned_conversation(&state, &user, &id).await?;

    let title = match req.title {
        Some(t) if t.trim().is_empty() => return Err(bad_request("Title cannot be empty")),
        Some(t) => Some(t.trim().to_string()),
        None => None,
    };
    let update = ConversationUpdate {
        title,
        is_archived: req.is_archived,
        is_pinned: req.is_pinned,
        ..Default::default()
    };
    if update == ConversationUpdate::default() {
        return Ok(Json(conversation));
    }

    state
        .store
        .update_conversation(&id, update)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found("Conversation not found"))
}

/// DELETE /api/conversations/{id}
pub async fn delete_conversation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let user = require_user(&state, &headers).await?;
    owned_conversation(&state, &user, &id).await?;
    state.store.delete_conversation(&id).await.map_err(internal)?;
    tracing::info!("Deleted conversation {} for user {}", id, user.id);
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /api/usage
pub async fn usage(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<UsageResponse>, ApiError> {
    let user = require_user(&state, &headers).await?;
    let totals = state.store.usage_stats(&user.id).await.map_err(internal)?;
    let by_provider = state.store.provider_usage(&user.id).await.map_err(internal)?;
    Ok(Json(UsageResponse { totals, by_provider }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
