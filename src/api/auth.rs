// src/api/auth.rs

use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};

use crate::api::types::{internal, unauthorized, ApiError};
use crate::api::ApiState;
use crate::auth::{self, SESSION_COOKIE};
use crate::store::{now_timestamp, timestamp, Session, User};

/// The signed-in user, if the session cookie names a live session.
/// Expired sessions are deleted on sight.
pub async fn current_user(state: &ApiState, headers: &HeaderMap) -> Result<Option<User>, ApiError> {
    let Some(token) = auth::read_cookie(headers, SESSION_COOKIE) else {
        return Ok(None);
    };
    let Some(session) = state.store.get_session(&token).await.map_err(internal)? else {
        return Ok(None);
    };
    if session.is_expired() {
        if let Err(e) = state.store.delete_session(&token).await {
            tracing::warn!("Failed to delete expired session: {}", e);
        }
        return Ok(None);
    }

    let user = state.store.get_user(&session.user_id).await.map_err(internal)?;
    Ok(user.filter(|u| u.is_active))
}

/// Like [`current_user`], but 401 when nobody is signed in.
pub async fn require_user(state: &ApiState, headers: &HeaderMap) -> Result<User, ApiError> {
    current_user(state, headers)
        .await?
        .ok_or_else(|| unauthorized("Authentication required"))
}

/// Open a session for `user` and return the `Set-Cookie` value.
pub async fn start_session(state: &ApiState, user: &User, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = auth::generate_token().map_err(internal)?;
    let ttl = Duration::hours(state.session_ttl_hours);
    let session = Session {
        token: token.clone(),
        user_id: user.id.clone(),
        expires_at: timestamp(Utc::now() + ttl),
        ip_address: client_ip(headers),
        user_agent: header_str(headers, header::USER_AGENT.as_str()),
        created_at: now_timestamp(),
    };
    state.store.create_session(session).await.map_err(internal)?;
    if let Err(e) = state.store.record_login(&user.id).await {
        tracing::warn!("Failed to record login for {}: {}", user.id, e);
    }
    tracing::info!("User {} signed in", user.id);

    Ok(auth::cookie(
        SESSION_COOKIE,
        &token,
        ttl.num_seconds(),
        state.secure_cookies,
    ))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
}

/// Constant-time byte comparison for CSRF state checks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
