// src/api/account.rs — Registration, password login, logout, Google sign-in

use axum::extract::{Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{AppendHeaders, IntoResponse, Redirect, Response};
use axum::Json;

use crate::api::auth::{constant_time_eq, start_session};
use crate::api::types::{
    api_error, bad_request, internal, not_found, unauthorized, ApiError, AuthResponse, LoginRequest,
    OAuthCallbackQuery, RegisterRequest, UserResponse,
};
use crate::api::ApiState;
use crate::auth::oauth::GoogleUserInfo;
use crate::auth::{
    self, clear_cookie, hash_password, verify_password, MIN_PASSWORD_LEN, OAUTH_STATE_COOKIE,
    SESSION_COOKIE,
};
use crate::infra::errors::ChatHubError;
use crate::store::{AuthType, NewUser, User, UserUpdate};

const OAUTH_STATE_TTL_SECS: i64 = 600;

fn signed_in(user: &User, cookie: String) -> Response {
    (
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(AuthResponse {
            success: true,
            user: UserResponse::from(user),
        }),
    )
        .into_response()
}

/// A concurrent registration can win between the email check and the insert.
fn registration_error(e: anyhow::Error) -> ApiError {
    match e.downcast_ref::<ChatHubError>() {
        Some(taken @ ChatHubError::EmailTaken) => bad_request(taken.to_string()),
        _ => internal(e),
    }
}

pub async fn register(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let email = req.email.trim();
    if email.is_empty() || req.password.is_empty() {
        return Err(bad_request("Email and password are required"));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(bad_request(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if state
        .store
        .get_user_by_email(email)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err(bad_request("Email already registered"));
    }

    let password_hash = hash_password(&req.password).map_err(internal)?;
    let user = state
        .store
        .create_user(NewUser {
            email: email.to_string(),
            name: req.name.unwrap_or_default(),
            password_hash: Some(password_hash),
            auth_type: AuthType::Email,
            picture_url: None,
        })
        .await
        .map_err(registration_error)?;
    tracing::info!("Registered user {}", user.id);

    let cookie = start_session(&state, &user, &headers).await?;
    Ok(signed_in(&user, cookie))
}

pub async fn login(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    if req.email.trim().is_empty() || req.password.is_empty() {
        return Err(bad_request("Email and password are required"));
    }
    let user = state
        .store
        .get_user_by_email(&req.email)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("User not found"))?;

    let Some(hash) = user.password_hash.as_deref() else {
        return Err(unauthorized("This account uses Google sign-in"));
    };
    if !verify_password(&req.password, hash) {
        tracing::info!("Failed login for user {}", user.id);
        return Err(unauthorized("Invalid password"));
    }
    if !user.is_active {
        return Err(unauthorized("Account is disabled"));
    }

    let cookie = start_session(&state, &user, &headers).await?;
    Ok(signed_in(&user, cookie))
}

pub async fn logout(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    if let Some(token) = auth::read_cookie(&headers, SESSION_COOKIE) {
        if let Err(e) = state.store.delete_session(&token).await {
            tracing::warn!("Failed to delete session on logout: {}", e);
        }
    }
    (
        AppendHeaders([(SET_COOKIE, clear_cookie(SESSION_COOKIE, state.secure_cookies))]),
        Redirect::to("/login"),
    )
        .into_response()
}

/// Redirect to Google's consent page with a fresh CSRF state.
pub async fn google_login(State(state): State<ApiState>) -> Response {
    let Some(oauth) = &state.oauth else {
        return Redirect::to("/login?error=google_not_configured").into_response();
    };

    let url = auth::generate_token().and_then(|csrf| {
        oauth
            .authorization_url(&csrf)
            .map(|url| (csrf, url))
    });
    match url {
        Ok((csrf, url)) => (
            AppendHeaders([(
                SET_COOKIE,
                auth::cookie(OAUTH_STATE_COOKIE, &csrf, OAUTH_STATE_TTL_SECS, state.secure_cookies),
            )]),
            Redirect::to(&url),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to start Google sign-in: {}", e);
            Redirect::to("/login?error=oauth_failed").into_response()
        }
    }
}

pub async fn google_callback(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<OAuthCallbackQuery>,
) -> Response {
    let clear_state = clear_cookie(OAUTH_STATE_COOKIE, state.secure_cookies);
    let fail = |reason: &str| {
        (
            AppendHeaders([(SET_COOKIE, clear_state.clone())]),
            Redirect::to(&format!("/login?error={reason}")),
        )
            .into_response()
    };

    let Some(oauth) = &state.oauth else {
        return fail("google_not_configured");
    };
    if let Some(err) = &query.error {
        tracing::info!("Google sign-in declined: {}", err);
        return fail("access_denied");
    }

    let expected = auth::read_cookie(&headers, OAUTH_STATE_COOKIE).unwrap_or_default();
    let returned = query.state.unwrap_or_default();
    if expected.is_empty() || !constant_time_eq(expected.as_bytes(), returned.as_bytes()) {
        tracing::warn!("Google callback with mismatched state");
        return fail("invalid_state");
    }
    let Some(code) = query.code.filter(|c| !c.is_empty()) else {
        return fail("missing_code");
    };

    let info = match oauth.exchange(&code).await {
        Ok(info) => info,
        Err(e) => {
            tracing::error!("Google sign-in failed: {}", e);
            return fail("oauth_failed");
        }
    };

    let user = match find_or_create_google_user(&state, info).await {
        Ok(user) => user,
        Err((_, Json(body))) => {
            tracing::error!("Google sign-in could not resolve user: {}", body.error);
            return fail("oauth_failed");
        }
    };
    if !user.is_active {
        return fail("account_disabled");
    }

    match start_session(&state, &user, &headers).await {
        Ok(cookie) => (
            AppendHeaders([(SET_COOKIE, cookie), (SET_COOKIE, clear_state.clone())]),
            Redirect::to("/"),
        )
            .into_response(),
        Err(_) => fail("session_failed"),
    }
}

/// Existing accounts with the same email are signed in and get their
/// profile refreshed; otherwise a Google account is created.
async fn find_or_create_google_user(state: &ApiState, info: GoogleUserInfo) -> Result<User, ApiError> {
    if info.email.trim().is_empty() {
        return Err(api_error(
            axum::http::StatusCode::BAD_REQUEST,
            "Google account has no email",
        ));
    }

    if let Some(existing) = state
        .store
        .get_user_by_email(&info.email)
        .await
        .map_err(internal)?
    {
        let update = UserUpdate {
            name: Some(info.name.clone()).filter(|n| !n.trim().is_empty()),
            picture_url: info.picture.clone(),
        };
        if update.name.is_none() && update.picture_url.is_none() {
            return Ok(existing);
        }
        let id = existing.id.clone();
        return Ok(state
            .store
            .update_user(&id, update)
            .await
            .map_err(internal)?
            .unwrap_or(existing));
    }

    let user = state
        .store
        .create_user(NewUser {
            email: info.email,
            name: info.name,
            password_hash: None,
            auth_type: AuthType::Google,
            picture_url: info.picture,
        })
        .await
        .map_err(internal)?;
    tracing::info!("Created Google user {}", user.id);
    Ok(user)
}
