// src/api/mod.rs — HTTP surface: account routes, JSON API, streamed chat

pub mod account;
pub mod auth;
pub mod chat;
pub mod handlers;
pub mod types;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth::oauth::GoogleOAuth;
use crate::core::chat::ChatService;
use crate::core::credentials::Credentials;
use crate::infra::config::Config;
use crate::provider::ProviderTable;
use crate::security::KeyCipher;
use crate::store::ChatStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ChatStore>,
    pub credentials: Credentials,
    pub chat: ChatService,
    /// `None` when Google sign-in is not configured.
    pub oauth: Option<GoogleOAuth>,
    pub session_ttl_hours: i64,
    pub secure_cookies: bool,
}

impl ApiState {
    pub fn new(config: &Config, store: Arc<dyn ChatStore>, providers: ProviderTable) -> Self {
        let cipher = KeyCipher::from_secret(&config.security.secret_key);
        let credentials = Credentials::new(store.clone(), cipher, &config.providers);
        let chat = ChatService::new(store.clone(), credentials.clone(), providers);

        let base = config
            .server
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", config.server.port));
        let default_redirect = format!("{}/auth/google/callback", base.trim_end_matches('/'));
        let oauth = config
            .oauth
            .google
            .as_ref()
            .map(|g| GoogleOAuth::new(g, &default_redirect));

        Self {
            store,
            credentials,
            chat,
            oauth,
            session_ttl_hours: config.server.session_ttl_hours,
            secure_cookies: config.server.secure_cookies,
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/auth/register", post(account::register))
        .route("/auth/login", post(account::login))
        .route("/auth/logout", get(account::logout))
        .route("/auth/google", get(account::google_login))
        .route("/auth/google/callback", get(account::google_callback))
        .route("/api/user", get(handlers::current_user))
        .route("/api/models", get(handlers::models))
        .route("/api/keys", get(handlers::key_status).post(handlers::save_keys))
        .route("/api/keys/test", post(handlers::test_key))
        .route(
            "/api/conversations",
            get(handlers::list_conversations).post(handlers::create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            get(handlers::get_conversation)
                .patch(handlers::update_conversation)
                .delete(handlers::delete_conversation),
        )
        .route("/api/chat", post(chat::chat))
        .route("/api/usage", get(handlers::usage))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the server and block until it exits.
pub async fn start_server(config: &Config, state: ApiState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let mut router = build_router(state);
    if let Some(dir) = &config.server.static_dir {
        tracing::info!("Serving static files from {}", dir);
        router = router.fallback_service(ServeDir::new(dir));
    }

    tracing::info!("chathub listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
