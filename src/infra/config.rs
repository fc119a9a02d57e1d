// src/infra/config.rs — Configuration loading (TOML + environment)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::infra::errors::ChatHubError;
use crate::infra::paths;

/// Secret used when nothing is configured. Fine for local runs only.
pub const DEV_SECRET_KEY: &str = "dev-secret-key-change-in-production";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub oauth: OAuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible base URL, used to build the OAuth redirect.
    pub public_url: Option<String>,
    /// Directory of front-end assets served for unmatched paths.
    pub static_dir: Option<String>,
    pub secure_cookies: bool,
    pub session_ttl_hours: i64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            public_url: None,
            static_dir: None,
            secure_cookies: false,
            session_ttl_hours: 168,
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    File,
}

impl std::str::FromStr for StorageBackend {
    type Err = ChatHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "database" | "db" => Ok(StorageBackend::Sqlite),
            "file" | "json" => Ok(StorageBackend::File),
            other => Err(ChatHubError::Config(format!("unknown storage backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_path: Option<String>,
    pub users_file: String,
    pub user_data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: None,
            users_file: "users.json".into(),
            user_data_dir: "user_data".into(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(p) => paths::resolve_data_path(p),
            None => paths::default_db_path(),
        }
    }

    pub fn users_file(&self) -> PathBuf {
        paths::resolve_data_path(&self.users_file)
    }

    pub fn user_data_dir(&self) -> PathBuf {
        paths::resolve_data_path(&self.user_data_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub secret_key: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret_key: DEV_SECRET_KEY.into(),
        }
    }
}

impl SecurityConfig {
    pub fn is_dev_secret(&self) -> bool {
        self.secret_key == DEV_SECRET_KEY
    }
}

/// Process-wide fallback keys and optional endpoint overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub google_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub google: Option<GoogleOAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|k| std::env::var(k).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Overlay environment variables. `lookup` is injectable for tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        if let Some(secret) = get("CHATHUB_SECRET_KEY").or_else(|| get("FLASK_SECRET_KEY")) {
            self.security.secret_key = secret;
        }
        if let Some(k) = get("OPENAI_API_KEY") {
            self.providers.openai_api_key = Some(k);
        }
        if let Some(k) = get("ANTHROPIC_API_KEY") {
            self.providers.anthropic_api_key = Some(k);
        }
        if let Some(k) = get("GEMINI_API_KEY") {
            self.providers.google_api_key = Some(k);
        }
        if let Some(backend) = get("CHATHUB_STORAGE") {
            match backend.parse() {
                Ok(b) => self.storage.backend = b,
                Err(e) => tracing::warn!("Ignoring CHATHUB_STORAGE: {}", e),
            }
        }

        let client_id = get("GOOGLE_CLIENT_ID");
        let client_secret = get("GOOGLE_CLIENT_SECRET");
        if let (Some(client_id), Some(client_secret)) = (client_id, client_secret) {
            let redirect_uri = get("GOOGLE_REDIRECT_URI").or_else(|| {
                self.oauth
                    .google
                    .as_ref()
                    .and_then(|g| g.redirect_uri.clone())
            });
            self.oauth.google = Some(GoogleOAuthConfig {
                client_id,
                client_secret,
                redirect_uri,
            });
        }
    }
}
