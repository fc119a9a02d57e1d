// src/cli/serve.rs — `chathub serve`

use crate::api::{self, ApiState};
use crate::cli::ServeArgs;
use crate::infra::config::{Config, StorageBackend};
use crate::provider::ProviderTable;
use crate::store;

/// Fold command-line overrides into the loaded config.
pub fn apply_overrides(config: &mut Config, args: &ServeArgs) -> anyhow::Result<()> {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(storage) = &args.storage {
        config.storage.backend = storage.parse::<StorageBackend>()?;
    }
    Ok(())
}

pub async fn run_serve(mut config: Config, args: ServeArgs) -> anyhow::Result<()> {
    apply_overrides(&mut config, &args)?;

    if config.security.is_dev_secret() {
        tracing::warn!(
            "Using the development secret key. Set CHATHUB_SECRET_KEY before exposing this server."
        );
    }
    if config.oauth.google.is_none() {
        tracing::info!("Google sign-in disabled (GOOGLE_CLIENT_ID/GOOGLE_CLIENT_SECRET not set)");
    }

    let store = store::open(&config.storage)?;
    match store.cleanup_expired_sessions().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Removed {} expired sessions", n),
        Err(e) => tracing::warn!("Session cleanup failed: {}", e),
    }

    let providers = ProviderTable::from_config(&config.providers);
    let state = ApiState::new(&config, store, providers);
    api::start_server(&config, state).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_applied() {
        let mut config = Config::default();
        let args = ServeArgs {
            host: Some("127.0.0.1".into()),
            port: Some(9000),
            storage: Some("json".into()),
        };
        apply_overrides(&mut config, &args).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.backend, StorageBackend::File);
    }

    #[test]
    fn test_no_overrides_keeps_config() {
        let mut config = Config::default();
        apply_overrides(&mut config, &ServeArgs::default()).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    }

    #[test]
    fn test_bad_storage_rejected() {
        let mut config = Config::default();
        let args = ServeArgs {
            storage: Some("postgres".into()),
            ..Default::default()
        };
        let err = apply_overrides(&mut config, &args).unwrap_err();
        assert!(err.to_string().contains("unknown storage backend 'postgres'"));
    }
}
