// src/core/credentials.rs — Per-user API key resolution and storage
//
// Lookup order: key supplied on the request, the user's stored key, then the
// process-wide fallback for that provider. A stored key that no longer
// decrypts counts as absent.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::infra::config::ProvidersConfig;
use crate::provider::Provider;
use crate::security::KeyCipher;
use crate::store::ChatStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    User,
    Environment,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStatus {
    pub configured: bool,
    pub masked: String,
    pub source: KeySource,
}

/// `"********************...abcd"`; empty for keys of 4 chars or fewer.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 4 {
        return String::new();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", "*".repeat(20), tail)
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Clone)]
pub struct Credentials {
    store: Arc<dyn ChatStore>,
    cipher: KeyCipher,
    fallback: HashMap<Provider, String>,
}

impl Credentials {
    pub fn new(store: Arc<dyn ChatStore>, cipher: KeyCipher, providers: &ProvidersConfig) -> Self {
        let mut fallback = HashMap::new();
        let entries = [
            (Provider::OpenAI, &providers.openai_api_key),
            (Provider::Anthropic, &providers.anthropic_api_key),
            (Provider::Google, &providers.google_api_key),
        ];
        for (provider, key) in entries {
            if let Some(k) = non_blank(key.as_deref()) {
                fallback.insert(provider, k.to_string());
            }
        }
        Self {
            store,
            cipher,
            fallback,
        }
    }

    pub fn fallback(&self, provider: Provider) -> Option<&str> {
        self.fallback.get(&provider).map(String::as_str)
    }

    /// The user's stored key, decrypted.
    pub async fn stored(&self, user_id: &str, provider: Provider) -> anyhow::Result<Option<String>> {
        let Some(sealed) = self.store.get_api_key(user_id, provider).await? else {
            return Ok(None);
        };
        match self.cipher.decrypt(&sealed) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(
                    "Stored {} key for user {} could not be decrypted: {}",
                    provider,
                    user_id,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Resolve the key for one call, with where it came from.
    pub async fn resolve_with_source(
        &self,
        user_id: &str,
        provider: Provider,
        explicit: Option<&str>,
    ) -> anyhow::Result<Option<(String, KeySource)>> {
        if let Some(k) = non_blank(explicit) {
            return Ok(Some((k.to_string(), KeySource::User)));
        }
        if let Some(k) = self.stored(user_id, provider).await? {
            return Ok(Some((k, KeySource::User)));
        }
        Ok(self
            .fallback(provider)
            .map(|k| (k.to_string(), KeySource::Environment)))
    }

    pub async fn resolve(
        &self,
        user_id: &str,
        provider: Provider,
        explicit: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        Ok(self
            .resolve_with_source(user_id, provider, explicit)
            .await?
            .map(|(k, _)| k))
    }

    /// Merge-save: blank values leave the stored key untouched. Returns the
    /// providers that were written.
    pub async fn save(
        &self,
        user_id: &str,
        updates: &[(Provider, Option<String>)],
    ) -> anyhow::Result<Vec<Provider>> {
        let mut saved = Vec::new();
        for (provider, value) in updates {
            let Some(key) = non_blank(value.as_deref()) else {
                continue;
            };
            let sealed = self.cipher.encrypt(key)?;
            self.store.save_api_key(user_id, *provider, &sealed).await?;
            tracing::info!("Saved {} key for user {} ({})", provider, user_id, mask_key(key));
            saved.push(*provider);
        }
        Ok(saved)
    }

    /// Status of every provider for the settings page.
    pub async fn status(&self, user_id: &str) -> anyhow::Result<BTreeMap<&'static str, KeyStatus>> {
        let mut out = BTreeMap::new();
        for provider in Provider::ALL {
            let status = match self.resolve_with_source(user_id, provider, None).await? {
                Some((key, source)) => KeyStatus {
                    configured: true,
                    masked: mask_key(&key),
                    source,
                },
                None => KeyStatus {
                    configured: false,
                    masked: String::new(),
                    source: KeySource::None,
                },
            };
            out.insert(provider.as_str(), status);
        }
        Ok(out)
    }

    pub async fn touch(&self, user_id: &str, provider: Provider) {
        if let Err(e) = self.store.touch_api_key(user_id, provider).await {
            tracing::warn!("Failed to record key use for {}: {}", provider, e);
        }
    }
}
