// src/provider/resolver.rs — Provider strategy table

use std::collections::HashMap;
use std::sync::Arc;

use super::anthropic::AnthropicProvider;
use super::google::GoogleProvider;
use super::openai::OpenAIProvider;
use super::{ModelProvider, Provider};
use crate::infra::config::ProvidersConfig;
use crate::infra::errors::ChatHubError;

/// Maps each vendor to its adapter. Built once at startup and shared.
#[derive(Clone)]
pub struct ProviderTable {
    entries: HashMap<Provider, Arc<dyn ModelProvider>>,
}

impl ProviderTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Standard adapters, honouring any base URL overrides.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let openai = match &config.openai_base_url {
            Some(url) => OpenAIProvider::with_base_url(url.clone()),
            None => OpenAIProvider::new(),
        };
        let anthropic = match &config.anthropic_base_url {
            Some(url) => AnthropicProvider::with_base_url(url.clone()),
            None => AnthropicProvider::new(),
        };
        let google = match &config.google_base_url {
            Some(url) => GoogleProvider::with_base_url(url.clone()),
            None => GoogleProvider::new(),
        };

        Self::empty()
            .with(Provider::OpenAI, Arc::new(openai))
            .with(Provider::Anthropic, Arc::new(anthropic))
            .with(Provider::Google, Arc::new(google))
    }

    /// Register (or replace) the adapter for one vendor.
    pub fn with(mut self, provider: Provider, adapter: Arc<dyn ModelProvider>) -> Self {
        self.entries.insert(provider, adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ModelProvider>, ChatHubError> {
        self.entries
            .get(&provider)
            .cloned()
            .ok_or_else(|| ChatHubError::UnknownProvider(provider.as_str().to_string()))
    }
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self::from_config(&ProvidersConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_has_all_vendors() {
        let table = ProviderTable::default();
        for p in Provider::ALL {
            let adapter = table.get(p).unwrap();
            assert_eq!(adapter.id(), p.as_str());
        }
    }

    #[test]
    fn test_empty_table_rejects() {
        let table = ProviderTable::empty();
        assert!(matches!(
            table.get(Provider::OpenAI),
            Err(ChatHubError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_with_replaces_entry() {
        let table = ProviderTable::default().with(
            Provider::OpenAI,
            Arc::new(OpenAIProvider::with_base_url("http://localhost:1".into())),
        );
        assert_eq!(table.get(Provider::OpenAI).unwrap().id(), "openai");
    }
}
