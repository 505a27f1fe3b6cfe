//! Maps the configured provider kinds to adapter instances.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use relay_core::{ImageProviderKind, ProviderKind, UserConfig};

use crate::anthropic::AnthropicProvider;
use crate::openai::{AzureProvider, OpenAiProvider};
use crate::provider::{ChatProvider, ImageProvider, ProviderError};
use crate::workers::WorkersProvider;

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    chat: HashMap<ProviderKind, Arc<dyn ChatProvider>>,
    image: HashMap<ImageProviderKind, Arc<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter sharing one HTTP client.
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let openai = Arc::new(OpenAiProvider::new(client.clone()));
        let azure = Arc::new(AzureProvider::new(client.clone()));
        let workers = Arc::new(WorkersProvider::new(client.clone()));
        let anthropic = Arc::new(AnthropicProvider::new(client));

        let mut registry = Self::new();
        registry.register_chat(openai.clone());
        registry.register_chat(azure.clone());
        registry.register_chat(workers.clone());
        registry.register_chat(anthropic);
        registry.register_image(openai);
        registry.register_image(azure);
        registry.register_image(workers);
        registry
    }

    /// Add or replace the adapter for `provider.kind()`.
    pub fn register_chat(&mut self, provider: Arc<dyn ChatProvider>) {
        self.chat.insert(provider.kind(), provider);
    }

    pub fn register_image(&mut self, provider: Arc<dyn ImageProvider>) {
        self.image.insert(provider.kind(), provider);
    }

    /// The chat adapter `config.ai_provider` names, if it has credentials.
    pub fn chat(&self, config: &UserConfig) -> Result<Arc<dyn ChatProvider>, ProviderError> {
        let kind = config.ai_provider;
        match self.chat.get(&kind) {
            Some(p) if p.is_enabled(config) => Ok(p.clone()),
            Some(_) => {
                debug!(provider = %kind, "chat provider has no credentials");
                Err(ProviderError::NotEnabled(kind.to_string()))
            }
            None => Err(ProviderError::NotEnabled(kind.to_string())),
        }
    }

    pub fn image(&self, config: &UserConfig) -> Result<Arc<dyn ImageProvider>, ProviderError> {
        let kind = config.ai_image_provider;
        match self.image.get(&kind) {
            Some(p) if p.is_enabled(config) => Ok(p.clone()),
            _ => Err(ProviderError::NotEnabled(kind.to_string())),
        }
    }

    /// Kinds whose credentials are present in `config`, for status output.
    pub fn enabled_chat_kinds(&self, config: &UserConfig) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self
            .chat
            .iter()
            .filter(|(_, p)| p.is_enabled(config))
            .map(|(k, _)| *k)
            .collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_configured_kind_when_enabled() {
        let registry = ProviderRegistry::with_defaults(reqwest::Client::new());
        let mut cfg = UserConfig {
            ai_provider: ProviderKind::Workers,
            ..UserConfig::default()
        };
        assert!(matches!(
            registry.chat(&cfg),
            Err(ProviderError::NotEnabled(ref k)) if k == "workers"
        ));

        cfg.cloudflare_account_id = Some("acc".into());
        cfg.cloudflare_token = Some("tok".into());
        assert_eq!(registry.chat(&cfg).unwrap().kind(), ProviderKind::Workers);
        // credentials for another provider do not change the selection
        cfg.openai_api_key = vec!["sk".into()];
        assert_eq!(registry.chat(&cfg).unwrap().kind(), ProviderKind::Workers);
    }

    #[test]
    fn empty_registry_enables_nothing() {
        let registry = ProviderRegistry::new();
        let cfg = UserConfig {
            openai_api_key: vec!["sk".into()],
            ..UserConfig::default()
        };
        assert!(registry.chat(&cfg).is_err());
        assert!(registry.image(&cfg).is_err());
    }

    #[test]
    fn lists_enabled_kinds() {
        let registry = ProviderRegistry::with_defaults(reqwest::Client::new());
        let cfg = UserConfig {
            openai_api_key: vec!["sk".into()],
            anthropic_api_key: Some("ak".into()),
            ..UserConfig::default()
        };
        assert_eq!(
            registry.enabled_chat_kinds(&cfg),
            vec![ProviderKind::Anthropic, ProviderKind::OpenAi]
        );
        assert_eq!(
            registry.image(&cfg).unwrap().kind(),
            ImageProviderKind::OpenAi
        );
    }
}
