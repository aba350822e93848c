//! Provider registry.
//!
//! Constructs and holds all configured LLM provider instances. At startup
//! the registry reads the [`LlmConfig`], resolves authentication (env vars,
//! direct keys), and instantiates the adapter for each configured provider.

use std::collections::HashMap;
use std::sync::Arc;

use ta_domain::config::{LlmConfig, ProviderKind};
use ta_domain::error::Result;

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    /// Error message with any potential secrets masked.
    pub error: String,
}

/// Holds all instantiated LLM providers plus the default selection and
/// the model-tier shortcuts.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_provider: Option<String>,
    tiers: HashMap<String, String>,
    init_errors: Vec<ProviderInitError>,
}

/// Mask substrings that look like API keys in an error message so raw
/// secrets never reach logs or readiness endpoints.
fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..]);
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    ///
    /// Providers that fail to initialize are logged and recorded rather
    /// than aborting startup; `/health` surfaces them.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        let mut init_errors = Vec::new();

        for pc in &config.providers {
            let result = match pc.kind {
                ProviderKind::OpenaiCompat => OpenAiCompatProvider::from_config(pc)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
            };

            match result {
                Ok(provider) => {
                    tracing::info!(provider_id = %pc.id, model = %pc.default_model, "provider registered");
                    providers.insert(pc.id.clone(), provider);
                }
                Err(e) => {
                    let masked = mask_secrets(&e.to_string());
                    tracing::warn!(provider_id = %pc.id, error = %masked, "provider failed to initialize");
                    init_errors.push(ProviderInitError {
                        provider_id: pc.id.clone(),
                        error: masked,
                    });
                }
            }
        }

        Ok(Self {
            providers,
            default_provider: config.default_provider.clone(),
            tiers: config.tiers.clone(),
            init_errors,
        })
    }

    /// Registry with a single pre-built provider (tests, embedding).
    pub fn single(id: impl Into<String>, provider: Arc<dyn LlmProvider>) -> Self {
        let id = id.into();
        let mut providers = HashMap::new();
        providers.insert(id.clone(), provider);
        Self {
            providers,
            default_provider: Some(id),
            tiers: HashMap::new(),
            init_errors: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(id).cloned()
    }

    /// The default provider: the configured default, else any.
    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        if let Some(id) = &self.default_provider {
            if let Some(p) = self.providers.get(id) {
                return Some(p.clone());
            }
        }
        self.providers.values().next().cloned()
    }

    /// Resolve a model spec: a tier name (`fast|balanced|powerful`) maps
    /// through the tier table, anything else passes through unchanged.
    pub fn resolve_model(&self, spec: &str) -> String {
        self.tiers
            .get(spec)
            .cloned()
            .unwrap_or_else(|| spec.to_string())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;
    use ta_domain::config::ProviderConfig;

    #[test]
    fn failed_providers_are_recorded_not_fatal() {
        let config = LlmConfig {
            providers: vec![ProviderConfig {
                id: "nokey".into(),
                kind: ProviderKind::OpenaiCompat,
                base_url: "https://example.invalid".into(),
                default_model: "m".into(),
                api_key_env: Some("TANDEM_TEST_UNSET_KEY".into()),
                api_key: None,
                timeout_ms: 1000,
            }],
            default_provider: None,
            tiers: HashMap::new(),
        };
        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.init_errors().len(), 1);
        assert_eq!(registry.init_errors()[0].provider_id, "nokey");
    }

    #[test]
    fn tier_resolution_falls_through() {
        let mut tiers = HashMap::new();
        tiers.insert("fast".to_string(), "gpt-4o-mini".to_string());
        let registry = ProviderRegistry {
            providers: HashMap::new(),
            default_provider: None,
            tiers,
            init_errors: Vec::new(),
        };
        assert_eq!(registry.resolve_model("fast"), "gpt-4o-mini");
        assert_eq!(registry.resolve_model("claude-x"), "claude-x");
    }

    #[test]
    fn single_registry_is_its_own_default() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let registry = ProviderRegistry::single("mock", provider);
        assert!(registry.default_provider().is_some());
        assert_eq!(registry.ids(), vec!["mock"]);
    }

    #[test]
    fn mask_hides_long_tokens() {
        let msg = "auth failed for key sk-abcdefghijklmnopqrstuvwxyz123456";
        let masked = mask_secrets(msg);
        assert!(!masked.contains("abcdefghijklmnopqrstuvwxyz"));
        assert!(masked.contains("..."));
    }
}
