use super::{error::ProviderError, ChatProvider, OpenAIProvider, ProviderConfig};
use std::sync::Arc;

/// A configured provider and its client
#[derive(Clone)]
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub provider: Arc<dyn ChatProvider>,
}

/// Provider registry holding every configured provider in priority order.
///
/// Disabled providers are kept so they can be listed; the router skips them.
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
}

impl ProviderRegistry {
    /// Build from already-constructed providers, sorting by ascending priority.
    /// Equal priorities keep their configured order.
    pub fn new(mut entries: Vec<ProviderEntry>) -> Self {
        entries.sort_by_key(|e| e.config.priority);
        Self { entries }
    }

    /// Load providers from configuration
    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self, ProviderError> {
        let mut entries = Vec::with_capacity(configs.len());

        for config in configs {
            let provider = OpenAIProvider::from_config(config)?;
            tracing::debug!(
                provider = %config.name,
                priority = config.priority,
                enabled = config.is_enabled(),
                "Registered provider"
            );
            entries.push(ProviderEntry {
                config: config.clone(),
                provider: Arc::new(provider),
            });
        }

        Ok(Self::new(entries))
    }

    /// All providers, ascending priority
    pub fn entries(&self) -> &[ProviderEntry] {
        &self.entries
    }

    /// Enabled providers, ascending priority
    pub fn enabled(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.entries.iter().filter(|e| e.config.is_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, priority: u32, enabled: bool) -> ProviderConfig {
        let mut config = ProviderConfig::new(name, "http://localhost:1/v1");
        config.priority = priority;
        config.enabled = Some(enabled);
        config
    }

    fn names(registry: &ProviderRegistry) -> Vec<&str> {
        registry.entries().iter().map(|e| e.config.name.as_str()).collect()
    }

    #[test]
    fn test_empty_registry() {
        let registry = ProviderRegistry::from_configs(&[]).unwrap();
        assert!(registry.entries().is_empty());
    }

    #[test]
    fn test_priority_order_is_stable() {
        let registry = ProviderRegistry::from_configs(&[
            config("late", 20, true),
            config("first", 10, true),
            config("second", 10, true),
        ])
        .unwrap();

        assert_eq!(names(&registry), vec!["first", "second", "late"]);
    }

    #[test]
    fn test_disabled_providers_listed_but_not_enabled() {
        let registry =
            ProviderRegistry::from_configs(&[config("on", 1, true), config("off", 2, false)]).unwrap();

        assert_eq!(names(&registry), vec!["on", "off"]);
        let enabled: Vec<&str> = registry.enabled().map(|e| e.config.name.as_str()).collect();
        assert_eq!(enabled, vec!["on"]);
    }
}
