use crate::config::{EncryptionConfig, ProviderConfig};
use crate::crypto::dek_cache::DekCache;
use crate::crypto::envelope::EnvelopeTransformer;
use crate::errors::{Error, Result};
use crate::health::{HealthAggregator, HealthRecord};
use crate::plugin::{KmsService, PluginClient};
use crate::types::split_envelope;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One configured provider and everything it owns.
pub struct Provider {
    config: ProviderConfig,
    health_name: String,
    service: Arc<dyn KmsService>,
    cache: Arc<DekCache>,
    transformer: EnvelopeTransformer,
}

impl Provider {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Health check identifier, `kms-provider-<index>`.
    pub fn health_name(&self) -> &str {
        &self.health_name
    }

    pub fn service(&self) -> &Arc<dyn KmsService> {
        &self.service
    }

    pub fn cache(&self) -> &DekCache {
        &self.cache
    }

    pub fn transformer(&self) -> &EnvelopeTransformer {
        &self.transformer
    }
}

/// Providers in configuration order with resource and prefix routing.
///
/// Built once from configuration and shared by reference; there is no
/// process-wide provider list.
pub struct ProviderRegistry {
    providers: Vec<Provider>,
    by_name: HashMap<String, usize>,
    by_resource: HashMap<String, usize>,
    health: HealthAggregator,
}

impl ProviderRegistry {
    /// Builds the registry with a real [`PluginClient`] per provider.
    pub fn connect(config: &EncryptionConfig) -> Result<Self> {
        let retry = config.retry;
        Self::build(config, |provider| {
            PluginClient::new(provider, retry).map(|client| Arc::new(client) as Arc<dyn KmsService>)
        })
    }

    /// Builds the registry, asking `factory` for exactly one service per provider.
    pub fn build<F>(config: &EncryptionConfig, mut factory: F) -> Result<Self>
    where
        F: FnMut(&ProviderConfig) -> Result<Arc<dyn KmsService>>,
    {
        config.validate()?;

        let mut providers = Vec::with_capacity(config.providers.len());
        let mut by_name = HashMap::new();
        for (index, provider_config) in config.providers.iter().enumerate() {
            let service = factory(provider_config)?;
            let name: Arc<str> = Arc::from(provider_config.name.as_str());
            let cache = Arc::new(match provider_config.cache_size {
                Some(capacity) => DekCache::new(name.clone(), capacity),
                None => DekCache::from_env(name.clone()),
            });
            let transformer = EnvelopeTransformer::new(
                name,
                service.clone(),
                cache.clone(),
                provider_config.timeout,
            );
            info!(
                provider = %provider_config.name,
                endpoint = %provider_config.endpoint,
                cache_size = cache.capacity(),
                "registered kms provider"
            );
            by_name.insert(provider_config.name.clone(), index);
            providers.push(Provider {
                config: provider_config.clone(),
                health_name: health_check_name(index),
                service,
                cache,
                transformer,
            });
        }

        let mut by_resource = HashMap::new();
        for binding in &config.resources {
            let index = by_name[binding.provider.as_str()];
            for resource in &binding.resources {
                by_resource.insert(resource.clone(), index);
            }
        }

        let health = HealthAggregator::new(
            providers
                .iter()
                .map(|p| (p.health_name.clone(), p.name().to_string(), p.service.clone())),
            config.health,
        );

        Ok(Self {
            providers,
            by_name,
            by_resource,
            health,
        })
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.by_name.get(name).map(|&i| &self.providers[i])
    }

    /// Provider that encrypts writes for `resource`.
    pub fn provider_for_resource(&self, resource: &str) -> Result<&Provider> {
        self.by_resource
            .get(resource)
            .map(|&i| &self.providers[i])
            .ok_or_else(|| Error::config(format!("resource `{resource}` has no kms provider")))
    }

    pub fn health(&self) -> &HealthAggregator {
        &self.health
    }

    /// Latest stored health of one provider, looked up by provider name.
    pub fn provider_health(&self, name: &str) -> Option<HealthRecord> {
        let provider = self.provider(name)?;
        self.health.status(provider.health_name())
    }

    /// Encrypt with the provider assigned to `resource`.
    pub async fn transform_to_storage(
        &self,
        resource: &str,
        plaintext: &[u8],
        context: &[u8],
    ) -> Result<Vec<u8>> {
        self.provider_for_resource(resource)?
            .transformer
            .transform_to_storage(plaintext, context)
            .await
    }

    /// Decrypt with whichever provider the envelope prefix names.
    pub async fn transform_from_storage(&self, envelope: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let (name, payload) = split_envelope(envelope)?;
        let provider = self
            .provider(name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
        provider.transformer.open_payload(payload, context).await
    }

    /// Drop every cached DEK of one provider.
    pub fn invalidate_cache(&self, name: &str) -> Result<()> {
        let provider = self
            .provider(name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
        provider.cache.clear();
        info!(provider = %name, "dek cache invalidated");
        Ok(())
    }
}

pub fn health_check_name(index: usize) -> String {
    format!("kms-provider-{index}")
}
