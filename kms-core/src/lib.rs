//! Envelope encryption at rest backed by external KMS v2 plugins.

pub mod config;
pub mod crypto;
pub mod errors;
pub mod health;
pub mod plugin;
pub mod registry;
pub mod retry;
pub mod types;

pub use config::{
    EncryptionConfig, HealthConfig, ProviderConfig, ResourceBinding, RetryPolicy,
    SocketAddress, DEFAULT_CACHE_SIZE, DEFAULT_CALL_TIMEOUT,
};
pub use crypto::dek_cache::{CacheKey, DekCache};
pub use crypto::envelope::EnvelopeTransformer;
pub use crypto::Dek;
pub use errors::{Error, Result};
pub use health::{
    AggregateHealth, HealthAggregator, HealthRecord, HealthStatus, HealthTasks, NamedHealth,
};
pub use plugin::{
    DecryptRequest, EncryptResponse, KmsService, PluginClient, StatusResponse, HEALTHZ_OK,
    PLUGIN_API_VERSION,
};
pub use registry::{health_check_name, Provider, ProviderRegistry};
pub use types::{envelope_prefix, EncryptedObject, ENVELOPE_PREFIX};
