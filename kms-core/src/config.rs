//! Configuration handed over by the embedding process.
//!
//! Nothing here reads files; the collaborator deserializes or builds these
//! structs and passes them to [`crate::ProviderRegistry`].

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_SIZE: usize = 1000;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

const HEALTH_INTERVAL_ENV: &str = "KMS_HEALTH_INTERVAL_MS";
const HEALTH_TIMEOUT_ENV: &str = "KMS_HEALTH_TIMEOUT_MS";

/// One configured KMS v2 provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// `unix:///absolute/path.sock`, or `unix:///@name` for a Linux
    /// abstract socket.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<usize>,
    #[serde(default = "default_timeout", with = "millis")]
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            cache_size: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = Some(size);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size.unwrap_or(DEFAULT_CACHE_SIZE)
    }

    /// Address of the plugin socket.
    pub fn socket_address(&self) -> Result<SocketAddress> {
        SocketAddress::parse(&self.endpoint)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("provider name must not be empty"));
        }
        if self.name.contains(':') {
            return Err(Error::config(format!(
                "provider name `{}` must not contain `:`",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::config(format!(
                "provider `{}` timeout must be positive",
                self.name
            )));
        }
        if self.cache_size == Some(0) {
            return Err(Error::config(format!(
                "provider `{}` cache size must be positive",
                self.name
            )));
        }
        self.socket_address().map(|_| ())
    }
}

/// Where a plugin listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Path(PathBuf),
    /// Linux abstract namespace name, without the leading `@`.
    Abstract(String),
}

impl SocketAddress {
    /// Parses `unix:///abs/path`, `unix:///@name` or `unix://@name`.
    pub fn parse(endpoint: &str) -> Result<Self> {
        let rest = endpoint
            .strip_prefix("unix://")
            .ok_or_else(|| Error::config(format!("endpoint `{endpoint}` must use the unix:// scheme")))?;
        let abstract_name = rest.strip_prefix('/').unwrap_or(rest).strip_prefix('@');
        if let Some(name) = abstract_name {
            if name.is_empty() {
                return Err(Error::config(format!(
                    "endpoint `{endpoint}` names an empty abstract socket"
                )));
            }
            if !cfg!(target_os = "linux") {
                return Err(Error::config(format!(
                    "endpoint `{endpoint}`: abstract sockets are only available on linux"
                )));
            }
            return Ok(Self::Abstract(name.to_string()));
        }

        let path = PathBuf::from(rest);
        if !path.is_absolute() {
            return Err(Error::config(format!(
                "endpoint `{endpoint}` must name an absolute socket path"
            )));
        }
        Ok(Self::Path(path))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Abstract(name) => write!(f, "@{name}"),
        }
    }
}

/// Assigns resources to the provider that encrypts their writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBinding {
    pub resources: Vec<String>,
    pub provider: String,
}

/// Bounded retry used when (re)establishing a plugin connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(with = "millis")]
    pub interval: Duration,
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
    }
}

impl HealthConfig {
    /// Defaults overridden by `KMS_HEALTH_INTERVAL_MS` / `KMS_HEALTH_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: env_millis(HEALTH_INTERVAL_ENV).unwrap_or(defaults.interval),
            timeout: env_millis(HEALTH_TIMEOUT_ENV).unwrap_or(defaults.timeout),
        }
    }
}

/// Everything needed to build a [`crate::ProviderRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceBinding>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub health: HealthConfig,
}

impl EncryptionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::config("at least one kms provider is required"));
        }
        let mut names = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !names.insert(provider.name.as_str()) {
                return Err(Error::config(format!(
                    "provider name `{}` is configured more than once",
                    provider.name
                )));
            }
        }

        let mut bound = HashSet::new();
        for binding in &self.resources {
            if !names.contains(binding.provider.as_str()) {
                return Err(Error::config(format!(
                    "resources {:?} reference unknown provider `{}`",
                    binding.resources, binding.provider
                )));
            }
            for resource in &binding.resources {
                if !bound.insert(resource.as_str()) {
                    return Err(Error::config(format!(
                        "resource `{resource}` is bound more than once"
                    )));
                }
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.health.interval.is_zero() || self.health.timeout.is_zero() {
            return Err(Error::config("health interval and timeout must be positive"));
        }
        Ok(())
    }
}

fn default_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> ProviderConfig {
        ProviderConfig::new(name, format!("unix:///tmp/{name}.sock"))
    }

    fn config(providers: Vec<ProviderConfig>) -> EncryptionConfig {
        EncryptionConfig {
            providers,
            ..EncryptionConfig::default()
        }
    }

    #[test]
    fn accepts_minimal_config() {
        let cfg = config(vec![provider("kms-provider")]);
        cfg.validate().expect("valid");
        assert_eq!(cfg.providers[0].cache_size(), DEFAULT_CACHE_SIZE);
        assert_eq!(
            cfg.providers[0].socket_address().unwrap(),
            SocketAddress::Path(PathBuf::from("/tmp/kms-provider.sock"))
        );
    }

    #[test]
    fn at_sign_selects_the_abstract_namespace() {
        let parsed = SocketAddress::parse("unix:///@kms-provider.sock");
        let short = SocketAddress::parse("unix://@kms-provider.sock");
        if cfg!(target_os = "linux") {
            let expected = SocketAddress::Abstract("kms-provider.sock".into());
            assert_eq!(parsed.unwrap(), expected);
            assert_eq!(short.unwrap(), expected);
            assert_eq!(expected.to_string(), "@kms-provider.sock");
        } else {
            assert!(matches!(parsed, Err(Error::InvalidConfig(_))));
        }
        assert!(matches!(
            SocketAddress::parse("unix:///@"),
            Err(Error::InvalidConfig(_))
        ));
        // `@` only counts as the first character of the name.
        assert_eq!(
            SocketAddress::parse("unix:///run/@kms.sock").unwrap(),
            SocketAddress::Path(PathBuf::from("/run/@kms.sock"))
        );
    }

    #[test]
    fn rejects_bad_names_and_endpoints() {
        assert!(config(vec![provider("a:b")]).validate().is_err());
        assert!(config(vec![provider("")]).validate().is_err());
        assert!(config(vec![provider("a"), provider("a")]).validate().is_err());
        assert!(config(vec![ProviderConfig::new("a", "tcp://127.0.0.1:1")])
            .validate()
            .is_err());
        assert!(config(vec![ProviderConfig::new("a", "unix://relative.sock")])
            .validate()
            .is_err());
        assert!(config(vec![provider("a").with_cache_size(0)])
            .validate()
            .is_err());
    }

    #[test]
    fn bindings_must_reference_known_providers() {
        let mut cfg = config(vec![provider("a")]);
        cfg.resources.push(ResourceBinding {
            resources: vec!["secrets".into()],
            provider: "missing".into(),
        });
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: EncryptionConfig = serde_json::from_value(serde_json::json!({
            "providers": [
                {"name": "kms-provider", "endpoint": "unix:///run/kms.sock", "cache_size": 1000}
            ],
            "resources": [{"resources": ["secrets"], "provider": "kms-provider"}]
        }))
        .expect("deserialize");
        assert_eq!(cfg.providers[0].timeout, DEFAULT_CALL_TIMEOUT);
        assert_eq!(cfg.retry, RetryPolicy::default());
        cfg.validate().expect("valid");
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(1_000), policy.max_delay);
    }
}
