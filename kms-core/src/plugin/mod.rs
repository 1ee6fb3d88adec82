//! Client side of the KMS v2 plugin protocol.

pub mod client;
pub mod wire;

use crate::errors::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use client::PluginClient;

/// Plugin API version this client speaks.
pub const PLUGIN_API_VERSION: &str = "v2";
/// `healthz` value a plugin reports when it can serve requests.
pub const HEALTHZ_OK: &str = "ok";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptResponse {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub annotations: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptRequest {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub annotations: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub version: String,
    pub healthz: String,
    pub key_id: String,
}

impl StatusResponse {
    pub fn is_compatible(&self) -> bool {
        self.version == PLUGIN_API_VERSION
    }

    pub fn is_healthy(&self) -> bool {
        self.is_compatible() && self.healthz == HEALTHZ_OK
    }
}

/// Capabilities of a KMS v2 plugin. `uid` correlates one call end to end.
#[async_trait]
pub trait KmsService: Send + Sync {
    /// Wrap a plaintext DEK under the plugin's current KEK.
    async fn encrypt(&self, uid: &str, plaintext: &[u8]) -> Result<EncryptResponse>;

    /// Unwrap a DEK previously returned by [`KmsService::encrypt`].
    async fn decrypt(&self, uid: &str, request: &DecryptRequest) -> Result<Vec<u8>>;

    async fn status(&self, uid: &str) -> Result<StatusResponse>;
}

#[async_trait]
impl<T> KmsService for Arc<T>
where
    T: KmsService + ?Sized,
{
    async fn encrypt(&self, uid: &str, plaintext: &[u8]) -> Result<EncryptResponse> {
        (**self).encrypt(uid, plaintext).await
    }

    async fn decrypt(&self, uid: &str, request: &DecryptRequest) -> Result<Vec<u8>> {
        (**self).decrypt(uid, request).await
    }

    async fn status(&self, uid: &str) -> Result<StatusResponse> {
        (**self).status(uid).await
    }
}

/// Fresh correlation identifier for one plugin call.
pub fn new_uid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Bound a plugin call; dropping the inner future cancels it.
pub async fn with_timeout<T, F>(timeout: Duration, method: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::unavailable(format!(
            "{method} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
