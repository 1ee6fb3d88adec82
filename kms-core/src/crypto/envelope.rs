use crate::crypto::dek_cache::DekCache;
use crate::crypto::{self, Dek};
use crate::errors::{Error, Result};
use crate::plugin::{new_uid, with_timeout, DecryptRequest, KmsService};
use crate::types::{envelope_prefix, split_envelope, validate_wrapped, EncryptedObject};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Envelope encryption for a single provider.
///
/// Writes generate a fresh DEK per object, seal the payload with the storage
/// context as associated data and ask the plugin to wrap the DEK. Reads
/// resolve the DEK through the cache before falling back to the plugin.
pub struct EnvelopeTransformer {
    provider: Arc<str>,
    prefix: String,
    service: Arc<dyn KmsService>,
    cache: Arc<DekCache>,
    timeout: Duration,
}

impl EnvelopeTransformer {
    pub fn new(
        provider: impl Into<Arc<str>>,
        service: Arc<dyn KmsService>,
        cache: Arc<DekCache>,
        timeout: Duration,
    ) -> Self {
        let provider = provider.into();
        Self {
            prefix: envelope_prefix(&provider),
            provider,
            service,
            cache,
            timeout,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// `enc:kms:v2:<provider>:`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn cache(&self) -> &DekCache {
        &self.cache
    }

    /// Encrypt `plaintext` bound to `context` and return the prefixed envelope.
    pub async fn transform_to_storage(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let dek = Dek::generate();
        let encrypted_data = crypto::seal(&dek, context, plaintext)
            .map_err(|_| Error::EncryptionFailure("failed to seal payload".into()))?;

        let uid = new_uid();
        let wrapped = with_timeout(
            self.timeout,
            "encrypt",
            self.service.encrypt(&uid, dek.as_bytes()),
        )
        .await
        .map_err(|err| {
            warn!(provider = %self.provider, %uid, error = %err, "dek wrap failed");
            Error::EncryptionFailure(err.to_string())
        })?;
        validate_wrapped(&wrapped.ciphertext, &wrapped.key_id, &wrapped.annotations).map_err(
            |msg| Error::EncryptionFailure(format!("plugin returned an invalid response: {msg}")),
        )?;

        let object = EncryptedObject {
            encrypted_data,
            encrypted_dek: wrapped.ciphertext,
            key_id: wrapped.key_id,
            annotations: wrapped.annotations,
        };
        let body = object.to_bytes()?;

        let mut envelope = Vec::with_capacity(self.prefix.len() + body.len());
        envelope.extend_from_slice(self.prefix.as_bytes());
        envelope.extend_from_slice(&body);
        Ok(envelope)
    }

    /// Decrypt an envelope written by [`Self::transform_to_storage`] under the same `context`.
    pub async fn transform_from_storage(&self, envelope: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let (name, payload) = split_envelope(envelope)?;
        if name != &*self.provider {
            return Err(Error::UnknownProvider(name.to_string()));
        }
        self.open_payload(payload, context).await
    }

    /// Decrypt the bytes following the provider prefix.
    pub(crate) async fn open_payload(&self, payload: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let object = EncryptedObject::from_bytes(payload)?;
        let dek = self.resolve_dek(&object).await?;
        crypto::open(&dek, context, &object.encrypted_data).map_err(|_| Error::IntegrityFailure)
    }

    async fn resolve_dek(&self, object: &EncryptedObject) -> Result<Dek> {
        if let Some(dek) = self.cache.get(&object.encrypted_dek) {
            debug!(provider = %self.provider, key_id = %object.key_id, "dek cache hit");
            return Ok(dek);
        }

        let uid = new_uid();
        debug!(provider = %self.provider, key_id = %object.key_id, %uid, "dek cache miss");
        let request = DecryptRequest {
            ciphertext: object.encrypted_dek.clone(),
            key_id: object.key_id.clone(),
            annotations: object.annotations.clone(),
        };
        let mut plaintext = with_timeout(
            self.timeout,
            "decrypt",
            self.service.decrypt(&uid, &request),
        )
        .await?;
        let dek = Dek::from_slice(&plaintext);
        plaintext.zeroize();
        let dek = dek.ok_or_else(|| Error::malformed("plugin unwrapped a dek of the wrong length"))?;

        self.cache.insert(&object.encrypted_dek, dek.clone());
        Ok(dek)
    }
}
