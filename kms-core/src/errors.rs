use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the envelope pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Write path failed before an envelope could be produced.
    #[error("encryption failed: {0}")]
    EncryptionFailure(String),
    /// Stored bytes do not parse as a KMS v2 envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// The envelope prefix names a provider that is not configured.
    #[error("no kms provider named `{0}` is configured")]
    UnknownProvider(String),
    /// AEAD authentication failed on read.
    #[error("envelope integrity check failed")]
    IntegrityFailure,
    /// Transport, timeout or handshake failure talking to the plugin.
    #[error("kms plugin unavailable: {0}")]
    PluginUnavailable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether a caller may reasonably retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EncryptionFailure(_) | Self::PluginUnavailable(_))
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::PluginUnavailable(message.into())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
