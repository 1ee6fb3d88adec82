//! Newline-delimited JSON frames exchanged with a plugin.

use crate::types::{b64, b64_map};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Frames above this size are rejected by both ends.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub uid: String,
    #[serde(flatten)]
    pub request: PluginRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PluginRequest {
    Status,
    Encrypt {
        #[serde(with = "b64")]
        plaintext: Vec<u8>,
    },
    Decrypt {
        #[serde(with = "b64")]
        ciphertext: Vec<u8>,
        key_id: String,
        #[serde(default, with = "b64_map")]
        annotations: BTreeMap<String, Vec<u8>>,
    },
}

impl PluginRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Encrypt { .. } => "encrypt",
            Self::Decrypt { .. } => "decrypt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    pub fn ok(uid: impl Into<String>, result: &impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            uid: uid.into(),
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    pub fn err(uid: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            result: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptResult {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    #[serde(default, with = "b64_map")]
    pub annotations: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptResult {
    #[serde(with = "b64")]
    pub plaintext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub version: String,
    pub healthz: String,
    pub key_id: String,
}
