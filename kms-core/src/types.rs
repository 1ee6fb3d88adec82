use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Leading tag shared by every KMS v2 envelope.
pub const ENVELOPE_PREFIX: &str = "enc:kms:v2:";

pub(crate) const MAX_KEY_ID_LEN: usize = 1024;
pub(crate) const MAX_ENCRYPTED_DEK_LEN: usize = 1024;
pub(crate) const MAX_ANNOTATIONS_LEN: usize = 32 * 1024;

/// Storage prefix for a provider, e.g. `enc:kms:v2:kms-provider:`.
pub fn envelope_prefix(provider: &str) -> String {
    format!("{ENVELOPE_PREFIX}{provider}:")
}

/// Splits `enc:kms:v2:<provider>:<payload>` into the provider name and payload.
pub fn split_envelope(envelope: &[u8]) -> Result<(&str, &[u8])> {
    let rest = envelope
        .strip_prefix(ENVELOPE_PREFIX.as_bytes())
        .ok_or_else(|| Error::malformed("missing kms v2 prefix"))?;
    let sep = rest
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| Error::malformed("prefix is missing the provider terminator"))?;
    let (name, payload) = rest.split_at(sep);
    let name = std::str::from_utf8(name)
        .map_err(|_| Error::malformed("provider name is not utf-8"))?;
    if name.is_empty() {
        return Err(Error::malformed("provider name is empty"));
    }
    Ok((name, &payload[1..]))
}

/// Serialized body of an envelope, stored after the provider prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedObject {
    #[serde(with = "b64")]
    pub encrypted_data: Vec<u8>,
    #[serde(with = "b64")]
    pub encrypted_dek: Vec<u8>,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", with = "b64_map")]
    pub annotations: BTreeMap<String, Vec<u8>>,
}

impl EncryptedObject {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| Error::EncryptionFailure(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let object: Self =
            serde_json::from_slice(bytes).map_err(|err| Error::malformed(err.to_string()))?;
        if object.encrypted_data.is_empty() {
            return Err(Error::malformed("encrypted data is empty"));
        }
        validate_wrapped(&object.encrypted_dek, &object.key_id, &object.annotations)
            .map_err(Error::MalformedEnvelope)?;
        Ok(object)
    }
}

/// Limits shared by plugin responses and parsed envelopes.
pub(crate) fn validate_wrapped(
    encrypted_dek: &[u8],
    key_id: &str,
    annotations: &BTreeMap<String, Vec<u8>>,
) -> std::result::Result<(), String> {
    if encrypted_dek.is_empty() {
        return Err("encrypted dek is empty".into());
    }
    if encrypted_dek.len() > MAX_ENCRYPTED_DEK_LEN {
        return Err(format!(
            "encrypted dek is {} bytes, limit is {MAX_ENCRYPTED_DEK_LEN}",
            encrypted_dek.len()
        ));
    }
    if key_id.is_empty() {
        return Err("key id is empty".into());
    }
    if key_id.len() > MAX_KEY_ID_LEN {
        return Err(format!(
            "key id is {} bytes, limit is {MAX_KEY_ID_LEN}",
            key_id.len()
        ));
    }

    let mut total = 0usize;
    for (key, value) in annotations {
        if !is_fully_qualified_domain(key) {
            return Err(format!("annotation key `{key}` is not a fully qualified domain name"));
        }
        total += key.len() + value.len();
    }
    if total > MAX_ANNOTATIONS_LEN {
        return Err(format!(
            "annotations total {total} bytes, limit is {MAX_ANNOTATIONS_LEN}"
        ));
    }
    Ok(())
}

fn is_fully_qualified_domain(value: &str) -> bool {
    if value.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = value.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        })
}

pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod b64_map {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &STANDARD.encode(value))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, value)| {
                STANDARD
                    .decode(value)
                    .map(|bytes| (key, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptedObject {
        EncryptedObject {
            encrypted_data: vec![1, 2, 3],
            encrypted_dek: vec![9; 48],
            key_id: "key-1".into(),
            annotations: BTreeMap::from([("tag.kms.example.io".to_string(), b"v".to_vec())]),
        }
    }

    #[test]
    fn splits_provider_and_payload() {
        let mut envelope = envelope_prefix("kms-provider").into_bytes();
        envelope.extend_from_slice(b"{\"a\":1}");
        let (name, payload) = split_envelope(&envelope).expect("split");
        assert_eq!(name, "kms-provider");
        assert_eq!(payload, b"{\"a\":1}");
    }

    #[test]
    fn rejects_foreign_prefixes() {
        assert!(matches!(
            split_envelope(b"enc:aescbc:v1:key1:xxxx"),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            split_envelope(b"enc:kms:v2:no-terminator"),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            split_envelope(b"enc:kms:v2::payload"),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn encoded_object_is_stable() {
        let object = sample();
        let bytes = object.to_bytes().expect("encode");
        let decoded = EncryptedObject::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, object);
        assert_eq!(decoded.to_bytes().expect("re-encode"), bytes);
    }

    #[test]
    fn parse_enforces_limits() {
        let mut object = sample();
        object.key_id = "k".repeat(MAX_KEY_ID_LEN + 1);
        let bytes = serde_json::to_vec(&object).unwrap();
        assert!(matches!(
            EncryptedObject::from_bytes(&bytes),
            Err(Error::MalformedEnvelope(_))
        ));

        let mut object = sample();
        object
            .annotations
            .insert("NotADomain".into(), b"x".to_vec());
        let bytes = serde_json::to_vec(&object).unwrap();
        assert!(matches!(
            EncryptedObject::from_bytes(&bytes),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            EncryptedObject::from_bytes(b"not json"),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn domain_names() {
        assert!(is_fully_qualified_domain("key.example.com"));
        assert!(!is_fully_qualified_domain("example"));
        assert!(!is_fully_qualified_domain("-bad.example.com"));
        assert!(!is_fully_qualified_domain("UPPER.example.com"));
    }
}
