//! `X-Matrix` request authentication for the signed federation endpoints.
//!
//! The origin server's ed25519 key signs the canonical JSON of
//! `{method, uri, origin, destination[, content]}`; the receiving server
//! checks it against the keys the origin publishes at `/_matrix/key/v2/server`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{Map, Value};

use crate::FederationError;

pub struct RequestSigner {
    origin: String,
    key_id: String,
    key: SigningKey,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("origin", &self.origin)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// `key_version` is the part after `ed25519:`, e.g. `a_AbCd`.
    pub fn new(origin: impl Into<String>, key_version: &str, seed: [u8; 32]) -> Self {
        Self {
            origin: origin.into(),
            key_id: format!("ed25519:{key_version}"),
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Reads a Synapse-style signing key file: `ed25519 <version> <base64 seed>`.
    /// Only the first key in the file is used.
    pub fn from_key_file(origin: impl Into<String>, contents: &str) -> Result<Self, FederationError> {
        let line = contents
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| FederationError::InvalidKey("signing key file is empty".into()))?;
        let mut parts = line.split_whitespace();
        let (Some(algorithm), Some(version), Some(seed), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(FederationError::InvalidKey(
                "expected `ed25519 <version> <seed>`".into(),
            ));
        };
        if algorithm != "ed25519" {
            return Err(FederationError::InvalidKey(format!(
                "unsupported key algorithm `{algorithm}`"
            )));
        }
        let bytes = STANDARD_NO_PAD
            .decode(seed.trim_end_matches('='))
            .map_err(|err| FederationError::InvalidKey(format!("seed is not base64: {err}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            FederationError::InvalidKey(format!("seed is {} bytes, expected 32", bytes.len()))
        })?;
        Ok(Self::new(origin, version, seed))
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Unpadded base64 public key, as published in `verify_keys`.
    pub fn public_key(&self) -> String {
        STANDARD_NO_PAD.encode(self.key.verifying_key().as_bytes())
    }

    /// The `Authorization` header value for one request. `uri` is the path
    /// and query exactly as sent.
    pub fn authorization(
        &self,
        method: &str,
        uri: &str,
        destination: &str,
        content: Option<&Value>,
    ) -> String {
        let mut request = Map::new();
        request.insert("method".into(), Value::from(method));
        request.insert("uri".into(), Value::from(uri));
        request.insert("origin".into(), Value::from(self.origin.as_str()));
        request.insert("destination".into(), Value::from(destination));
        if let Some(content) = content {
            request.insert("content".into(), content.clone());
        }
        let signature = self.key.sign(&canonical_json(&Value::Object(request)));
        format!(
            "X-Matrix origin=\"{}\",destination=\"{}\",key=\"{}\",sig=\"{}\"",
            self.origin,
            destination,
            self.key_id,
            STANDARD_NO_PAD.encode(signature.to_bytes())
        )
    }
}

/// Matrix canonical JSON: object keys sorted by code point, no insignificant
/// whitespace, UTF-8 left unescaped.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(value, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Serialising a scalar `Value` into a Vec cannot fail.
    let _ = serde_json::to_writer(&mut *out, value);
}
