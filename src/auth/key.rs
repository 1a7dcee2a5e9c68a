//! Transport-independent representation of a client's public key.
//!
//! The core never touches `russh_keys` types directly: the SSH layer converts
//! the negotiated key into a [`ClientKey`] once, and the backend policy and
//! the access log work from that.

use std::fmt;

use anyhow::{Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};

/// A public key as presented by a client, identified by algorithm and the
/// base64-encoded wire blob.  Comments are not part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    algorithm: String,
    blob_b64: String,
}

impl ClientKey {
    /// Parse an `authorized_keys` style line: `<algorithm> <base64> [comment]`.
    pub fn parse_authorized(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let algorithm = parts.next().context("empty public key line")?;
        let blob_b64 = parts
            .next()
            .with_context(|| format!("public key line has no key data: {line:?}"))?;

        base64::engine::general_purpose::STANDARD
            .decode(blob_b64.as_bytes())
            .with_context(|| format!("public key data is not valid base64: {line:?}"))?;

        Ok(Self {
            algorithm: algorithm.to_string(),
            blob_b64: blob_b64.to_string(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// SHA-256 fingerprint in the `ssh-keygen -l` format (`SHA256:<b64>`).
    pub fn fingerprint(&self) -> String {
        let blob = base64::engine::general_purpose::STANDARD
            .decode(self.blob_b64.as_bytes())
            .unwrap_or_default();
        let hash = Sha256::digest(&blob);
        let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
        format!("SHA256:{encoded}")
    }
}

impl From<&PublicKey> for ClientKey {
    fn from(key: &PublicKey) -> Self {
        Self {
            algorithm: key.name().to_string(),
            blob_b64: key.public_key_base64(),
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.blob_b64)
    }
}
