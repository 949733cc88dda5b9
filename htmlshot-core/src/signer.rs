//! HMAC-SHA256 signing of canonical queries, and API key hashing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a raw HMAC-SHA256 tag.
const SIGNATURE_LEN: usize = 32;

/// Signs and verifies canonical query strings with a process-wide secret.
///
/// The keyed MAC state is built once from the secret; the secret itself is
/// never retained in a form that can be logged.
#[derive(Clone)]
pub struct Signer {
    keyed: HmacSha256,
    secret_len: usize,
}

impl Signer {
    /// Create a signer.
    ///
    /// # Errors
    /// Returns `ConfigError::MissingRequired` if the secret is empty.
    pub fn new(secret: &SecretString) -> Result<Self, ConfigError> {
        let raw = secret.expose_secret();
        if raw.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "signing_secret".to_string(),
            });
        }
        let keyed =
            HmacSha256::new_from_slice(raw.as_bytes()).map_err(|e| ConfigError::InvalidValue {
                field: "signing_secret".to_string(),
                value: "[REDACTED]".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            keyed,
            secret_len: raw.len(),
        })
    }

    /// `base64url(HMAC-SHA256(secret, canonical))`, unpadded.
    pub fn sign(&self, canonical: &str) -> String {
        let mut mac = self.keyed.clone();
        mac.update(canonical.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Constant-time verification. Malformed or wrong-length signatures are
    /// simply `false`.
    pub fn verify(&self, canonical: &str, signature: &str) -> bool {
        let Ok(expected) = URL_SAFE_NO_PAD.decode(signature.trim()) else {
            return false;
        };
        if expected.len() != SIGNATURE_LEN {
            return false;
        }
        let mut mac = self.keyed.clone();
        mac.update(canonical.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signer([REDACTED, {} chars])", self.secret_len)
    }
}

/// Lowercase hex SHA-256 of a bearer token; the replica's `keyHash`.
pub fn hash_api_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}
