//! Signed long-poll session tokens.
//!
//! A token is 16 random bytes, URL-safe base64 encoded. Its signature is the
//! HMAC-SHA256 of the token under the server's secret key base, in the same
//! encoding. Clients echo both on every request.

use super::LongPollError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Token length in raw bytes.
pub const TOKEN_BYTES: usize = 16;

/// Issues and verifies session tokens.
#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
}

impl TokenSigner {
    /// Create a signer keyed with `secret_key_base`.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is empty.
    pub fn new(secret_key_base: &[u8]) -> Result<Self, LongPollError> {
        if secret_key_base.is_empty() {
            return Err(LongPollError::InvalidSecret);
        }
        let mac =
            HmacSha256::new_from_slice(secret_key_base).map_err(|_| LongPollError::InvalidSecret)?;
        Ok(Self { mac })
    }

    /// Generate a fresh `(token, sig)` pair.
    #[must_use]
    pub fn generate(&self) -> (String, String) {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let sig = self.sign(&token);
        (token, sig)
    }

    /// Sign a token.
    #[must_use]
    pub fn sign(&self, token: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(token.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Check a token against its signature in constant time.
    #[must_use]
    pub fn verify(&self, token: &str, sig: &str) -> bool {
        let Ok(sig) = URL_SAFE_NO_PAD.decode(sig) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(token.as_bytes());
        mac.verify_slice(&sig).is_ok()
    }
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}
