//! RSA key material for local actors

use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::AppError;

/// PEM-encoded keypair. The private half is PKCS#8, the public half SPKI.
#[derive(Clone)]
pub struct KeyPair {
    pub public_pem: String,
    pub private_pem: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_pem", &self.public_pem)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh RSA keypair of the given modulus size.
///
/// Key generation is CPU bound; async callers should run it on the
/// blocking pool.
pub fn generate_key_pair(bits: usize) -> Result<KeyPair, AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(|e| AppError::Internal(e.into()))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(KeyPair {
        public_pem,
        private_pem,
    })
}

/// Async wrapper around [`generate_key_pair`].
pub async fn generate_key_pair_blocking(bits: usize) -> Result<KeyPair, AppError> {
    tokio::task::spawn_blocking(move || generate_key_pair(bits))
        .await
        .map_err(|e| AppError::Internal(e.into()))?
}

/// Check that a PEM string holds an SPKI public key.
pub fn is_valid_public_key(pem: &str) -> bool {
    RsaPublicKey::from_public_key_pem(pem).is_ok()
}
