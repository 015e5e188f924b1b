//! Actor key provisioning
//!
//! Every local actor owns one RSA key pair. The public half is published in
//! the actor document; the private half is sealed by a [`KeyVault`] the
//! moment it is generated and only unsealed inside the signing path.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use rand::RngCore;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::KeyConfig;
use crate::error::AppError;

const AES_256_KEY_BYTES: usize = 32;
const AES_GCM_NONCE_BYTES: usize = 12;

/// Seals and unseals private key material
pub trait KeyVault: Send + Sync {
    /// Encrypt `plaintext`, returning a printable ciphertext
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, AppError>;

    /// Reverse of [`KeyVault::encrypt`]
    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>, AppError>;
}

/// AES-256-GCM vault keyed from configuration
///
/// Ciphertext layout: `base64(nonce || ciphertext || tag)`.
pub struct AesGcmKeyVault {
    cipher: Aes256Gcm,
}

impl AesGcmKeyVault {
    pub fn new(key: &[u8]) -> Result<Self, AppError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            AppError::Config(format!(
                "vault key must be {} bytes",
                AES_256_KEY_BYTES
            ))
        })?;
        Ok(Self { cipher })
    }

    /// Build from `keys.vault_key` (base64, 32 bytes)
    pub fn from_config(config: &KeyConfig) -> Result<Self, AppError> {
        let raw_key = config.vault_key.trim();
        if raw_key.is_empty() {
            return Err(AppError::Config("keys.vault_key is required".to_string()));
        }

        let key = Zeroizing::new(BASE64_STANDARD.decode(raw_key).map_err(|_| {
            AppError::Config("keys.vault_key must be valid base64-encoded bytes".to_string())
        })?);
        if key.len() != AES_256_KEY_BYTES {
            return Err(AppError::Config(format!(
                "keys.vault_key must decode to {} bytes",
                AES_256_KEY_BYTES
            )));
        }

        Self::new(&key)
    }
}

impl KeyVault for AesGcmKeyVault {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, AppError> {
        let mut nonce = [0_u8; AES_GCM_NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AppError::Encryption("key sealing failed".to_string()))?;

        let mut out = Vec::with_capacity(AES_GCM_NONCE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Zeroizing<Vec<u8>>, AppError> {
        let data = BASE64_STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| AppError::Encryption("sealed key is not valid base64".to_string()))?;
        if data.len() <= AES_GCM_NONCE_BYTES {
            return Err(AppError::Encryption("sealed key is too short".to_string()));
        }

        let (nonce, sealed) = data.split_at(AES_GCM_NONCE_BYTES);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map(Zeroizing::new)
            .map_err(|_| AppError::Encryption("key unsealing failed".to_string()))
    }
}

/// Freshly provisioned key pair, private half already sealed
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// SPKI PEM
    pub public_key_pem: String,
    /// Vault ciphertext of the PKCS#8 PEM
    pub encrypted_private_key_pem: String,
}

/// Generate an RSA key pair and seal the private half immediately
///
/// CPU-bound; run it off the async executor.
pub fn generate_key_pair(vault: &dyn KeyVault, bits: usize) -> Result<KeyPair, AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Encryption(format!("RSA key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Encryption(format!("private key encoding failed: {}", e)))?;
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Encryption(format!("public key encoding failed: {}", e)))?;

    let encrypted_private_key_pem = vault.encrypt(private_key_pem.as_bytes())?;

    Ok(KeyPair {
        public_key_pem,
        encrypted_private_key_pem,
    })
}

/// Unseal a stored private key for signing
pub fn unseal_private_key(
    vault: &dyn KeyVault,
    encrypted_private_key_pem: &str,
) -> Result<Zeroizing<String>, AppError> {
    let bytes = vault.decrypt(encrypted_private_key_pem)?;
    let pem = std::str::from_utf8(&bytes)
        .map_err(|_| AppError::Encryption("unsealed key is not UTF-8".to_string()))?;
    Ok(Zeroizing::new(pem.to_string()))
}

/// `publicKey` block of an actor document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyBlock {
    pub id: String,
    pub owner: String,
    pub public_key_pem: String,
}

impl PublicKeyBlock {
    pub fn for_actor(actor_url: &str, public_key_pem: &str) -> Self {
        Self {
            id: main_key_id(actor_url),
            owner: actor_url.to_string(),
            public_key_pem: public_key_pem.to_string(),
        }
    }
}

/// `keyId` of an actor's signing key
pub fn main_key_id(actor_url: &str) -> String {
    format!("{}#main-key", actor_url)
}
