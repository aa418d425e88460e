//! Signing capability consumed by the batch builder.
//!
//! The protocol only needs "address + signature over bytes"; [`Ed25519Signer`]
//! is the implementation shipped with the workspace. Its address is the hex
//! encoded verifying key, so a server can check signatures without a lookup.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;
use vend_spec::Address;

/// Errors raised by signers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    /// Key material could not be turned into a key.
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    /// The signer refused or failed to sign.
    #[error("signing failed: {0}")]
    Failed(String),
}

/// Identity able to sign ledger commands.
pub trait Signer: Send + Sync {
    /// Address derived from the key material.
    fn address(&self) -> &str;
    /// Signature over `message`, in the textual form sent to the server.
    fn sign(&self, message: &[u8]) -> Result<String, SigningError>;
}

/// Supported private key formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// Arbitrary passphrase, hashed into a 32 byte secret.
    Seed(String),
    /// 64 hex characters.
    Hex(String),
}

/// Ed25519 signer.
#[derive(Clone)]
pub struct Ed25519Signer {
    key: SigningKey,
    address: Address,
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Ed25519Signer {
    /// Derive a signer from key material.
    pub fn from_material(material: &KeyMaterial) -> Result<Self, SigningError> {
        let secret: [u8; 32] = match material {
            KeyMaterial::Seed(seed) => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(b"vend:seed");
                hasher.update(seed.as_bytes());
                *hasher.finalize().as_bytes()
            }
            KeyMaterial::Hex(encoded) => {
                let bytes = hex::decode(encoded.trim())
                    .map_err(|err| SigningError::InvalidKey(err.to_string()))?;
                bytes.try_into().map_err(|bytes: Vec<u8>| {
                    SigningError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
                })?
            }
        };
        Ok(Self::from_signing_key(SigningKey::from_bytes(&secret)))
    }

    /// Wrap an existing key.
    pub fn from_signing_key(key: SigningKey) -> Self {
        let address = address_for(&key.verifying_key());
        Self { key, address }
    }
}

impl Signer for Ed25519Signer {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, message: &[u8]) -> Result<String, SigningError> {
        Ok(hex::encode(self.key.sign(message).to_bytes()))
    }
}

/// Address for a verifying key.
pub fn address_for(key: &VerifyingKey) -> Address {
    hex::encode(key.to_bytes())
}

/// Check a signature produced by [`Ed25519Signer`] against its address.
pub fn verify(address: &str, message: &[u8], signature: &str) -> bool {
    let key = hex::decode(address)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok());
    let signature = hex::decode(signature)
        .ok()
        .and_then(|bytes| <[u8; 64]>::try_from(bytes).ok())
        .map(|bytes| Signature::from_bytes(&bytes));
    match (key, signature) {
        (Some(key), Some(signature)) => key.verify(message, &signature).is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn seed_derivation_is_stable() {
        let a = Ed25519Signer::from_material(&KeyMaterial::Seed("correct horse".into())).unwrap();
        let b = Ed25519Signer::from_material(&KeyMaterial::Seed("correct horse".into())).unwrap();
        let c = Ed25519Signer::from_material(&KeyMaterial::Seed("battery staple".into())).unwrap();
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
        assert!(vend_spec::is_valid_address(a.address()));
    }

    #[test]
    fn hex_material_must_be_32_bytes() {
        let ok = Ed25519Signer::from_material(&KeyMaterial::Hex("11".repeat(32)));
        assert!(ok.is_ok());
        let short = Ed25519Signer::from_material(&KeyMaterial::Hex("11".repeat(31)));
        assert!(matches!(short, Err(SigningError::InvalidKey(_))));
        let junk = Ed25519Signer::from_material(&KeyMaterial::Hex("zz".repeat(32)));
        assert!(matches!(junk, Err(SigningError::InvalidKey(_))));
    }

    #[test]
    fn signatures_verify_against_address() {
        let signer = Ed25519Signer::from_signing_key(SigningKey::generate(&mut OsRng));
        let sig = signer.sign(b"[0,[\"hi\"]]").unwrap();
        assert!(verify(signer.address(), b"[0,[\"hi\"]]", &sig));
        assert!(!verify(signer.address(), b"[0,[\"ho\"]]", &sig));
    }
}
