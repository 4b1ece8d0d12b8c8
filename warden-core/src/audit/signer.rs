//! Deployment signing key for audit entries, playbooks and approvals

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use std::fmt;

/// Ed25519 signing key held by the deployment
#[derive(Clone)]
pub struct AuditSigner {
    signing_key: SigningKey,
}

impl fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditSigner")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

impl AuditSigner {
    /// Fresh random key
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a hex-encoded 32-byte seed (surrounding whitespace ignored)
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim()).context("signing key is not valid hex")?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("signing key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Hex-encoded signature over `message`
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    pub fn verifier(&self) -> AuditVerifier {
        AuditVerifier {
            verifying_key: self.signing_key.verifying_key(),
        }
    }
}

/// Public half of the deployment key
#[derive(Debug, Clone)]
pub struct AuditVerifier {
    verifying_key: VerifyingKey,
}

impl AuditVerifier {
    pub fn from_public_key_hex(public_hex: &str) -> Result<Self> {
        let bytes = hex::decode(public_hex.trim()).context("public key is not valid hex")?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("public key must be 32 bytes, got {}", bytes.len()))?;
        let verifying_key = VerifyingKey::from_bytes(&key).context("invalid Ed25519 public key")?;
        Ok(Self { verifying_key })
    }

    /// Whether `signature_hex` is a valid signature over `message`
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&bytes);
        self.verifying_key.verify(message, &signature).is_ok()
    }
}
