//! Protection Tokens
//!
//! A protection token wraps the key material that signs and verifies
//! protected log rows. Tokens are supplied by the key-management
//! collaborator; this module defines the seam and the ECDSA implementation.

use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProtectedLogError;

/// Identifier of the no-op token attached to rows written on the shutdown
/// fallback path.
pub const UNPROTECTED_TOKEN_IDENTIFIER: &str = "none";

/// Contract between the log and the key-management collaborator.
pub trait ProtectionToken: Send + Sync {
    fn identifier(&self) -> &str;

    fn protection_algorithm(&self) -> &str;

    /// Sign the canonical bytes of a row.
    fn protect(&self, data: &[u8]) -> Result<Vec<u8>, ProtectedLogError>;

    /// Verify a signature produced by `protect`. `Ok(false)` means the
    /// signature does not match; `Err` means verification itself failed.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, ProtectedLogError>;
}

/// ECDSA (secp256k1) protection token signing the SHA-256 digest of the
/// canonical row bytes.
pub struct EcdsaToken {
    identifier: String,
    secp: Secp256k1<secp256k1::All>,
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl EcdsaToken {
    pub fn new(identifier: String, secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            identifier,
            secp,
            secret_key,
            public_key,
        }
    }

    /// Generate a fresh keypair-backed token.
    pub fn generate(identifier: String) -> Self {
        use secp256k1::rand::rngs::OsRng;
        let mut rng = OsRng;
        let secret_key = SecretKey::new(&mut rng);
        Self::new(identifier, secret_key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn message_for(&self, data: &[u8]) -> Result<secp256k1::Message, ProtectedLogError> {
        let digest = Sha256::digest(data);
        secp256k1::Message::from_digest_slice(&digest)
            .map_err(|e| ProtectedLogError::CryptoError(format!("Invalid message hash: {}", e)))
    }
}

impl ProtectionToken for EcdsaToken {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn protection_algorithm(&self) -> &str {
        "SHA256withECDSA"
    }

    fn protect(&self, data: &[u8]) -> Result<Vec<u8>, ProtectedLogError> {
        let message = self.message_for(data)?;
        let signature = self.secp.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_der().to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool, ProtectedLogError> {
        let message = self.message_for(data)?;
        let signature = Signature::from_der(signature)
            .map_err(|e| ProtectedLogError::CryptoError(format!("Invalid signature: {}", e)))?;
        match self.secp.verify_ecdsa(&message, &signature, &self.public_key) {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// No-op token used when rows cannot be individually protected, such as on
/// the shutdown fallback path.
pub struct UnprotectedToken;

impl ProtectionToken for UnprotectedToken {
    fn identifier(&self) -> &str {
        UNPROTECTED_TOKEN_IDENTIFIER
    }

    fn protection_algorithm(&self) -> &str {
        "none"
    }

    fn protect(&self, _data: &[u8]) -> Result<Vec<u8>, ProtectedLogError> {
        Err(ProtectedLogError::CryptoError(
            "Unprotected token cannot sign".to_string(),
        ))
    }

    fn verify(&self, _data: &[u8], _signature: &[u8]) -> Result<bool, ProtectedLogError> {
        Ok(false)
    }
}

/// Lookup of available protection tokens by key identifier, plus the token
/// currently used for new rows.
pub struct TokenRegistry {
    current: Arc<dyn ProtectionToken>,
    tokens: HashMap<String, Arc<dyn ProtectionToken>>,
}

impl TokenRegistry {
    pub fn new(current: Arc<dyn ProtectionToken>) -> Self {
        let mut tokens: HashMap<String, Arc<dyn ProtectionToken>> = HashMap::new();
        tokens.insert(current.identifier().to_string(), current.clone());
        Self { current, tokens }
    }

    pub fn register(&mut self, token: Arc<dyn ProtectionToken>) {
        self.tokens.insert(token.identifier().to_string(), token);
    }

    /// The token new rows are signed with.
    pub fn current(&self) -> Arc<dyn ProtectionToken> {
        self.current.clone()
    }

    /// Token lookup for verification of existing rows.
    pub fn get(&self, identifier: &str) -> Option<Arc<dyn ProtectionToken>> {
        self.tokens.get(identifier).cloned()
    }
}
