//! Chain identities: P-256 key pairs, signing and verification
//!
//! The public half of an identity, compressed and base58 encoded, is also the
//! id of the chain it owns. All peers must agree on the curve, so it is fixed
//! to NIST P-256 here.

pub mod hash;

use crate::error::{CryptoError, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;

pub use hash::{from_base58, sha256, sha256_base58, to_base58};

/// A public key, optionally paired with its private key
#[derive(Clone)]
pub struct Identity {
    public: VerifyingKey,
    private: Option<SigningKey>,
}

impl Identity {
    /// Generate a new key pair
    pub fn generate() -> Self {
        let private = SigningKey::random(&mut OsRng);
        Self {
            public: VerifyingKey::from(&private),
            private: Some(private),
        }
    }

    /// Create a verify-only identity from an encoded public key
    ///
    /// Both the compressed form (`0x02`/`0x03` flag byte followed by x) and
    /// the uncompressed `0x04 | x | y` form are accepted; for the compressed
    /// form y is recovered from the curve equation using the parity flag.
    pub fn from_public(public_key: &str) -> Result<Self> {
        let bytes = from_base58(public_key).ok_or_else(|| CryptoError::InvalidPublicKey {
            reason: "Invalid base58 encoding".to_string(),
        })?;
        let public = VerifyingKey::from_sec1_bytes(&bytes).map_err(|_| {
            CryptoError::InvalidPublicKey {
                reason: "Not a point on P-256".to_string(),
            }
        })?;
        Ok(Self {
            public,
            private: None,
        })
    }

    /// Create a signing identity from an encoded key pair
    pub fn from_keypair(public_key: &str, private_key: &str) -> Result<Self> {
        let identity = Self::from_public(public_key)?;
        let bytes = from_base58(private_key).ok_or_else(|| CryptoError::InvalidPrivateKey {
            reason: "Invalid base58 encoding".to_string(),
        })?;
        let private = SigningKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey {
            reason: "Not a P-256 scalar".to_string(),
        })?;

        if VerifyingKey::from(&private) != identity.public {
            return Err(CryptoError::KeyMismatch {
                public_key: public_key.to_string(),
            }
            .into());
        }

        Ok(Self {
            public: identity.public,
            private: Some(private),
        })
    }

    /// Whether this identity holds a private key
    pub fn can_sign(&self) -> bool {
        self.private.is_some()
    }

    /// Compressed public point, base58 encoded
    pub fn public_key(&self) -> String {
        to_base58(self.public.to_encoded_point(true).as_bytes())
    }

    /// Raw private scalar, base58 encoded
    pub fn private_key(&self) -> Option<String> {
        self.private
            .as_ref()
            .map(|key| to_base58(&key.to_bytes()))
    }

    /// Sign `data` (SHA-256 digest, DER encoded signature, base58)
    ///
    /// Returns `None` for verify-only identities.
    pub fn sign(&self, data: &[u8]) -> Option<String> {
        let key = self.private.as_ref()?;
        let signature: Signature = key.sign(data);
        Some(to_base58(signature.to_der().as_bytes()))
    }

    /// Verify a base58 signature over `data`
    ///
    /// Malformed input of any kind yields `false`.
    pub fn verify(&self, signature: &str, data: &[u8]) -> bool {
        let Some(bytes) = from_base58(signature) else {
            return false;
        };
        let parsed = Signature::from_der(&bytes).or_else(|_| Signature::from_slice(&bytes));
        match parsed {
            Ok(signature) => self.public.verify(data, &signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for Identity {}
