//! Hash and text encoding helpers

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash and return it base58 encoded
pub fn sha256_base58(data: &[u8]) -> String {
    to_base58(&sha256(data))
}

/// Encode bytes as base58 (bitcoin alphabet)
pub fn to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Decode a base58 string, `None` when the text is not base58
pub fn from_base58(text: &str) -> Option<Vec<u8>> {
    bs58::decode(text).into_vec().ok()
}
