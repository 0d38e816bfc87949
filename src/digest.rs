//! Content fingerprints.
//!
//! A digest is the SHA-256 of a message's canonical JSON encoding, as a
//! lower-hex string. It lets replicas detect payload corruption or mismatch
//! across the three phases; it proves nothing about who sent the message.

use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::error::ConsensusError;

/// Fingerprint a message. Deterministic: the canonical encoding is the
/// struct's field order, so the same logical content always hashes the same.
pub fn digest<T: Serialize>(message: &T) -> Result<String, ConsensusError> {
    let bytes = serde_json::to_vec(message)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RequestMsg;

    fn request(operation: &str) -> RequestMsg {
        RequestMsg {
            timestamp: 1700000000000,
            client_id: "client-1".into(),
            operation: operation.into(),
            sequence_id: 42,
        }
    }

    #[test]
    fn same_content_same_digest() {
        let a = digest(&request("put k v")).unwrap();
        let b = digest(&request("put k v")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_different_digest() {
        let a = digest(&request("put k v")).unwrap();
        let b = digest(&request("del k")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn digest_is_hex_sha256() {
        let fp = digest(&request("op")).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
