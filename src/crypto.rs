//! Ed25519 node identity.
//!
//! A node's identity is an Ed25519 keypair; the public key doubles as the
//! node's position in the SNEK keyspace. Signing is consumed as a black
//! box: announcements and bootstrap payloads are signed directly, without
//! any intermediate hashing.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::types::{PublicKey, SIGNATURE_SIZE};

/// A complete node identity: signing key plus cached public key.
#[derive(Clone)]
pub struct Identity {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
    pub public_key: PublicKey,
}

impl Identity {
    /// Create an identity from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        let public_key = PublicKey(verifying_key.to_bytes());
        Self {
            signing_key,
            verifying_key,
            public_key,
        }
    }

    /// Generate a new random identity.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let signing_key = SigningKey::generate(&mut rng);
        let verifying_key = signing_key.verifying_key();
        let public_key = PublicKey(verifying_key.to_bytes());
        Self {
            signing_key,
            verifying_key,
            public_key,
        }
    }

    /// Sign an arbitrary message, returning the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Public key as lowercase hex (64 characters).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.0)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.public_key.short())
    }
}

/// Verify a detached signature against a public key. Returns false for
/// malformed keys as well as bad signatures.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
    let Ok(verifying) = VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };
    verifying
        .verify(message, &Signature::from_bytes(signature))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_from_seed() {
        let a = Identity::from_seed(&[7u8; 32]);
        let b = Identity::from_seed(&[7u8; 32]);
        assert_eq!(a.public_key, b.public_key);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let id = Identity::generate();
        let sig = id.sign(b"hello snake");
        assert!(verify(&id.public_key, b"hello snake", &sig));
        assert!(!verify(&id.public_key, b"hello snek", &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let id = Identity::generate();
        let other = Identity::generate();
        let sig = id.sign(b"message");
        assert!(!verify(&other.public_key, b"message", &sig));
    }
}
