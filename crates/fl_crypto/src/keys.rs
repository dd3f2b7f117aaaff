//! Ed25519 key material.
//!
//! Each agent holds one long-term `KeyPair`. The private half lives in
//! a `ZeroizeOnDrop` container, never implements `Serialize`, and is
//! redacted from `Debug` output. Public keys and signatures cross
//! process boundaries as lowercase hex.
//!
//! Signing input is `&CanonicalBytes`, never raw bytes — see
//! [`crate::canonical`].

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::ZeroizeOnDrop;

use crate::canonical::CanonicalBytes;
use crate::error::CryptoError;

// ── Public key ───────────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key, lowercase hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        if s.len() != 64 {
            return Err(CryptoError::InvalidKey(format!(
                "public key hex must be 64 chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid public key: {e}")))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}…)", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ── Signature ────────────────────────────────────────────────────────────────

/// 64-byte Ed25519 signature, lowercase hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        if s.len() != 128 {
            return Err(CryptoError::InvalidKey(format!(
                "signature hex must be 128 chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)?;
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.0[..4]))
    }
}

// ── Key pair ─────────────────────────────────────────────────────────────────

/// Long-term agent signing key. Drop clears the private half.
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    public: PublicKey,
    secret_bytes: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKey(signing_key.verifying_key().to_bytes());
        Self {
            public,
            secret_bytes: signing_key.to_bytes(),
        }
    }

    /// Rebuild a key pair from a 32-byte seed. The all-zero seed is
    /// rejected — it is the conventional "unset" sentinel and never a
    /// real key.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "private key must be 32 bytes, got {}",
                seed.len()
            )));
        }
        if seed.iter().all(|b| *b == 0) {
            return Err(CryptoError::InvalidKey("private key is all zero".into()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(seed);
        let signing_key = SigningKey::from_bytes(&arr);
        let public = PublicKey(signing_key.verifying_key().to_bytes());
        Ok(Self {
            public,
            secret_bytes: arr,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Raw seed bytes, for persistence. Callers own the copy and are
    /// responsible for zeroizing it.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    /// Sign canonical bytes; returns a 64-byte Ed25519 signature.
    pub fn sign(&self, payload: &CanonicalBytes) -> Signature {
        Signature(self.signing_key().sign(payload.as_bytes()).to_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair(<private>)")
    }
}

// ── Derivation and verification ──────────────────────────────────────────────

/// Derive the public key from a private seed; fails on invalid seeds.
pub fn derive_public(seed: &[u8]) -> Result<PublicKey, CryptoError> {
    Ok(KeyPair::from_seed(seed)?.public_key())
}

/// Verify a signature over canonical bytes under `public`.
pub fn verify(
    public: &PublicKey,
    payload: &CanonicalBytes,
    signature: &Signature,
) -> Result<(), CryptoError> {
    let vk = public.verifying_key()?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    vk.verify_strict(payload.as_bytes(), &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

/// Total predicate: true iff `bytes` could be a private key (32 bytes,
/// not all zero). Never errors.
pub fn is_valid_private_key(bytes: &[u8]) -> bool {
    bytes.len() == 32 && bytes.iter().any(|b| *b != 0)
}

/// Total predicate: true iff `bytes` could be a public key.
pub fn is_valid_public_key(bytes: &[u8]) -> bool {
    bytes.len() == 32 && bytes.iter().any(|b| *b != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate();
        let payload = CanonicalBytes::new(&json!({"hello": "world"})).unwrap();
        let sig = kp.sign(&payload);
        verify(&kp.public_key(), &payload, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let payload = CanonicalBytes::new(&json!({"n": 1})).unwrap();
        let sig = kp.sign(&payload);
        assert!(verify(&other.public_key(), &payload, &sig).is_err());
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let kp = KeyPair::generate();
        let payload = CanonicalBytes::new(&json!({"n": 1})).unwrap();
        let tampered = CanonicalBytes::new(&json!({"n": 2})).unwrap();
        let sig = kp.sign(&payload);
        assert!(verify(&kp.public_key(), &tampered, &sig).is_err());
    }

    #[test]
    fn from_seed_is_deterministic() {
        let seed = [7u8; 32];
        let a = KeyPair::from_seed(&seed).unwrap();
        let b = KeyPair::from_seed(&seed).unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn zero_seed_rejected() {
        assert!(KeyPair::from_seed(&[0u8; 32]).is_err());
        assert!(!is_valid_private_key(&[0u8; 32]));
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(KeyPair::from_seed(&[1u8; 16]).is_err());
        assert!(!is_valid_private_key(&[1u8; 31]));
        assert!(!is_valid_public_key(&[]));
    }

    #[test]
    fn hex_roundtrips() {
        let kp = KeyPair::generate();
        let pk = kp.public_key();
        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);

        let payload = CanonicalBytes::new(&json!({"x": 1})).unwrap();
        let sig = kp.sign(&payload);
        assert_eq!(Signature::from_hex(&sig.to_hex()).unwrap(), sig);
    }

    #[test]
    fn debug_never_leaks_private_key() {
        let kp = KeyPair::generate();
        assert_eq!(format!("{kp:?}"), "KeyPair(<private>)");
    }
}
