//! Fleetlock identity primitives.
//!
//! Everything an agent needs to prove who it is: Ed25519 key material,
//! self-certifying `did:key` identifiers, deterministic JSON
//! canonicalization, and signed capability passports with key-rotation
//! proofs.

pub mod aid;
pub mod canonical;
pub mod error;
pub mod keys;
pub mod passport;

pub use aid::{is_valid_aid, Aid, ParsedAid};
pub use canonical::CanonicalBytes;
pub use error::CryptoError;
pub use keys::{
    derive_public, is_valid_private_key, is_valid_public_key, verify, KeyPair, PublicKey,
    Signature,
};
pub use passport::{
    batch_verify, create_rotation_proof, now_seconds, rotate, verify_rotation_proof, BatchVerdict,
    Passport, RotationProof, VerifyOptions,
};
