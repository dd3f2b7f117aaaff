//! Passports — signed capability assertions, and key-rotation proofs.
//!
//! A passport binds an agent identifier to a capability list, signed by
//! the key the identifier itself embeds. Verification is self-contained:
//! the public key is recovered from `did`, cross-checked against the
//! `publicKey` field, and the signature is checked over the canonical
//! JSON of the record with `signature` removed.
//!
//! Verification never throws. Every internal failure — bad hex, bad
//! AID, bad signature bytes — collapses to `false`. Construction
//! functions propagate errors instead.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::aid::Aid;
use crate::canonical::CanonicalBytes;
use crate::error::CryptoError;
use crate::keys::{self, KeyPair, PublicKey, Signature};

/// Unix seconds; passports deal in whole seconds, events in millis.
pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── Passport ─────────────────────────────────────────────────────────────────

/// A signed, optionally time-bounded capability assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Passport {
    pub did: Aid,
    /// Lowercase hex of the 32-byte public key; MUST match `did`.
    pub public_key: String,
    pub capabilities: Vec<String>,
    /// Unix seconds.
    pub issued_at: i64,
    /// Unix seconds; omitted (not nulled) when the passport never expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Lowercase hex of the 64-byte Ed25519 signature over the
    /// canonical JSON of the record minus this field.
    pub signature: String,
}

/// Options for [`Passport::verify`] and [`batch_verify`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub ignore_expiration: bool,
    /// Injected clock (unix seconds) for testability; `None` = now.
    pub current_time: Option<i64>,
}

/// One entry of a [`batch_verify`] result, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchVerdict {
    pub did: Aid,
    pub valid: bool,
}

impl Passport {
    /// Issue a passport under `keypair`. `expiresAt` is present iff a
    /// ttl is given.
    pub fn issue(
        keypair: &KeyPair,
        capabilities: Vec<String>,
        ttl_seconds: Option<u64>,
    ) -> Result<Self, CryptoError> {
        let did = Aid::from_public_key(&keypair.public_key());
        let issued_at = now_seconds();
        let expires_at = ttl_seconds.map(|ttl| issued_at + ttl as i64);
        let mut passport = Passport {
            did,
            public_key: keypair.public_key().to_hex(),
            capabilities,
            issued_at,
            expires_at,
            signature: String::new(),
        };
        let payload = CanonicalBytes::new(&passport.signing_payload())?;
        passport.signature = keypair.sign(&payload).to_hex();
        Ok(passport)
    }

    /// The signed portion: every field except `signature`, with
    /// `expiresAt` omitted when absent.
    fn signing_payload(&self) -> serde_json::Value {
        let mut payload = json!({
            "did": self.did,
            "publicKey": self.public_key,
            "capabilities": self.capabilities,
            "issuedAt": self.issued_at,
        });
        if let Some(expires_at) = self.expires_at {
            payload["expiresAt"] = json!(expires_at);
        }
        payload
    }

    /// Full verification. Returns `true` iff the identifier parses, the
    /// hex fields are well-formed and consistent with it, the passport
    /// is unexpired (unless ignored), and the signature verifies under
    /// the embedded key. Any internal failure returns `false`.
    pub fn verify(&self, opts: VerifyOptions) -> bool {
        let Ok(embedded) = self.did.public_key() else {
            return false;
        };
        if !is_lower_hex(&self.public_key, 64) {
            return false;
        }
        let Ok(claimed) = PublicKey::from_hex(&self.public_key) else {
            return false;
        };
        if claimed != embedded {
            return false;
        }
        if !is_lower_hex(&self.signature, 128) {
            return false;
        }
        if !opts.ignore_expiration {
            if let Some(expires_at) = self.expires_at {
                let now = opts.current_time.unwrap_or_else(now_seconds);
                if now >= expires_at {
                    return false;
                }
            }
        }
        let Ok(payload) = CanonicalBytes::new(&self.signing_payload()) else {
            return false;
        };
        let Ok(signature) = Signature::from_hex(&self.signature) else {
            return false;
        };
        keys::verify(&embedded, &payload, &signature).is_ok()
    }

    /// `false` when `expiresAt` is absent, else whether the clock has
    /// reached it.
    pub fn is_expired(&self, current_time: Option<i64>) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => current_time.unwrap_or_else(now_seconds) >= expires_at,
        }
    }

    /// Compact JSON for transport.
    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Strict parse: unknown fields are rejected so the signed byte
    /// image stays stable. Use on every verification path.
    pub fn from_json(s: &str) -> Result<Self, CryptoError> {
        let passport: Passport = serde_json::from_str(s)?;
        Ok(passport)
    }

    /// Lenient parse for read-only read-back: unknown fields are
    /// dropped. Never feed the result back into a signing path.
    pub fn from_json_lenient(s: &str) -> Result<Self, CryptoError> {
        let mut value: serde_json::Value = serde_json::from_str(s)?;
        if let Some(map) = value.as_object_mut() {
            const KNOWN: [&str; 6] = [
                "did",
                "publicKey",
                "capabilities",
                "issuedAt",
                "expiresAt",
                "signature",
            ];
            map.retain(|k, _| KNOWN.contains(&k.as_str()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Verify a batch independently, preserving input order.
pub fn batch_verify(passports: &[Passport], opts: VerifyOptions) -> Vec<BatchVerdict> {
    passports
        .iter()
        .map(|p| BatchVerdict {
            did: p.did.clone(),
            valid: p.verify(opts),
        })
        .collect()
}

fn is_lower_hex(s: &str, expected_len: usize) -> bool {
    s.len() == expected_len
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

// ── Key rotation ─────────────────────────────────────────────────────────────

/// A signed statement by an old key consenting to a new key taking over
/// the same logical identity. Signed by the OLD key over the canonical
/// JSON of the other four fields; it does not itself issue a passport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RotationProof {
    pub old_did: Aid,
    pub new_did: Aid,
    /// Lowercase hex of the new 32-byte public key.
    pub new_public_key: String,
    /// Unix seconds at which authority transitions.
    pub timestamp: i64,
    pub signature: String,
}

impl RotationProof {
    fn signing_payload(&self) -> serde_json::Value {
        json!({
            "oldDid": self.old_did,
            "newDid": self.new_did,
            "newPublicKey": self.new_public_key,
            "timestamp": self.timestamp,
        })
    }
}

/// Sign a transition from `old_kp`'s identity to `new_kp`'s.
pub fn create_rotation_proof(
    old_kp: &KeyPair,
    new_kp: &KeyPair,
) -> Result<RotationProof, CryptoError> {
    let mut proof = RotationProof {
        old_did: Aid::from_public_key(&old_kp.public_key()),
        new_did: Aid::from_public_key(&new_kp.public_key()),
        new_public_key: new_kp.public_key().to_hex(),
        timestamp: now_seconds(),
        signature: String::new(),
    };
    let payload = CanonicalBytes::new(&proof.signing_payload())?;
    proof.signature = old_kp.sign(&payload).to_hex();
    Ok(proof)
}

/// Check a rotation proof under the OLD public key extracted from
/// `oldDid`. Returns `false` on any failure.
pub fn verify_rotation_proof(proof: &RotationProof) -> bool {
    let Ok(old_pk) = proof.old_did.public_key() else {
        return false;
    };
    let Ok(new_pk) = proof.new_did.public_key() else {
        return false;
    };
    match PublicKey::from_hex(&proof.new_public_key) {
        Ok(claimed) if claimed == new_pk => {}
        _ => return false,
    }
    let Ok(payload) = CanonicalBytes::new(&proof.signing_payload()) else {
        return false;
    };
    let Ok(signature) = Signature::from_hex(&proof.signature) else {
        return false;
    };
    keys::verify(&old_pk, &payload, &signature).is_ok()
}

/// Re-issue a passport under a new key, preserving capabilities, and
/// produce the rotation proof linking the two identities. The two
/// artifacts together form the auditable transition chain.
pub fn rotate(
    old_passport: &Passport,
    old_kp: &KeyPair,
    new_kp: &KeyPair,
    ttl_seconds: Option<u64>,
) -> Result<(Passport, RotationProof), CryptoError> {
    let old_did = Aid::from_public_key(&old_kp.public_key());
    if old_did != old_passport.did {
        return Err(CryptoError::PassportValidation(
            "old key pair does not match the passport identity".into(),
        ));
    }
    let proof = create_rotation_proof(old_kp, new_kp)?;
    let passport = Passport::issue(new_kp, old_passport.capabilities.clone(), ttl_seconds)?;
    Ok((passport, proof))
}
