//! Agent identifiers — self-certifying `did:key` strings.
//!
//! An AID embeds its own verification key:
//!
//! ```text
//! did:key: z <base58btc( [0xed, 0x01] ++ public_key_bytes )>
//! ```
//!
//! `[0xed, 0x01]` is the unsigned-varint encoding of the `ed25519-pub`
//! multicodec value, which yields the well-known `z6Mk…` prefix. A
//! verifier recovers the public key from the identifier alone — no
//! directory or network lookup is needed to check a signature.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::keys::PublicKey;

const DID_KEY_PREFIX: &str = "did:key:z";
const MULTICODEC_ED25519: [u8; 2] = [0xed, 0x01];
const MIN_AID_LEN: usize = 48;

/// A validated `did:key` agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aid(String);

/// Result of [`Aid::parse`]: the DID method plus the embedded key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAid {
    pub method: String,
    pub public_key: PublicKey,
}

impl Aid {
    /// Derive the identifier for a public key.
    pub fn from_public_key(pk: &PublicKey) -> Self {
        let mut bytes = Vec::with_capacity(34);
        bytes.extend_from_slice(&MULTICODEC_ED25519);
        bytes.extend_from_slice(pk.as_bytes());
        Aid(format!("did:key:z{}", bs58::encode(bytes).into_string()))
    }

    /// Validate and wrap an identifier string.
    pub fn new(s: impl Into<String>) -> Result<Self, CryptoError> {
        let s = s.into();
        decode_did_key(&s)?;
        Ok(Aid(s))
    }

    /// Recover the public key embedded in this identifier.
    pub fn public_key(&self) -> Result<PublicKey, CryptoError> {
        decode_did_key(&self.0)
    }

    /// Parse into `{method, public_key}`. Only the `key` method is
    /// supported; any other method fails.
    pub fn parse(s: &str) -> Result<ParsedAid, CryptoError> {
        let rest = s
            .strip_prefix("did:")
            .ok_or_else(|| CryptoError::InvalidAid("missing did: prefix".into()))?;
        let method = rest
            .split(':')
            .next()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| CryptoError::InvalidAid("missing method".into()))?;
        if method != "key" {
            return Err(CryptoError::InvalidAid(format!(
                "unsupported did method '{method}'"
            )));
        }
        let public_key = decode_did_key(s)?;
        Ok(ParsedAid {
            method: method.to_string(),
            public_key,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Aid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Aid {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Aid::new(s)
    }
}

fn decode_did_key(s: &str) -> Result<PublicKey, CryptoError> {
    if !s.starts_with(DID_KEY_PREFIX) {
        return Err(CryptoError::InvalidAid("bad did:key prefix".into()));
    }
    if s.len() < MIN_AID_LEN {
        return Err(CryptoError::InvalidAid(format!(
            "identifier too short ({} chars)",
            s.len()
        )));
    }
    let payload = &s[DID_KEY_PREFIX.len()..];
    let bytes = bs58::decode(payload)
        .into_vec()
        .map_err(|e| CryptoError::InvalidAid(format!("bad base58btc payload: {e}")))?;
    if bytes.len() < 2 || bytes[..2] != MULTICODEC_ED25519 {
        return Err(CryptoError::InvalidAid("bad multicodec prefix".into()));
    }
    let key_bytes: [u8; 32] = bytes[2..]
        .try_into()
        .map_err(|_| CryptoError::InvalidAid(format!("key payload is {} bytes", bytes.len() - 2)))?;
    Ok(PublicKey::from_bytes(key_bytes))
}

/// Total predicate: true iff `s` is a well-formed `did:key` AID.
/// Never errors, never panics.
pub fn is_valid_aid(s: &str) -> bool {
    decode_did_key(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn roundtrip_recovers_public_key() {
        let kp = KeyPair::generate();
        let aid = Aid::from_public_key(&kp.public_key());
        assert_eq!(aid.public_key().unwrap(), kp.public_key());
    }

    #[test]
    fn has_ed25519_did_key_shape() {
        let kp = KeyPair::generate();
        let aid = Aid::from_public_key(&kp.public_key());
        assert!(aid.as_str().starts_with("did:key:z6Mk"));
        assert!(aid.as_str().len() >= MIN_AID_LEN);
        let tail = &aid.as_str()["did:key:z".len()..];
        assert!(tail
            .chars()
            .all(|c| "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz".contains(c)));
    }

    #[test]
    fn parse_yields_key_method() {
        let kp = KeyPair::generate();
        let aid = Aid::from_public_key(&kp.public_key());
        let parsed = Aid::parse(aid.as_str()).unwrap();
        assert_eq!(parsed.method, "key");
        assert_eq!(parsed.public_key, kp.public_key());
    }

    #[test]
    fn other_methods_rejected() {
        assert!(Aid::parse("did:web:example.com").is_err());
        assert!(Aid::parse("did:plc:abcdefghijklmnopqrstuvwx").is_err());
    }

    #[test]
    fn malformed_identifiers_are_invalid() {
        assert!(!is_valid_aid(""));
        assert!(!is_valid_aid("did:key:"));
        assert!(!is_valid_aid("did:key:x123"));
        assert!(!is_valid_aid("not-a-did"));
        // 0 and O are outside the base58 alphabet
        assert!(!is_valid_aid("did:key:z0O0O0O0O0O0O0O0O0O0O0O0O0O0O0O0O0O0O0O0O0O"));
        // valid base58 but wrong multicodec prefix
        let mut bytes = vec![0x12, 0x01];
        bytes.extend_from_slice(&[1u8; 32]);
        let did = format!("did:key:z{}", bs58::encode(bytes).into_string());
        assert!(!is_valid_aid(&did));
        // right prefix, truncated key
        let mut bytes = vec![0xed, 0x01];
        bytes.extend_from_slice(&[1u8; 16]);
        let did = format!("did:key:z{}", bs58::encode(bytes).into_string());
        assert!(!is_valid_aid(&did));
    }

    #[test]
    fn valid_aid_is_valid() {
        let kp = KeyPair::generate();
        let aid = Aid::from_public_key(&kp.public_key());
        assert!(is_valid_aid(aid.as_str()));
    }

    #[test]
    fn serde_is_transparent() {
        let kp = KeyPair::generate();
        let aid = Aid::from_public_key(&kp.public_key());
        let json = serde_json::to_string(&aid).unwrap();
        assert_eq!(json, format!("\"{}\"", aid.as_str()));
        let back: Aid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, aid);
    }
}
