//! Deterministic JSON encoding — the pre-image for every signature.
//!
//! Equal values always produce equal bytes: object keys are sorted
//! lexicographically by code point, no insignificant whitespace is
//! emitted, strings use serde_json's minimal escape set, and floats
//! that hold an integral value are written without fraction or
//! exponent. Both the signing and the verifying side of a record MUST
//! run through this encoder; any divergence is a wire-compatibility
//! bug, not a local style choice.
//!
//! Signing APIs in this crate take `&CanonicalBytes`, never `&[u8]`,
//! so a payload that skipped canonicalization cannot be signed or
//! verified by accident.

use serde::Serialize;
use serde_json::Value;

use crate::error::CryptoError;

/// Canonical JSON bytes, produced only by [`CanonicalBytes::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    /// Canonicalize any serializable value.
    ///
    /// Fails when the value cannot be represented as plain JSON
    /// (non-string map keys, serializer errors). A `serde_json::Value`
    /// cannot hold a non-finite number, so that failure mode is ruled
    /// out before encoding starts; the encoder still guards against it.
    pub fn new<T: Serialize>(value: &T) -> Result<Self, CryptoError> {
        let value = serde_json::to_value(value)
            .map_err(|e| CryptoError::Canonicalization(e.to_string()))?;
        let mut out = Vec::with_capacity(128);
        encode_value(&value, &mut out)?;
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CryptoError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => encode_number(n, out)?,
        Value::String(s) => encode_string(s, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                encode_value(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // serde_json's default map preserves insertion order;
            // canonical form requires code-point key order.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                encode_string(key, out)?;
                out.push(b':');
                encode_value(&map[key.as_str()], out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn encode_number(n: &serde_json::Number, out: &mut Vec<u8>) -> Result<(), CryptoError> {
    if n.is_i64() || n.is_u64() {
        out.extend_from_slice(n.to_string().as_bytes());
        return Ok(());
    }
    let f = n
        .as_f64()
        .ok_or_else(|| CryptoError::Canonicalization("unrepresentable number".into()))?;
    if !f.is_finite() {
        return Err(CryptoError::Canonicalization(
            "non-finite numbers cannot be canonicalized".into(),
        ));
    }
    // Integral floats within the exact-integer range of f64 are
    // written as integers so `2.0` and `2` sign identically.
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0; // 2^53
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE {
        out.extend_from_slice(format!("{}", f as i64).as_bytes());
    } else {
        out.extend_from_slice(n.to_string().as_bytes());
    }
    Ok(())
}

fn encode_string(s: &str, out: &mut Vec<u8>) -> Result<(), CryptoError> {
    // serde_json escapes exactly the minimal set: control characters,
    // the quote, and the backslash.
    let escaped = serde_json::to_string(s)?;
    out.extend_from_slice(escaped.as_bytes());
    Ok(())
}
