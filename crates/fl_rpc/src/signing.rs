//! Request signing — what exactly the signature covers.
//!
//! Two incompatible conventions exist in the wild: signing the
//! canonical `{method, params}` payload, and signing the whole request
//! object. Fleetlock implements both behind [`SignaturePolicy`]; the
//! server's configuration decides, and both peers must agree. The
//! default is payload-only, which lets an idempotent retry reuse its
//! signature because neither the id nor the auth stamp is covered.

use serde::{Deserialize, Serialize};
use serde_json::json;

use fl_crypto::{Aid, CanonicalBytes, CryptoError, KeyPair, PublicKey, Signature};

use crate::wire::{AuthStamp, Request};

/// Which part of a request the auth signature covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignaturePolicy {
    /// Canonical `{method, params}`; `params` is omitted, not nulled,
    /// when the request has none.
    #[default]
    PayloadOnly,
    /// The full request object with `auth.signature` removed.
    FullRequest,
}

/// Canonical bytes the signature covers under `policy`. For
/// `FullRequest` the request's own `auth.signature` is excluded from
/// the image, so signing and verification build the same bytes.
pub fn signing_payload(
    policy: SignaturePolicy,
    request: &Request,
) -> Result<CanonicalBytes, CryptoError> {
    match policy {
        SignaturePolicy::PayloadOnly => {
            let mut payload = json!({"method": request.method});
            if let Some(params) = &request.params {
                payload["params"] = params.clone();
            }
            CanonicalBytes::new(&payload)
        }
        SignaturePolicy::FullRequest => {
            let mut value = serde_json::to_value(request)?;
            if let Some(auth) = value.get_mut("auth").and_then(|a| a.as_object_mut()) {
                auth.remove("signature");
            }
            CanonicalBytes::new(&value)
        }
    }
}

/// Attach an auth stamp to `request`, signing with `identity`.
pub fn sign_request(
    identity: &KeyPair,
    policy: SignaturePolicy,
    request: &mut Request,
) -> Result<(), CryptoError> {
    let from = Aid::from_public_key(&identity.public_key());
    // The stamp (minus signature) is part of the image under
    // FullRequest, so it must be in place before canonicalizing.
    request.auth = Some(AuthStamp {
        from,
        signature: String::new(),
    });
    let payload = signing_payload(policy, request)?;
    let signature = identity.sign(&payload).to_hex();
    if let Some(auth) = request.auth.as_mut() {
        auth.signature = signature;
    }
    Ok(())
}

/// Check a request's auth stamp. Returns the authenticated sender on
/// success; every failure collapses to `None` — the caller maps it to
/// `AUTHENTICATION_FAILED` without leaking the reason.
pub fn verify_request(policy: SignaturePolicy, request: &Request) -> Option<Aid> {
    let auth = request.auth.as_ref()?;
    let public_key: PublicKey = auth.from.public_key().ok()?;
    let signature = Signature::from_hex(&auth.signature).ok()?;
    let payload = signing_payload(policy, request).ok()?;
    fl_crypto::verify(&public_key, &payload, &signature).ok()?;
    Some(auth.from.clone())
}
