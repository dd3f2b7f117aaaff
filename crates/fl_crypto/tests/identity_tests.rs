//! Identity and passport lifecycle, end to end.

use fl_crypto::{
    batch_verify, create_rotation_proof, is_valid_aid, rotate, verify_rotation_proof, Aid,
    KeyPair, Passport, PublicKey, VerifyOptions,
};

#[test]
fn fixed_public_key_roundtrips_through_aid() {
    let mut pk_bytes = [0u8; 32];
    pk_bytes[0] = 0x3b;
    pk_bytes[1] = 0x6a;
    for (i, b) in pk_bytes.iter_mut().enumerate().skip(2) {
        *b = i as u8;
    }
    let pk = PublicKey::from_bytes(pk_bytes);
    let aid = Aid::from_public_key(&pk);

    assert!(aid.as_str().starts_with("did:key:z"));
    assert!(aid.as_str().len() >= 48);
    let tail = &aid.as_str()["did:key:".len()..];
    assert!(tail.starts_with('z'));
    assert!(tail[1..]
        .chars()
        .all(|c| "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz".contains(c)));
    assert_eq!(aid.public_key().unwrap(), pk);
    assert!(is_valid_aid(aid.as_str()));
}

#[test]
fn issue_serialize_verify_chain() {
    let kp = KeyPair::generate();
    let passport = Passport::issue(
        &kp,
        vec!["navigate".into(), "perceive".into()],
        Some(3600),
    )
    .unwrap();

    // Wire roundtrip keeps the record byte-compatible with its
    // signature.
    let wire = passport.to_json().unwrap();
    let received = Passport::from_json(&wire).unwrap();
    assert_eq!(received, passport);
    assert!(received.verify(VerifyOptions::default()));

    // A fleet of passports verifies independently.
    let other = Passport::issue(&KeyPair::generate(), vec![], None).unwrap();
    let mut forged = passport.clone();
    forged.capabilities.push("hack".into());
    let verdicts = batch_verify(
        &[passport.clone(), other, forged],
        VerifyOptions::default(),
    );
    assert_eq!(
        verdicts.iter().map(|v| v.valid).collect::<Vec<_>>(),
        vec![true, true, false]
    );
}

#[test]
fn rotation_chain_is_auditable() {
    let old_kp = KeyPair::generate();
    let new_kp = KeyPair::generate();
    let old_passport = Passport::issue(&old_kp, vec!["navigate".into()], Some(7200)).unwrap();

    let (new_passport, proof) = rotate(&old_passport, &old_kp, &new_kp, Some(7200)).unwrap();

    // The proof links the identities and is signed by the OLD key.
    assert!(verify_rotation_proof(&proof));
    assert_eq!(proof.old_did, old_passport.did);
    assert_eq!(proof.new_did, new_passport.did);

    // The new passport stands on its own.
    assert!(new_passport.verify(VerifyOptions::default()));
    assert_eq!(new_passport.capabilities, old_passport.capabilities);

    // A standalone proof between fresh keys also verifies, and any
    // mutation kills it.
    let standalone = create_rotation_proof(&new_kp, &KeyPair::generate()).unwrap();
    assert!(verify_rotation_proof(&standalone));
    let mut bent = standalone.clone();
    bent.new_public_key = old_kp.public_key().to_hex();
    assert!(!verify_rotation_proof(&bent));
}

#[test]
fn expiry_window_behaviour() {
    let kp = KeyPair::generate();
    let passport = Passport::issue(&kp, vec!["navigate".into()], Some(1)).unwrap();
    let t = passport.issued_at;

    // Inside the window.
    assert!(passport.verify(VerifyOptions {
        current_time: Some(t),
        ..Default::default()
    }));
    // Past it.
    assert!(!passport.verify(VerifyOptions {
        current_time: Some(t + 100),
        ..Default::default()
    }));
    // Past it, expiry ignored.
    assert!(passport.verify(VerifyOptions {
        current_time: Some(t + 100),
        ignore_expiration: true,
    }));
}
