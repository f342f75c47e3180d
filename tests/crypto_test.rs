//! Crypto integration tests: identity keys, sealing and passports.

use burrow::crypto::{sha3, KeyPair, SymmetricKey};
use burrow::passport::{Capabilities, Passport};

#[test]
fn sha3_is_deterministic_and_32_bytes() {
    let hash1 = sha3(b"test");
    let hash2 = sha3(b"test");
    assert_eq!(hash1, hash2);
    assert_eq!(hash1.len(), 32);
    assert_ne!(hash1, sha3(b"different"));
}

#[test]
fn sign_verify_and_tamper() {
    let kp = KeyPair::generate();
    let sig = kp.sign(b"test message");
    assert!(kp.public().verify(b"test message", &sig).is_ok());
    assert!(kp.public().verify(b"tampered message", &sig).is_err());

    let other = KeyPair::generate();
    assert!(other.public().verify(b"test message", &sig).is_err());
}

#[test]
fn keypairs_are_unique() {
    let kp1 = KeyPair::generate();
    let kp2 = KeyPair::generate();
    assert_ne!(kp1.public(), kp2.public());
    assert_ne!(kp1.public().short_hash(), kp2.public().short_hash());
}

#[test]
fn sealed_keys_open_only_for_the_recipient() {
    let recipient = KeyPair::generate();
    let bystander = KeyPair::generate();
    let key = SymmetricKey::generate();

    let sealed = recipient.public().seal(&key).unwrap();
    let opened = recipient.unseal(&sealed).unwrap();
    let probe = key.encrypt(b"probe").unwrap();
    assert_eq!(opened.decrypt(&probe).unwrap(), b"probe");

    // Decapsulating with the wrong secret yields a different key; the
    // wrap never opens.
    match bystander.unseal(&sealed) {
        Err(_) => {}
        Ok(wrong) => assert!(wrong.decrypt(&probe).is_err()),
    }
}

#[test]
fn keypair_survives_persistence() {
    // The node identity is stored on disk between runs.
    let kp = KeyPair::generate();
    let bytes = postcard::to_allocvec(&kp).unwrap();
    let restored: KeyPair = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(restored.public(), kp.public());

    let sig = restored.sign(b"signed after reload");
    assert!(kp.public().verify(b"signed after reload", &sig).is_ok());
}

#[test]
fn passport_chain_of_trust() {
    let owner = KeyPair::generate();
    let admin = KeyPair::generate();
    let user = KeyPair::generate();

    let admin_passport = Passport::issue(
        &owner,
        admin.public().clone(),
        "prod",
        Capabilities { allow_write: true, allow_storage: false, allow_sign: true },
    );
    assert!(admin_passport.verify(owner.public(), true, false, true).is_ok());
    // Admin holds no storage grant.
    assert!(admin_passport.verify(owner.public(), false, true, false).is_err());

    let user_passport = Passport::delegate(
        &admin,
        &admin_passport,
        user.public().clone(),
        Capabilities::default(),
    );
    assert!(user_passport.verify(owner.public(), true, true, false).is_ok());

    // A chain anchored to some other owner is worthless here.
    let impostor = KeyPair::generate();
    assert!(user_passport.verify(impostor.public(), false, false, false).is_err());
}
