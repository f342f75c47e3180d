//! Identity and block cryptography.
//!
//! Every user and node identity is a pair of post-quantum keys: an
//! ML-DSA-65 signing key and an ML-KEM-768 encapsulation key. Signatures
//! cover blocks, passports and handshake challenges; encapsulation seals
//! symmetric keys to a recipient (per-reader ACL data keys, channel session
//! keys). Symmetric encryption is ChaCha20-Poly1305 with a random 96-bit
//! nonce prefixed to the ciphertext.

use crate::types::{Hash, Signature};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use pqcrypto_dilithium::dilithium3 as mldsa;
use pqcrypto_kyber::kyber768 as mlkem;
use pqcrypto_traits::kem::{
    Ciphertext as KemCtTrait, PublicKey as KemPkTrait, SecretKey as KemSkTrait,
    SharedSecret as KemSsTrait,
};
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as SignPkTrait, SecretKey as SignSkTrait,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use thiserror::Error;

pub const MLDSA65_PUBKEY_SIZE: usize = 1952;
pub const MLDSA65_SIG_SIZE: usize = 3293;
pub const MLDSA65_SECRET_SIZE: usize = 4000;

pub const MLKEM768_PUBKEY_SIZE: usize = 1184;
pub const MLKEM768_SECRET_SIZE: usize = 2400;
pub const MLKEM768_CT_SIZE: usize = 1088;

/// Symmetric key size (ChaCha20-Poly1305).
pub const SYMMETRIC_KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("invalid ciphertext")]
    InvalidCiphertext,
    #[error("decryption failed")]
    DecryptionFailed,
}

// =============================================================================
// PUBLIC IDENTITY
// =============================================================================

/// Public half of an identity: verification key + encapsulation key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    sign: Vec<u8>,
    seal: Vec<u8>,
}

impl PublicKey {
    pub fn from_parts(sign: Vec<u8>, seal: Vec<u8>) -> Result<Self, CryptoError> {
        if sign.len() != MLDSA65_PUBKEY_SIZE || seal.len() != MLKEM768_PUBKEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Self { sign, seal })
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let pk = mldsa::PublicKey::from_bytes(&self.sign)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let sig = mldsa::DetachedSignature::from_bytes(signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        mldsa::verify_detached_signature(&sig, message, &pk)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Seal a symmetric key to this identity: encapsulate a shared secret,
    /// then wrap the key under it.
    pub fn seal(&self, key: &SymmetricKey) -> Result<SealedKey, CryptoError> {
        let pk = mlkem::PublicKey::from_bytes(&self.seal)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let (ss, ct) = mlkem::encapsulate(&pk);
        let wrap = SymmetricKey::from_bytes(ss.as_bytes())?;
        Ok(SealedKey {
            encapsulation: ct.as_bytes().to_vec(),
            wrapped: wrap.encrypt(&key.0)?,
        })
    }

    pub fn sign_bytes(&self) -> &[u8] {
        &self.sign
    }

    pub fn seal_bytes(&self) -> &[u8] {
        &self.seal
    }

    /// Full digest of both key halves.
    pub fn digest(&self) -> Hash {
        let mut hasher = Sha3_256::new();
        hasher.update(&self.sign);
        hasher.update(&self.seal);
        hasher.finalize().into()
    }

    /// Short hash used by the per-connection key cache and for display.
    pub fn short_hash(&self) -> u64 {
        u64::from_le_bytes(self.digest()[..8].try_into().unwrap_or([0u8; 8]))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.digest()[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.digest()[..8]))
    }
}

// =============================================================================
// KEYPAIR
// =============================================================================

/// Full identity. Secrets are kept as raw bytes so keypairs can be
/// persisted to the data directory and reloaded.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    public: PublicKey,
    sign_secret: Vec<u8>,
    seal_secret: Vec<u8>,
}

impl KeyPair {
    pub fn generate() -> Self {
        let (sign_pk, sign_sk) = mldsa::keypair();
        let (seal_pk, seal_sk) = mlkem::keypair();
        Self {
            public: PublicKey {
                sign: sign_pk.as_bytes().to_vec(),
                seal: seal_pk.as_bytes().to_vec(),
            },
            sign_secret: sign_sk.as_bytes().to_vec(),
            seal_secret: seal_sk.as_bytes().to_vec(),
        }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        // Secret bytes come from our own generate(); parsing cannot fail.
        let sk = mldsa::SecretKey::from_bytes(&self.sign_secret)
            .unwrap_or_else(|_| unreachable!("keypair holds a valid signing secret"));
        mldsa::detached_sign(message, &sk).as_bytes().to_vec()
    }

    /// Recover a symmetric key sealed to this identity.
    pub fn unseal(&self, sealed: &SealedKey) -> Result<SymmetricKey, CryptoError> {
        let sk = mlkem::SecretKey::from_bytes(&self.seal_secret)
            .map_err(|_| CryptoError::InvalidSecretKey)?;
        let ct = mlkem::Ciphertext::from_bytes(&sealed.encapsulation)
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        let ss = mlkem::decapsulate(&ct, &sk);
        let wrap = SymmetricKey::from_bytes(ss.as_bytes())?;
        let key = wrap.decrypt(&sealed.wrapped)?;
        SymmetricKey::from_bytes(&key)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public)
    }
}

// =============================================================================
// SEALED + SYMMETRIC KEYS
// =============================================================================

/// A symmetric key encapsulated to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub encapsulation: Vec<u8>,
    pub wrapped: Vec<u8>,
}

/// ChaCha20-Poly1305 key. Ciphertexts carry their nonce as a prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey(pub(crate) [u8; SYMMETRIC_KEY_SIZE]);

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SYMMETRIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self(arr))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidCiphertext);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        let (nonce, ct) = data.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        write!(f, "SymmetricKey(..)")
    }
}

// =============================================================================
// DIGESTS
// =============================================================================

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

pub fn sha3_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"burrow block bytes");
        assert!(kp.public().verify(b"burrow block bytes", &sig).is_ok());
        assert!(kp.public().verify(b"tampered", &sig).is_err());

        let other = KeyPair::generate();
        assert!(other.public().verify(b"burrow block bytes", &sig).is_err());
    }

    #[test]
    fn seal_roundtrip() {
        let reader = KeyPair::generate();
        let key = SymmetricKey::generate();
        let sealed = reader.public().seal(&key).unwrap();
        let opened = reader.unseal(&sealed).unwrap();
        assert_eq!(opened.0, key.0);

        // A different identity cannot unseal.
        let outsider = KeyPair::generate();
        assert!(outsider.unseal(&sealed).is_err() || outsider.unseal(&sealed).unwrap().0 != key.0);
    }

    #[test]
    fn symmetric_roundtrip() {
        let key = SymmetricKey::generate();
        let ct = key.encrypt(b"at-rest payload").unwrap();
        assert_eq!(key.decrypt(&ct).unwrap(), b"at-rest payload");
        assert!(SymmetricKey::generate().decrypt(&ct).is_err());
    }

    #[test]
    fn short_hash_is_stable() {
        let kp = KeyPair::generate();
        assert_eq!(kp.public().short_hash(), kp.public().short_hash());
    }
}
