//! Access-controlled mutable blocks.
//!
//! An ACL block extends the owned mutable block with world permission
//! bits and a list of per-user entries. When at-rest encryption is on the
//! payload is stored as AEAD ciphertext under a per-version data key,
//! sealed once to the owner and once to every reader entry. Sealing
//! re-derives the data key, so revoking a reader takes effect at the next
//! version. World-readable blocks store plaintext: there is no key to
//! seal to "everyone".

use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey, SealedKey, SymmetricKey};
use crate::error::{Error, Result};
use crate::types::Signature;
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub key: PublicKey,
    pub read: bool,
    pub write: bool,
    pub admin: bool,
    pub owner: bool,
    /// Data key sealed to this entry; present on reader entries of
    /// encrypted blocks, refreshed at every seal.
    pub sealed_key: Option<SealedKey>,
}

impl AclEntry {
    pub fn new(key: PublicKey, read: bool, write: bool) -> Self {
        Self { key, read, write, admin: false, owner: false, sealed_key: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclBlock {
    pub owner: PublicKey,
    pub salt: Vec<u8>,
    pub version: u64,
    /// Ciphertext when `encrypted`, plaintext otherwise.
    pub payload: Vec<u8>,
    pub world_read: bool,
    pub world_write: bool,
    pub entries: Vec<AclEntry>,
    /// Whether the payload is stored encrypted.
    pub encrypted: bool,
    /// Data key sealed to the owner.
    pub owner_sealed_key: Option<SealedKey>,
    /// Key that produced `signature`; None means the owner.
    pub signer: Option<PublicKey>,
    pub signature: Signature,
    /// Staged plaintext awaiting the next seal; never serialized.
    #[serde(skip)]
    plain: Option<Vec<u8>>,
}

impl AclBlock {
    pub fn new(owner: PublicKey, encrypt_at_rest: bool) -> Self {
        let mut salt = vec![0u8; super::immutable::SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            owner,
            salt,
            version: 0,
            payload: Vec::new(),
            world_read: false,
            world_write: false,
            entries: Vec::new(),
            encrypted: encrypt_at_rest,
            owner_sealed_key: None,
            signer: None,
            signature: Vec::new(),
            plain: None,
        }
    }

    pub fn address(&self) -> Address {
        Address::for_owner(&self.owner, &self.salt)
    }

    pub fn is_sealed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Stage new plaintext; the block must be re-sealed before storing.
    pub fn set_payload(&mut self, plaintext: Vec<u8>) {
        self.plain = Some(plaintext);
        self.signature.clear();
    }

    pub fn set_world_permissions(&mut self, read: bool, write: bool) {
        self.world_read = read;
        self.world_write = write;
        self.signature.clear();
    }

    /// Add or update an entry. Reader keys receive the data key at the
    /// next seal.
    pub fn grant(&mut self, key: PublicKey, read: bool, write: bool, admin: bool) {
        self.signature.clear();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.read = read;
            entry.write = write;
            entry.admin = admin;
            entry.sealed_key = None;
            return;
        }
        let mut entry = AclEntry::new(key, read, write);
        entry.admin = admin;
        self.entries.push(entry);
    }

    pub fn revoke(&mut self, key: &PublicKey) -> bool {
        self.signature.clear();
        let before = self.entries.len();
        self.entries.retain(|e| &e.key != key);
        self.entries.len() != before
    }

    fn entry_for(&self, key: &PublicKey) -> Option<&AclEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }

    pub fn can_write(&self, key: &PublicKey) -> bool {
        self.world_write
            || key == &self.owner
            || self.entry_for(key).map(|e| e.write).unwrap_or(false)
    }

    pub fn can_read(&self, key: &PublicKey) -> bool {
        self.world_read
            || key == &self.owner
            || self.entry_for(key).map(|e| e.read).unwrap_or(false)
    }

    fn signed_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(64 + self.payload.len());
        bytes.extend_from_slice(&self.address().0);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.push(self.world_read as u8);
        bytes.push(self.world_write as u8);
        bytes.push(self.encrypted as u8);
        bytes.extend_from_slice(&crate::wire::to_bytes(&self.entries)?);
        Ok(bytes)
    }

    /// Plaintext for re-sealing: staged bytes if any, otherwise decrypt
    /// the current payload with the sealer's own access.
    fn plaintext_for_seal(&mut self, keys: &KeyPair) -> Result<Vec<u8>> {
        if let Some(plain) = self.plain.take() {
            return Ok(plain);
        }
        if self.version == 0 {
            return Ok(Vec::new());
        }
        self.decrypt(keys)
    }

    /// Bump the version, refresh the data key and reader seals, and sign.
    /// The sealer must be the owner or a writer entry.
    pub fn seal(&mut self, keys: &KeyPair) -> Result<()> {
        let sealer = keys.public().clone();
        if sealer == self.owner {
            self.signer = None;
        } else if self.entry_for(&sealer).map(|e| e.write).unwrap_or(self.world_write) {
            self.signer = Some(sealer);
        } else {
            return Err(Error::PermissionDenied);
        }

        let plaintext = self.plaintext_for_seal(keys)?;
        self.version += 1;

        // World-readable payloads stay in the clear: no key to seal to.
        let encrypt = self.encrypted && !self.world_read;
        self.encrypted = encrypt;
        if encrypt {
            let data_key = SymmetricKey::generate();
            self.payload = data_key.encrypt(&plaintext)?;
            self.owner_sealed_key = Some(self.owner.seal(&data_key)?);
            for entry in &mut self.entries {
                entry.sealed_key =
                    if entry.read { Some(entry.key.seal(&data_key)?) } else { None };
            }
        } else {
            self.payload = plaintext;
            self.owner_sealed_key = None;
            for entry in &mut self.entries {
                entry.sealed_key = None;
            }
        }

        let bytes = self.signed_bytes()?;
        self.signature = keys.sign(&bytes);
        Ok(())
    }

    pub fn validate(&self, expected: &Address) -> Result<()> {
        let derived = self.address();
        if derived != *expected {
            return Err(Error::ValidationFailed(format!(
                "owner-derived address mismatch: derived {derived}, stored under {expected}"
            )));
        }
        if !self.is_sealed() {
            return Err(Error::ValidationFailed("unsealed acl block".into()));
        }
        let signer = match &self.signer {
            None => &self.owner,
            Some(key) => {
                let authorized = self.world_write
                    || self.entry_for(key).map(|e| e.write).unwrap_or(false);
                if !authorized {
                    return Err(Error::ValidationFailed(
                        "acl block signed by a key without write permission".into(),
                    ));
                }
                key
            }
        };
        let bytes = self.signed_bytes()?;
        signer
            .verify(&bytes, &self.signature)
            .map_err(|_| Error::ValidationFailed("acl signature check failed".into()))
    }

    /// Recover the plaintext payload with the caller's keys.
    pub fn decrypt(&self, keys: &KeyPair) -> Result<Vec<u8>> {
        if !self.encrypted {
            if self.can_read(keys.public()) {
                return Ok(self.payload.clone());
            }
            return Err(Error::PermissionDenied);
        }
        let sealed = if keys.public() == &self.owner {
            self.owner_sealed_key.as_ref()
        } else {
            self.entry_for(keys.public()).and_then(|e| e.sealed_key.as_ref())
        };
        let sealed = sealed.ok_or(Error::PermissionDenied)?;
        let data_key = keys.unseal(sealed).map_err(|_| Error::PermissionDenied)?;
        data_key
            .decrypt(&self.payload)
            .map_err(|_| Error::ValidationFailed("acl payload decryption failed".into()))
    }

    pub(crate) fn to_v1(&self) -> AclBlockV1 {
        AclBlockV1 {
            owner: self.owner.clone(),
            salt: self.salt.clone(),
            version: self.version,
            payload: self.payload.clone(),
            world_read: self.world_read,
            world_write: self.world_write,
            entries: self
                .entries
                .iter()
                .map(|e| AclEntryV1 {
                    key: e.key.clone(),
                    read: e.read,
                    write: e.write,
                    sealed_key: e.sealed_key.clone(),
                })
                .collect(),
            encrypted: self.encrypted,
            owner_sealed_key: self.owner_sealed_key.clone(),
            signer: self.signer.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// 0.1.x entries carried no admin/owner bits.
#[derive(Serialize, Deserialize)]
pub(crate) struct AclEntryV1 {
    pub key: PublicKey,
    pub read: bool,
    pub write: bool,
    pub sealed_key: Option<SealedKey>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct AclBlockV1 {
    pub owner: PublicKey,
    pub salt: Vec<u8>,
    pub version: u64,
    pub payload: Vec<u8>,
    pub world_read: bool,
    pub world_write: bool,
    pub entries: Vec<AclEntryV1>,
    pub encrypted: bool,
    pub owner_sealed_key: Option<SealedKey>,
    pub signer: Option<PublicKey>,
    pub signature: Signature,
}

impl From<AclBlockV1> for AclBlock {
    fn from(v1: AclBlockV1) -> Self {
        Self {
            owner: v1.owner,
            salt: v1.salt,
            version: v1.version,
            payload: v1.payload,
            world_read: v1.world_read,
            world_write: v1.world_write,
            entries: v1
                .entries
                .into_iter()
                .map(|e| AclEntry {
                    key: e.key,
                    read: e.read,
                    write: e.write,
                    admin: false,
                    owner: false,
                    sealed_key: e.sealed_key,
                })
                .collect(),
            encrypted: v1.encrypted,
            owner_sealed_key: v1.owner_sealed_key,
            signer: v1.signer,
            signature: v1.signature,
            plain: None,
        }
    }
}
