//! JSON debug/admin export of blocks.
//!
//! Self-describing: a `kind` discriminant plus the §3 field names, with
//! byte fields hex-encoded. Round-trips losslessly with the in-memory
//! representation.

use super::{AclBlock, AclEntry, Block, ImmutableBlock, MutableBlock, NamedBlock};
use crate::crypto::{PublicKey, SealedKey};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize)]
struct JsonKey {
    sign: String,
    seal: String,
}

impl From<&PublicKey> for JsonKey {
    fn from(key: &PublicKey) -> Self {
        Self { sign: hex::encode(key.sign_bytes()), seal: hex::encode(key.seal_bytes()) }
    }
}

impl JsonKey {
    fn parse(&self) -> Result<PublicKey> {
        let sign = hex::decode(&self.sign).map_err(|e| Error::other(e))?;
        let seal = hex::decode(&self.seal).map_err(|e| Error::other(e))?;
        PublicKey::from_parts(sign, seal).map_err(Error::from)
    }
}

#[derive(Serialize, Deserialize)]
struct JsonSealedKey {
    encapsulation: String,
    wrapped: String,
}

impl From<&SealedKey> for JsonSealedKey {
    fn from(k: &SealedKey) -> Self {
        Self { encapsulation: hex::encode(&k.encapsulation), wrapped: hex::encode(&k.wrapped) }
    }
}

impl JsonSealedKey {
    fn parse(&self) -> Result<SealedKey> {
        Ok(SealedKey {
            encapsulation: hex::decode(&self.encapsulation).map_err(|e| Error::other(e))?,
            wrapped: hex::decode(&self.wrapped).map_err(|e| Error::other(e))?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct JsonAclEntry {
    key: JsonKey,
    read: bool,
    write: bool,
    admin: bool,
    owner: bool,
    sealed_key: Option<JsonSealedKey>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonBlock {
    Immutable {
        address: String,
        owner: Option<JsonKey>,
        payload: String,
        salt: String,
    },
    Mutable {
        address: String,
        owner: JsonKey,
        salt: String,
        version: u64,
        payload: String,
        signature: String,
    },
    Acl {
        address: String,
        owner: JsonKey,
        salt: String,
        version: u64,
        payload: String,
        world_read: bool,
        world_write: bool,
        entries: Vec<JsonAclEntry>,
        encrypted: bool,
        owner_sealed_key: Option<JsonSealedKey>,
        signer: Option<JsonKey>,
        signature: String,
    },
    Named {
        address: String,
        owner: Option<JsonKey>,
        name: String,
        payload: String,
        signature: String,
    },
}

pub(super) fn to_json(block: &Block) -> Value {
    let json = match block {
        Block::Immutable(b) => JsonBlock::Immutable {
            address: block.address().to_string(),
            owner: b.owner.as_ref().map(JsonKey::from),
            payload: hex::encode(&b.payload),
            salt: hex::encode(&b.salt),
        },
        Block::Mutable(b) => JsonBlock::Mutable {
            address: block.address().to_string(),
            owner: JsonKey::from(&b.owner),
            salt: hex::encode(&b.salt),
            version: b.version,
            payload: hex::encode(&b.payload),
            signature: hex::encode(&b.signature),
        },
        Block::Acl(b) => JsonBlock::Acl {
            address: block.address().to_string(),
            owner: JsonKey::from(&b.owner),
            salt: hex::encode(&b.salt),
            version: b.version,
            payload: hex::encode(&b.payload),
            world_read: b.world_read,
            world_write: b.world_write,
            entries: b
                .entries
                .iter()
                .map(|e| JsonAclEntry {
                    key: JsonKey::from(&e.key),
                    read: e.read,
                    write: e.write,
                    admin: e.admin,
                    owner: e.owner,
                    sealed_key: e.sealed_key.as_ref().map(JsonSealedKey::from),
                })
                .collect(),
            encrypted: b.encrypted,
            owner_sealed_key: b.owner_sealed_key.as_ref().map(JsonSealedKey::from),
            signer: b.signer.as_ref().map(JsonKey::from),
            signature: hex::encode(&b.signature),
        },
        Block::Named(b) => JsonBlock::Named {
            address: block.address().to_string(),
            owner: b.owner.as_ref().map(JsonKey::from),
            name: hex::encode(&b.name),
            payload: hex::encode(&b.payload),
            signature: hex::encode(&b.signature),
        },
    };
    serde_json::to_value(json).unwrap_or(Value::Null)
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::other(e))
}

pub(super) fn from_json(value: &Value) -> Result<Block> {
    let json: JsonBlock =
        serde_json::from_value(value.clone()).map_err(|e| Error::other(e))?;
    let block = match json {
        JsonBlock::Immutable { owner, payload, salt, .. } => {
            Block::Immutable(ImmutableBlock::with_salt(
                decode_hex(&payload)?,
                owner.map(|k| k.parse()).transpose()?,
                decode_hex(&salt)?,
            ))
        }
        JsonBlock::Mutable { owner, salt, version, payload, signature, .. } => {
            Block::Mutable(MutableBlock {
                owner: owner.parse()?,
                salt: decode_hex(&salt)?,
                version,
                payload: decode_hex(&payload)?,
                signature: decode_hex(&signature)?,
            })
        }
        JsonBlock::Acl {
            owner,
            salt,
            version,
            payload,
            world_read,
            world_write,
            entries,
            encrypted,
            owner_sealed_key,
            signer,
            signature,
            ..
        } => {
            let mut block = AclBlock::new(owner.parse()?, encrypted);
            block.salt = decode_hex(&salt)?;
            block.version = version;
            block.payload = decode_hex(&payload)?;
            block.world_read = world_read;
            block.world_write = world_write;
            block.entries = entries
                .into_iter()
                .map(|e| {
                    Ok(AclEntry {
                        key: e.key.parse()?,
                        read: e.read,
                        write: e.write,
                        admin: e.admin,
                        owner: e.owner,
                        sealed_key: e.sealed_key.as_ref().map(|k| k.parse()).transpose()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            block.owner_sealed_key =
                owner_sealed_key.as_ref().map(|k| k.parse()).transpose()?;
            block.signer = signer.map(|k| k.parse()).transpose()?;
            block.signature = decode_hex(&signature)?;
            Block::Acl(block)
        }
        JsonBlock::Named { owner, name, payload, signature, .. } => Block::Named(NamedBlock {
            owner: owner.map(|k| k.parse()).transpose()?,
            name: decode_hex(&name)?,
            payload: decode_hex(&payload)?,
            signature: decode_hex(&signature)?,
        }),
    };
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn json_carries_the_address_for_inspection() {
        let kp = KeyPair::generate();
        let block = Block::Immutable(ImmutableBlock::new(b"x".to_vec(), Some(kp.public().clone())));
        let json = block.to_json();
        assert_eq!(json["kind"], "immutable");
        assert_eq!(json["address"], block.address().to_string());
    }

    #[test]
    fn malformed_json_is_rejected() {
        let bad = serde_json::json!({ "kind": "immutable", "payload": "zz", "salt": "", "owner": null, "address": "" });
        assert!(Block::from_json(&bad).is_err());
        assert!(Block::from_json(&serde_json::json!({ "kind": "unknown" })).is_err());
    }
}
