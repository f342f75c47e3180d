//! Cross-version serialization gate.
//!
//! A block serialized at an older version must deserialize at the
//! current one, validate, and re-serialize byte-for-byte identically at
//! the older version. Anonymous fixtures with fixed salts pin exact wire
//! bytes so format drift fails loudly.

use burrow::blocks::{AclBlock, Block, ImmutableBlock, MutableBlock, NamedBlock};
use burrow::crypto::KeyPair;
use burrow::types::Version;

const V1: Version = Version::new(0, 1, 0);
const V2: Version = Version::new(0, 2, 0);

fn sample_blocks() -> Vec<Block> {
    let owner = KeyPair::generate();
    let reader = KeyPair::generate();

    let mut mutable = MutableBlock::new(owner.public().clone());
    mutable.set_payload(b"mutable payload".to_vec());
    mutable.seal(&owner).unwrap();

    let mut acl = AclBlock::new(owner.public().clone(), true);
    acl.grant(reader.public().clone(), true, false, false);
    acl.set_payload(b"acl payload".to_vec());
    acl.seal(&owner).unwrap();

    vec![
        Block::Immutable(ImmutableBlock::new(
            b"immutable payload".to_vec(),
            Some(owner.public().clone()),
        )),
        Block::Mutable(mutable),
        Block::Acl(acl),
        Block::Named(NamedBlock::new(&owner, b"name".to_vec(), b"named payload".to_vec())),
    ]
}

#[test]
fn old_bytes_deserialize_and_reserialize_identically() {
    for block in sample_blocks() {
        for version in [V1, V2, Version::CURRENT] {
            let old_bytes = block.to_wire(version).unwrap();
            let restored = Block::from_wire(&old_bytes).unwrap();
            restored.validate().unwrap_or_else(|e| {
                // The 0.1.x immutable format drops the salt, so a salted
                // block cannot revalidate there; every other combination
                // must.
                let salted_at_v1 = version == V1
                    && matches!(&block, Block::Immutable(b) if !b.salt.is_empty());
                assert!(salted_at_v1, "{block} failed to revalidate at {version}: {e}");
            });
            assert_eq!(
                restored.to_wire(version).unwrap(),
                old_bytes,
                "round trip at {version} must be byte identical"
            );
        }
    }
}

#[test]
fn version_negotiated_serialization_differs_where_it_should() {
    let blocks = sample_blocks();
    for block in &blocks {
        let old = block.to_wire(V2).unwrap();
        let new = block.to_wire(Version::CURRENT).unwrap();
        // 0.2.0 and current share the body; only the envelope version
        // triple moves.
        assert_eq!(&old[4..], &new[4..]);
        assert_eq!(&old[..3], &[0, 2, 0]);
        assert_eq!(&new[..3], &[0, 3, 0]);
    }

    // The 0.1.x immutable body genuinely differs: no salt field.
    let salted = Block::Immutable(ImmutableBlock::with_salt(
        b"payload".to_vec(),
        None,
        b"salted".to_vec(),
    ));
    let v1 = salted.to_wire(V1).unwrap();
    let v2 = salted.to_wire(V2).unwrap();
    assert_ne!(&v1[4..], &v2[4..]);
}

#[test]
fn pinned_wire_bytes_for_anonymous_content() {
    // Fully deterministic fixture: null owner, fixed payload, empty salt.
    let block = Block::Immutable(ImmutableBlock::with_salt(b"pin".to_vec(), None, Vec::new()));

    // Envelope: version triple + tag, then postcard fields in order:
    // owner (None), payload (len-prefixed), salt (len-prefixed).
    let v2 = block.to_wire(V2).unwrap();
    assert_eq!(v2, vec![0, 2, 0, 1, 0x00, 3, b'p', b'i', b'n', 0]);

    // The 0.1.x format has no salt field at all.
    let v1 = block.to_wire(V1).unwrap();
    assert_eq!(v1, vec![0, 1, 0, 1, 0x00, 3, b'p', b'i', b'n']);

    assert_eq!(Block::from_wire(&v2).unwrap(), block);
    assert_eq!(Block::from_wire(&v1).unwrap(), block);
}

#[test]
fn unsupported_versions_are_refused() {
    let block = Block::Immutable(ImmutableBlock::with_salt(b"x".to_vec(), None, Vec::new()));
    let mut bytes = block.to_wire(Version::CURRENT).unwrap();
    bytes[0] = 9; // a future major version
    assert!(Block::from_wire(&bytes).is_err());
    bytes[0] = 0;
    bytes[1] = 0; // below the lowest supported
    assert!(Block::from_wire(&bytes).is_err());
}
