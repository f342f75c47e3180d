//! Peer authentication: exactly two round trips.
//!
//! `auth_syn` exchanges ids, passports and versions and carries a random
//! challenge back; `auth_ack` proves the dialer's key by signing the
//! challenge and seals a fresh session key to the listener's identity.
//! Both sides then switch to the encrypted channel stream. A version gap
//! degrades the connection to the lower of the two.

use super::transport::WirePair;
use crate::address::NodeId;
use crate::context::Context;
use crate::crypto::{SealedKey, SymmetricKey};
use crate::error::{Error, Result};
use crate::passport::Passport;
use crate::types::{Signature, Version};
use crate::wire;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

const CHALLENGE_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSyn {
    pub id: NodeId,
    pub passport: Passport,
    pub version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSynReply {
    pub id: NodeId,
    pub passport: Passport,
    pub challenge: Vec<u8>,
    pub version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAck {
    pub sealed_key: SealedKey,
    pub signed_challenge: Signature,
}

/// Outcome of either handshake role.
pub struct Handshake {
    pub remote_id: NodeId,
    pub remote_passport: Passport,
    /// Negotiated (lower) protocol version.
    pub version: Version,
    pub session_key: SymmetricKey,
}

fn check_passport(ctx: &Context, passport: &Passport) -> Result<()> {
    if !ctx.verify_passport(passport, false, false) {
        return Err(Error::HandshakeFailed("remote passport rejected".into()));
    }
    Ok(())
}

/// Dialer role.
pub async fn connect(ctx: &Context, wire: &mut WirePair) -> Result<Handshake> {
    let syn = AuthSyn {
        id: ctx.id,
        passport: ctx.passport.clone(),
        version: ctx.wire_version(),
    };
    wire.writer.send(&wire::to_bytes(&syn)?).await?;

    let reply: AuthSynReply = wire::from_bytes(&wire.reader.recv().await?)
        .map_err(|e| Error::HandshakeFailed(format!("bad auth_syn reply: {e}")))?;
    check_passport(ctx, &reply.passport)?;
    if reply.challenge.len() != CHALLENGE_SIZE {
        return Err(Error::HandshakeFailed("malformed challenge".into()));
    }

    let session_key = SymmetricKey::generate();
    let ack = AuthAck {
        sealed_key: reply.passport.user.seal(&session_key)?,
        signed_challenge: ctx.keys.sign(&reply.challenge),
    };
    wire.writer.send(&wire::to_bytes(&ack)?).await?;

    let version = reply.version.min(ctx.wire_version());
    debug!(remote = %reply.id, %version, "handshake complete (dialer)");
    Ok(Handshake {
        remote_id: reply.id,
        remote_passport: reply.passport,
        version,
        session_key,
    })
}

/// Listener role.
pub async fn accept(ctx: &Context, wire: &mut WirePair) -> Result<Handshake> {
    let syn: AuthSyn = wire::from_bytes(&wire.reader.recv().await?)
        .map_err(|e| Error::HandshakeFailed(format!("bad auth_syn: {e}")))?;
    check_passport(ctx, &syn.passport)?;

    let mut challenge = vec![0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut challenge);
    let reply = AuthSynReply {
        id: ctx.id,
        passport: ctx.passport.clone(),
        challenge: challenge.clone(),
        version: ctx.wire_version(),
    };
    wire.writer.send(&wire::to_bytes(&reply)?).await?;

    let ack: AuthAck = wire::from_bytes(&wire.reader.recv().await?)
        .map_err(|e| Error::HandshakeFailed(format!("bad auth_ack: {e}")))?;
    syn.passport
        .user
        .verify(&challenge, &ack.signed_challenge)
        .map_err(|_| Error::HandshakeFailed("challenge signature rejected".into()))?;
    let session_key = ctx
        .keys
        .unseal(&ack.sealed_key)
        .map_err(|_| Error::HandshakeFailed("session key unsealing failed".into()))?;

    let version = syn.version.min(ctx.wire_version());
    debug!(remote = %syn.id, %version, "handshake complete (listener)");
    Ok(Handshake {
        remote_id: syn.id,
        remote_passport: syn.passport,
        version,
        session_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, Protocol};
    use crate::crypto::KeyPair;
    use crate::dock::transport::{dial, Acceptor};
    use crate::passport::Capabilities;
    use std::time::Duration;

    fn context_pair() -> (Context, Context) {
        let owner = KeyPair::generate();
        let make = |config: NodeConfig| {
            let keys = KeyPair::generate();
            let passport = Passport::issue(
                &owner,
                keys.public().clone(),
                "burrow",
                Capabilities::default(),
            );
            Context::new(NodeId::random(), keys, owner.public().clone(), passport, config)
        };
        (make(NodeConfig::default()), make(NodeConfig::default()))
    }

    #[tokio::test]
    async fn both_sides_derive_the_same_session_key() {
        let (client_ctx, server_ctx) = context_pair();
        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let server_id = server_ctx.id;
        let client_id = client_ctx.id;

        let server = tokio::spawn(async move {
            let mut pair = acceptor.accept().await.unwrap();
            accept(&server_ctx, &mut pair).await.unwrap()
        });

        let mut pair = dial(addr, Protocol::Tcp, Duration::from_secs(5)).await.unwrap();
        let client_side = connect(&client_ctx, &mut pair).await.unwrap();
        let server_side = server.await.unwrap();

        assert_eq!(client_side.remote_id, server_id);
        assert_eq!(server_side.remote_id, client_id);
        // Shared secret: what one encrypts the other decrypts.
        let ct = client_side.session_key.encrypt(b"channel probe").unwrap();
        assert_eq!(server_side.session_key.decrypt(&ct).unwrap(), b"channel probe");
    }

    #[tokio::test]
    async fn foreign_network_passport_is_rejected() {
        let (client_ctx, server_ctx) = context_pair();
        // A passport from an unrelated owner does not verify.
        let rogue_owner = KeyPair::generate();
        let rogue_keys = KeyPair::generate();
        let rogue_passport = Passport::issue(
            &rogue_owner,
            rogue_keys.public().clone(),
            "burrow",
            Capabilities::default(),
        );
        let rogue_ctx = Context::new(
            NodeId::random(),
            rogue_keys,
            rogue_owner.public().clone(),
            rogue_passport,
            NodeConfig::default(),
        );
        drop(client_ctx);

        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        let addr = acceptor.local_addr();

        let server = tokio::spawn(async move {
            let mut pair = acceptor.accept().await.unwrap();
            accept(&server_ctx, &mut pair).await
        });

        let mut pair = dial(addr, Protocol::Tcp, Duration::from_secs(5)).await.unwrap();
        // The dialer side may fail at either step; the listener must fail.
        let _ = connect(&rogue_ctx, &mut pair).await;
        assert!(matches!(server.await.unwrap(), Err(Error::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn version_negotiation_picks_the_lower() {
        let (client_ctx, server_ctx) = context_pair();
        let old = Version::new(0, 2, 0);
        let client_ctx = Context::new(
            client_ctx.id,
            client_ctx.keys.clone(),
            client_ctx.owner.clone(),
            client_ctx.passport.clone(),
            NodeConfig { compatibility_version: Some(old), ..NodeConfig::default() },
        );

        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let server = tokio::spawn(async move {
            let mut pair = acceptor.accept().await.unwrap();
            accept(&server_ctx, &mut pair).await.unwrap()
        });

        let mut pair = dial(addr, Protocol::Tcp, Duration::from_secs(5)).await.unwrap();
        let client_side = connect(&client_ctx, &mut pair).await.unwrap();
        let server_side = server.await.unwrap();
        assert_eq!(client_side.version, old);
        assert_eq!(server_side.version, old);
    }
}
