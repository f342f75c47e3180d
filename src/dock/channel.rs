//! Encrypted, channel-multiplexed RPC stream.
//!
//! After the handshake every frame is AEAD-encrypted under the session
//! key. Frames carry a channel id; many logical calls interleave on one
//! socket and each response finds its caller through the pending map.
//! Both directions are symmetric: either side may issue requests.

use super::handshake::Handshake;
use super::rpc::{RemoteInfo, RpcHandler};
use super::transport::WirePair;
use crate::crypto::SymmetricKey;
use crate::error::{Error, Result};
use crate::wire;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

#[derive(Debug, Serialize, Deserialize)]
enum FramePayload {
    Request { name: String, body: Vec<u8> },
    Response { result: std::result::Result<Vec<u8>, Error> },
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    channel: u64,
    payload: FramePayload,
}

/// Keepalive handled inside the channel layer, below the RPC dispatcher.
pub const RPC_PING: &str = "ping";

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>>>>>>;

pub struct Connection {
    info: RemoteInfo,
    peer_addr: SocketAddr,
    out_tx: mpsc::Sender<Frame>,
    pending: Pending,
    next_channel: AtomicU64,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    rpc_timeout: Duration,
}

impl Connection {
    /// Wrap an authenticated wire and start its reader/writer tasks.
    pub fn spawn(
        wire: WirePair,
        handshake: Handshake,
        handler: Arc<dyn RpcHandler>,
        rpc_timeout: Duration,
    ) -> Arc<Connection> {
        let info = RemoteInfo {
            id: handshake.remote_id,
            passport: handshake.remote_passport,
            version: handshake.version,
        };
        let (out_tx, out_rx) = mpsc::channel::<Frame>(64);
        let (close_tx, close_rx) = watch::channel(false);
        let connection = Arc::new(Connection {
            info,
            peer_addr: wire.peer_addr,
            out_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_channel: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            close_tx,
            rpc_timeout,
        });

        let key = handshake.session_key;
        tokio::spawn(writer_task(
            wire.writer,
            key.clone(),
            out_rx,
            close_rx.clone(),
            connection.clone(),
        ));
        tokio::spawn(reader_task(wire.reader, key, handler, close_rx, connection.clone()));
        connection
    }

    pub fn info(&self) -> &RemoteInfo {
        &self.info
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Calls still waiting for their response.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    /// Tear the connection down; pending calls fail with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(remote = %self.info.id, "closing connection");
            let _ = self.close_tx.send(true);
            let mut pending = self.pending.lock().expect("pending map poisoned");
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
    }

    pub async fn call_raw(&self, name: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let channel = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(channel, tx);

        let frame = Frame {
            channel,
            payload: FramePayload::Request { name: name.to_string(), body },
        };
        if self.out_tx.send(frame).await.is_err() {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&channel);
            return Err(Error::ConnectionClosed);
        }

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&channel);
                Err(Error::TimeOut)
            }
        }
    }

    /// Typed call: postcard request in, postcard response out.
    pub async fn call<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = wire::to_bytes(request)?;
        let reply = self.call_raw(name, body).await?;
        Ok(wire::from_bytes(&reply)?)
    }

    pub async fn ping(&self) -> Result<()> {
        self.call_raw(RPC_PING, Vec::new()).await.map(|_| ())
    }
}

async fn writer_task(
    mut writer: Box<dyn super::transport::WireWriter>,
    key: SymmetricKey,
    mut out_rx: mpsc::Receiver<Frame>,
    mut close_rx: watch::Receiver<bool>,
    connection: Arc<Connection>,
) {
    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let plain = match wire::to_bytes(&frame) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("frame encoding failed: {e}");
                        continue;
                    }
                };
                let sealed = match key.encrypt(&plain) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("frame encryption failed: {e}");
                        break;
                    }
                };
                if let Err(e) = writer.send(&sealed).await {
                    trace!("connection write failed: {e}");
                    break;
                }
            }
            _ = close_rx.changed() => break,
        }
    }
    connection.close();
}

async fn reader_task(
    mut reader: Box<dyn super::transport::WireReader>,
    key: SymmetricKey,
    handler: Arc<dyn RpcHandler>,
    mut close_rx: watch::Receiver<bool>,
    connection: Arc<Connection>,
) {
    loop {
        let sealed = tokio::select! {
            res = reader.recv() => match res {
                Ok(frame) => frame,
                Err(e) => {
                    trace!("connection read failed: {e}");
                    break;
                }
            },
            _ = close_rx.changed() => break,
        };
        let plain = match key.decrypt(&sealed) {
            Ok(p) => p,
            Err(_) => {
                // Tampered or garbled traffic: drop the connection, the
                // AEAD leaves nothing to salvage.
                warn!(remote = %connection.info().id, "undecryptable frame, closing");
                break;
            }
        };
        let frame: Frame = match wire::from_bytes(&plain) {
            Ok(f) => f,
            Err(e) => {
                warn!("malformed frame: {e}");
                break;
            }
        };
        match frame.payload {
            FramePayload::Response { result } => {
                let waiter = connection
                    .pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&frame.channel);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(Error::from));
                    }
                    None => trace!("response for unknown channel {}", frame.channel),
                }
            }
            FramePayload::Request { name, body } => {
                if name == RPC_PING {
                    let pong = Frame {
                        channel: frame.channel,
                        payload: FramePayload::Response { result: Ok(Vec::new()) },
                    };
                    let _ = connection.out_tx.send(pong).await;
                    continue;
                }
                let handler = handler.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    let result = handler.handle(connection.info(), &name, &body).await;
                    let reply = Frame {
                        channel: frame.channel,
                        payload: FramePayload::Response { result },
                    };
                    let _ = connection.out_tx.send(reply).await;
                });
            }
        }
    }
    connection.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, Protocol};
    use crate::crypto::KeyPair;
    use crate::dock::handshake;
    use crate::dock::transport::{dial, Acceptor};
    use crate::passport::{Capabilities, Passport};
    use crate::Context;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, _remote: &RemoteInfo, name: &str, body: &[u8]) -> Result<Vec<u8>> {
            match name {
                "echo" => Ok(body.to_vec()),
                "fail" => Err(Error::PermissionDenied),
                other => Err(Error::other(format!("unknown rpc {other}"))),
            }
        }
    }

    async fn connected_pair() -> (Arc<Connection>, Arc<Connection>) {
        let owner = KeyPair::generate();
        let make = || {
            let keys = KeyPair::generate();
            let passport = Passport::issue(
                &owner,
                keys.public().clone(),
                "burrow",
                Capabilities::default(),
            );
            Context::new(
                crate::NodeId::random(),
                keys,
                owner.public().clone(),
                passport,
                NodeConfig::default(),
            )
        };
        let (client_ctx, server_ctx) = (make(), make());

        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        let addr = acceptor.local_addr();
        let server = tokio::spawn(async move {
            let mut pair = acceptor.accept().await.unwrap();
            let hs = handshake::accept(&server_ctx, &mut pair).await.unwrap();
            Connection::spawn(pair, hs, Arc::new(Echo), Duration::from_secs(5))
        });

        let mut pair = dial(addr, Protocol::Tcp, Duration::from_secs(5)).await.unwrap();
        let hs = handshake::connect(&client_ctx, &mut pair).await.unwrap();
        let client = Connection::spawn(pair, hs, Arc::new(Echo), Duration::from_secs(5));
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn calls_multiplex_in_both_directions() {
        let (client, server) = connected_pair().await;

        let a = client.call_raw("echo", b"one".to_vec());
        let b = client.call_raw("echo", b"two".to_vec());
        let c = server.call_raw("echo", b"reverse".to_vec());
        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!(a.unwrap(), b"one");
        assert_eq!(b.unwrap(), b"two");
        assert_eq!(c.unwrap(), b"reverse");
    }

    #[tokio::test]
    async fn typed_errors_cross_the_wire() {
        let (client, _server) = connected_pair().await;
        assert!(matches!(
            client.call_raw("fail", Vec::new()).await,
            Err(Error::PermissionDenied)
        ));
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        let (client, server) = connected_pair().await;
        server.close();
        // The client side notices on its next call.
        let mut saw_closed = false;
        for _ in 0..10 {
            match client.call_raw("echo", b"x".to_vec()).await {
                Err(Error::ConnectionClosed) => {
                    saw_closed = true;
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        assert!(saw_closed);
    }
}
