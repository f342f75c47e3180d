//! Raw framed transports under the encrypted channel layer.
//!
//! Both transports move whole frames: TCP with a 4-byte length prefix,
//! UTP as reliable ordered datagrams over UDP. The dock picks per the
//! configured protocol preference and treats the result uniformly.

use super::utp::{UtpListener, UtpStream};
use crate::config::Protocol;
use crate::wire::MAX_PAYLOAD_SIZE;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Frame cap: the 2 MB payload limit plus envelope and AEAD overhead.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 64 * 1024;

#[async_trait]
pub trait WireReader: Send {
    async fn recv(&mut self) -> io::Result<Vec<u8>>;
}

#[async_trait]
pub trait WireWriter: Send {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// A connected transport, split for full-duplex use.
pub struct WirePair {
    pub reader: Box<dyn WireReader>,
    pub writer: Box<dyn WireWriter>,
    pub peer_addr: SocketAddr,
}

// =============================================================================
// TCP FRAMING
// =============================================================================

struct TcpWireReader(OwnedReadHalf);

#[async_trait]
impl WireReader for TcpWireReader {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.0.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {len}"),
            ));
        }
        let mut frame = vec![0u8; len];
        self.0.read_exact(&mut frame).await?;
        Ok(frame)
    }
}

struct TcpWireWriter(OwnedWriteHalf);

#[async_trait]
impl WireWriter for TcpWireWriter {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {}", frame.len()),
            ));
        }
        self.0.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        self.0.write_all(frame).await?;
        self.0.flush().await
    }
}

fn tcp_pair(stream: TcpStream) -> io::Result<WirePair> {
    stream.set_nodelay(true)?;
    let peer_addr = stream.peer_addr()?;
    let (read, write) = stream.into_split();
    Ok(WirePair {
        reader: Box::new(TcpWireReader(read)),
        writer: Box::new(TcpWireWriter(write)),
        peer_addr,
    })
}

// =============================================================================
// UTP FRAMING
// =============================================================================

struct UtpWireReader(crate::dock::utp::UtpReadHalf);

#[async_trait]
impl WireReader for UtpWireReader {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        self.0.recv().await
    }
}

struct UtpWireWriter(crate::dock::utp::UtpWriteHalf);

#[async_trait]
impl WireWriter for UtpWireWriter {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.0.send(frame).await
    }
}

fn utp_pair(stream: UtpStream) -> WirePair {
    let peer_addr = stream.peer_addr();
    let (read, write) = stream.split();
    WirePair {
        reader: Box::new(UtpWireReader(read)),
        writer: Box::new(UtpWireWriter(write)),
        peer_addr,
    }
}

// =============================================================================
// DIAL / LISTEN
// =============================================================================

/// Dial one endpoint honoring the protocol preference: TCP first, UTP as
/// the fallback when both are allowed.
pub async fn dial(
    addr: SocketAddr,
    protocol: Protocol,
    timeout: Duration,
) -> io::Result<WirePair> {
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no transport enabled");
    if protocol.with_tcp() {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "dialed over tcp");
                return tcp_pair(stream);
            }
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = io::Error::new(io::ErrorKind::TimedOut, "tcp dial timed out"),
        }
    }
    if protocol.with_utp() {
        match tokio::time::timeout(timeout, UtpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "dialed over utp");
                return Ok(utp_pair(stream));
            }
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = io::Error::new(io::ErrorKind::TimedOut, "utp dial timed out"),
        }
    }
    Err(last_err)
}

/// Accepts inbound connections over every enabled transport on one port.
pub struct Acceptor {
    tcp: Option<TcpListener>,
    utp: Option<UtpListener>,
    local_addr: SocketAddr,
}

impl Acceptor {
    pub async fn bind(addr: SocketAddr, protocol: Protocol) -> io::Result<Self> {
        let tcp = if protocol.with_tcp() {
            Some(TcpListener::bind(addr).await?)
        } else {
            None
        };
        // Reuse the concrete TCP port for UDP so one advertised endpoint
        // serves both transports.
        let bound = tcp
            .as_ref()
            .map(|l| l.local_addr())
            .transpose()?
            .unwrap_or(addr);
        let utp = if protocol.with_utp() {
            Some(UtpListener::bind(bound).await?)
        } else {
            None
        };
        let local_addr = match (&tcp, &utp) {
            (Some(l), _) => l.local_addr()?,
            (None, Some(l)) => l.local_addr(),
            (None, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no transport enabled",
                ))
            }
        };
        Ok(Self { tcp, utp, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&mut self) -> io::Result<WirePair> {
        match (&mut self.tcp, &mut self.utp) {
            (Some(tcp), Some(utp)) => tokio::select! {
                res = tcp.accept() => res.and_then(|(stream, _)| tcp_pair(stream)),
                res = utp.accept() => res.map(utp_pair),
            },
            (Some(tcp), None) => tcp.accept().await.and_then(|(stream, _)| tcp_pair(stream)),
            (None, Some(utp)) => utp.accept().await.map(utp_pair),
            (None, None) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no transport enabled",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_frames_roundtrip() {
        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Protocol::Tcp)
            .await
            .unwrap();
        let addr = acceptor.local_addr();

        let server = tokio::spawn(async move {
            let mut pair = acceptor.accept().await.unwrap();
            let frame = pair.reader.recv().await.unwrap();
            pair.writer.send(&frame).await.unwrap();
        });

        let mut pair = dial(addr, Protocol::Tcp, Duration::from_secs(5)).await.unwrap();
        pair.writer.send(b"framed payload").await.unwrap();
        assert_eq!(pair.reader.recv().await.unwrap(), b"framed payload");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn utp_frames_roundtrip() {
        let mut acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap(), Protocol::Utp)
            .await
            .unwrap();
        let addr = acceptor.local_addr();

        let server = tokio::spawn(async move {
            let mut pair = acceptor.accept().await.unwrap();
            let frame = pair.reader.recv().await.unwrap();
            pair.writer.send(&frame).await.unwrap();
        });

        let mut pair = dial(addr, Protocol::Utp, Duration::from_secs(5)).await.unwrap();
        // Large enough to need several datagrams.
        let frame = vec![0x5a; 10_000];
        pair.writer.send(&frame).await.unwrap();
        assert_eq!(pair.reader.recv().await.unwrap(), frame);
        server.await.unwrap();
    }
}
