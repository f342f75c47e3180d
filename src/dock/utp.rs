//! UTP: reliable ordered frames over UDP.
//!
//! A compact transport for NAT-friendly peering: frames are cut into
//! segments, delivered in order under cumulative acks, retransmitted on a
//! doubling timer. Go-back-N with a fixed window — throughput is not the
//! point, reliable framing over UDP is.
//!
//! Wire packets are postcard-encoded; connections are demultiplexed by
//! remote address.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Payload bytes per datagram; stays under common MTUs with headroom for
/// the packet header.
const SEGMENT_SIZE: usize = 1200;

/// Segments in flight before the sender stalls on acks.
const WINDOW: u64 = 64;

/// Retransmission timer: doubles from 200 ms to 3 s, then the connection
/// is declared dead after 8 silent attempts.
const RTO_INITIAL: Duration = Duration::from_millis(200);
const RTO_CAP: Duration = Duration::from_secs(3);
const MAX_RETRIES: u32 = 8;

/// Handshake retry cadence.
const SYN_RETRIES: u32 = 5;
const SYN_TIMEOUT: Duration = Duration::from_millis(500);

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Packet {
    Syn,
    SynAck,
    Data { seq: u64, last: bool, payload: Vec<u8> },
    /// Cumulative: every segment below `upto` arrived.
    Ack { upto: u64 },
    Fin,
}

fn encode(packet: &Packet) -> Vec<u8> {
    postcard::to_allocvec(packet).unwrap_or_default()
}

fn decode(data: &[u8]) -> Option<Packet> {
    postcard::from_bytes(data).ok()
}

// =============================================================================
// PACKET I/O
// =============================================================================

/// Where an engine reads packets from: its own connected socket, or a
/// channel fed by the listener's demultiplexer.
enum PacketSource {
    Dedicated(Arc<UdpSocket>),
    Demuxed(mpsc::Receiver<Packet>),
}

impl PacketSource {
    async fn recv(&mut self) -> Option<Packet> {
        match self {
            PacketSource::Dedicated(socket) => {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(n) => {
                            if let Some(packet) = decode(&buf[..n]) {
                                return Some(packet);
                            }
                            // Unparseable datagram: ignore and keep reading.
                        }
                        Err(_) => return None,
                    }
                }
            }
            PacketSource::Demuxed(rx) => rx.recv().await,
        }
    }
}

#[derive(Clone)]
struct PacketSink {
    socket: Arc<UdpSocket>,
    /// None when the socket is connected to the remote.
    remote: Option<SocketAddr>,
}

impl PacketSink {
    async fn send(&self, packet: &Packet) {
        let bytes = encode(packet);
        let res = match self.remote {
            Some(addr) => self.socket.send_to(&bytes, addr).await,
            None => self.socket.send(&bytes).await,
        };
        if let Err(e) = res {
            trace!("utp send failed: {e}");
        }
    }
}

// =============================================================================
// STREAM HALVES
// =============================================================================

pub struct UtpStream {
    read: UtpReadHalf,
    write: UtpWriteHalf,
    peer: SocketAddr,
}

pub struct UtpReadHalf {
    frames: mpsc::Receiver<Vec<u8>>,
}

impl UtpReadHalf {
    pub async fn recv(&mut self) -> io::Result<Vec<u8>> {
        self.frames
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "utp connection closed"))
    }
}

pub struct UtpWriteHalf {
    frames: mpsc::Sender<Vec<u8>>,
}

impl UtpWriteHalf {
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        if frame.len() > super::transport::MAX_FRAME_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        self.frames
            .send(frame.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "utp connection closed"))
    }
}

impl UtpStream {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn split(self) -> (UtpReadHalf, UtpWriteHalf) {
        (self.read, self.write)
    }

    /// Dial: dedicated socket, Syn/SynAck exchange, then the engine runs
    /// the window.
    pub async fn connect(addr: SocketAddr) -> io::Result<UtpStream> {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(addr).await?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut attempts = 0;
        loop {
            socket.send(&encode(&Packet::Syn)).await?;
            match tokio::time::timeout(SYN_TIMEOUT, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    if matches!(decode(&buf[..n]), Some(Packet::SynAck)) {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    attempts += 1;
                    if attempts >= SYN_RETRIES {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "utp handshake timed out",
                        ));
                    }
                }
            }
        }

        let sink = PacketSink { socket: socket.clone(), remote: None };
        Ok(spawn_engine(addr, PacketSource::Dedicated(socket), sink, None))
    }
}

// =============================================================================
// LISTENER
// =============================================================================

type ConnTable = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Packet>>>>;

pub struct UtpListener {
    accepted: mpsc::Receiver<UtpStream>,
    local_addr: SocketAddr,
}

impl UtpListener {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accepted) = mpsc::channel(16);
        tokio::spawn(demux(socket, accept_tx));
        Ok(Self { accepted, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&mut self) -> io::Result<UtpStream> {
        self.accepted
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "utp listener closed"))
    }
}

/// Listener loop: route datagrams to per-connection engines, spawning one
/// per new Syn.
async fn demux(socket: Arc<UdpSocket>, accept_tx: mpsc::Sender<UtpStream>) {
    let table: ConnTable = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!("utp listener socket error: {e}");
                return;
            }
        };
        let Some(packet) = decode(&buf[..n]) else { continue };

        let existing = table.lock().expect("utp table poisoned").get(&from).cloned();
        match existing {
            Some(tx) => {
                // Engine gone mid-route: drop, the peer will retransmit.
                let _ = tx.try_send(packet);
            }
            None => {
                if !matches!(packet, Packet::Syn) {
                    continue;
                }
                debug!(%from, "utp connection accepted");
                let (pkt_tx, pkt_rx) = mpsc::channel(256);
                table.lock().expect("utp table poisoned").insert(from, pkt_tx);
                let sink = PacketSink { socket: socket.clone(), remote: Some(from) };
                sink.send(&Packet::SynAck).await;
                let stream = spawn_engine(
                    from,
                    PacketSource::Demuxed(pkt_rx),
                    sink,
                    Some((table.clone(), from)),
                );
                if accept_tx.send(stream).await.is_err() {
                    return;
                }
            }
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

struct SendState {
    /// Segments handed to the wire, awaiting ack. Front = lowest seq.
    unacked: VecDeque<(u64, bool, Vec<u8>)>,
    /// Segments not yet transmitted.
    queued: VecDeque<(u64, bool, Vec<u8>)>,
    next_seq: u64,
    retries: u32,
}

impl SendState {
    fn enqueue_frame(&mut self, frame: Vec<u8>) {
        if frame.is_empty() {
            self.queued.push_back((self.next_seq, true, Vec::new()));
            self.next_seq += 1;
            return;
        }
        let chunks: Vec<&[u8]> = frame.chunks(SEGMENT_SIZE).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.queued
                .push_back((self.next_seq, i + 1 == count, chunk.to_vec()));
            self.next_seq += 1;
        }
    }

    fn window_open(&self) -> bool {
        (self.unacked.len() as u64) < WINDOW && !self.queued.is_empty()
    }

    fn ack(&mut self, upto: u64) {
        let before = self.unacked.len();
        while matches!(self.unacked.front(), Some((seq, _, _)) if *seq < upto) {
            self.unacked.pop_front();
        }
        if self.unacked.len() != before {
            self.retries = 0;
        }
    }

    fn idle(&self) -> bool {
        self.unacked.is_empty() && self.queued.is_empty()
    }
}

struct RecvState {
    expected: u64,
    /// Out-of-order stash, bounded by the sender window.
    pending: BTreeMap<u64, (bool, Vec<u8>)>,
    assembling: Vec<u8>,
}

impl RecvState {
    /// Returns completed frames in delivery order.
    fn push(&mut self, seq: u64, last: bool, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if seq >= self.expected && seq < self.expected + 4 * WINDOW {
            self.pending.insert(seq, (last, payload));
        }
        let mut frames = Vec::new();
        while let Some((last, payload)) = self.pending.remove(&self.expected) {
            self.expected += 1;
            self.assembling.extend_from_slice(&payload);
            if last {
                frames.push(std::mem::take(&mut self.assembling));
            }
        }
        frames
    }
}

fn spawn_engine(
    peer: SocketAddr,
    source: PacketSource,
    sink: PacketSink,
    table_entry: Option<(ConnTable, SocketAddr)>,
) -> UtpStream {
    let (frame_in_tx, frame_in_rx) = mpsc::channel::<Vec<u8>>(64);
    let (frame_out_tx, frame_out_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        run_engine(source, sink, frame_out_rx, frame_in_tx).await;
        if let Some((table, addr)) = table_entry {
            table.lock().expect("utp table poisoned").remove(&addr);
        }
    });
    UtpStream {
        read: UtpReadHalf { frames: frame_in_rx },
        write: UtpWriteHalf { frames: frame_out_tx },
        peer,
    }
}

async fn run_engine(
    mut source: PacketSource,
    sink: PacketSink,
    mut app_out: mpsc::Receiver<Vec<u8>>,
    app_in: mpsc::Sender<Vec<u8>>,
) {
    let mut send = SendState {
        unacked: VecDeque::new(),
        queued: VecDeque::new(),
        next_seq: 0,
        retries: 0,
    };
    let mut recv = RecvState { expected: 0, pending: BTreeMap::new(), assembling: Vec::new() };
    let mut app_closed = false;

    loop {
        // Fill the window before waiting.
        while send.window_open() {
            let (seq, last, payload) = send.queued.pop_front().expect("window_open checked");
            sink.send(&Packet::Data { seq, last, payload: payload.clone() }).await;
            send.unacked.push_back((seq, last, payload));
        }

        if app_closed && send.idle() {
            sink.send(&Packet::Fin).await;
            return;
        }

        let rto = {
            let factor = 1u32 << send.retries.min(4);
            (RTO_INITIAL * factor).min(RTO_CAP)
        };

        tokio::select! {
            frame = app_out.recv(), if !app_closed => {
                match frame {
                    Some(frame) => send.enqueue_frame(frame),
                    None => app_closed = true,
                }
            }
            packet = source.recv() => {
                let Some(packet) = packet else { return };
                match packet {
                    Packet::Syn => sink.send(&Packet::SynAck).await,
                    Packet::SynAck => {}
                    Packet::Data { seq, last, payload } => {
                        let frames = recv.push(seq, last, payload);
                        sink.send(&Packet::Ack { upto: recv.expected }).await;
                        for frame in frames {
                            if app_in.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Packet::Ack { upto } => send.ack(upto),
                    Packet::Fin => return,
                }
            }
            _ = tokio::time::sleep(rto), if !send.unacked.is_empty() => {
                send.retries += 1;
                if send.retries > MAX_RETRIES {
                    debug!("utp retransmission limit reached, dropping connection");
                    return;
                }
                for (seq, last, payload) in send.unacked.iter() {
                    sink.send(&Packet::Data {
                        seq: *seq,
                        last: *last,
                        payload: payload.clone(),
                    }).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_exchange_frames() {
        let mut listener = UtpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let stream = listener.accept().await.unwrap();
            let (mut read, mut write) = stream.split();
            let frame = read.recv().await.unwrap();
            write.send(&frame).await.unwrap();
        });

        let stream = UtpStream::connect(addr).await.unwrap();
        let (mut read, mut write) = stream.split();
        write.send(b"ping over udp").await.unwrap();
        assert_eq!(read.recv().await.unwrap(), b"ping over udp");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn multi_segment_frames_reassemble() {
        let mut listener = UtpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let stream = listener.accept().await.unwrap();
            let (mut read, mut write) = stream.split();
            for _ in 0..3 {
                let frame = read.recv().await.unwrap();
                write.send(&frame).await.unwrap();
            }
        });

        let stream = UtpStream::connect(addr).await.unwrap();
        let (mut read, mut write) = stream.split();
        for size in [1usize, SEGMENT_SIZE, SEGMENT_SIZE * 10 + 17] {
            let frame: Vec<u8> = (0..size).map(|i| i as u8).collect();
            write.send(&frame).await.unwrap();
            assert_eq!(read.recv().await.unwrap(), frame);
        }
        server.await.unwrap();
    }

    #[test]
    fn receiver_reorders_segments() {
        let mut recv = RecvState { expected: 0, pending: BTreeMap::new(), assembling: Vec::new() };
        assert!(recv.push(1, true, b"world".to_vec()).is_empty());
        let frames = recv.push(0, false, b"hello ".to_vec());
        assert_eq!(frames, vec![b"hello world".to_vec()]);
        assert_eq!(recv.expected, 2);
    }

    #[test]
    fn cumulative_ack_drops_acknowledged_segments() {
        let mut send = SendState {
            unacked: VecDeque::new(),
            queued: VecDeque::new(),
            next_seq: 0,
            retries: 3,
        };
        send.enqueue_frame(vec![0u8; SEGMENT_SIZE * 3]);
        while send.window_open() {
            let seg = send.queued.pop_front().unwrap();
            send.unacked.push_back(seg);
        }
        assert_eq!(send.unacked.len(), 3);
        send.ack(2);
        assert_eq!(send.unacked.len(), 1);
        assert_eq!(send.retries, 0);
    }
}
