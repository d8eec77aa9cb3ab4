#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use meshwire::codec;
use meshwire::{
    Cipher, Config, ConnectionId, ControlPlane, Dataplane, Digest, Frame, ListenSocket,
    ManualTimeProvider, Peer, PeerId, TunDevice, WireError,
};

pub const DIGEST_LEN: usize = 16;

pub fn cipher(seed: u8) -> Cipher {
    Cipher::new([seed; 32], [seed.wrapping_add(1); 12])
}

pub fn digest(seed: u8) -> Digest {
    Digest::new([seed; 32], DIGEST_LEN)
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Records every collaborator call the data plane makes.
#[derive(Default)]
pub struct MockControlPlane {
    pub tcp_sent: Vec<(ConnectionId, Vec<u8>, i32)>,
    pub tcp_ok: bool,
    pub key_requests: Vec<PeerId>,
    pub rekeys: usize,
    pub terminated: Vec<(ConnectionId, bool)>,
    /// (sender, payload, priority) of every frame handed to routing.
    pub routed: Vec<(PeerId, Vec<u8>, i32)>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self { tcp_ok: true, ..Default::default() }
    }
}

impl ControlPlane for MockControlPlane {
    fn send_tcp_packet(&mut self, conn: ConnectionId, frame: &Frame) -> bool {
        self.tcp_sent.push((conn, frame.data().to_vec(), frame.priority));
        self.tcp_ok
    }

    fn send_req_key(&mut self, peer: PeerId) {
        self.key_requests.push(peer);
    }

    fn regenerate_key(&mut self) {
        self.rekeys += 1;
    }

    fn terminate_connection(&mut self, conn: ConnectionId, report: bool) {
        self.terminated.push((conn, report));
    }

    fn route(&mut self, from: PeerId, frame: &mut Frame) {
        self.routed.push((from, frame.data().to_vec(), frame.priority));
    }
}

#[derive(Default)]
pub struct MockDevice {
    pub written: Vec<Vec<u8>>,
    pub to_read: VecDeque<Vec<u8>>,
}

impl TunDevice for MockDevice {
    fn read_packet(&mut self, frame: &mut Frame) -> bool {
        match self.to_read.pop_front() {
            Some(data) => {
                *frame = Frame::from_data(&data).unwrap();
                true
            }
            None => false,
        }
    }

    fn write_packet(&mut self, frame: &Frame) {
        self.written.push(frame.data().to_vec());
    }
}

#[derive(Default)]
pub struct SocketState {
    pub ipv4: bool,
    pub sent: Vec<(Vec<u8>, SocketAddr)>,
    pub inbound: VecDeque<(Vec<u8>, SocketAddr)>,
    /// Sends larger than this fail as message-too-long.
    pub max_datagram: Option<usize>,
    pub tos: Vec<i32>,
}

/// In-memory listening socket; clones share the same state.
#[derive(Clone, Default)]
pub struct MockSocket {
    pub state: Rc<RefCell<SocketState>>,
}

impl MockSocket {
    pub fn new_v4() -> Self {
        let sock = Self::default();
        sock.state.borrow_mut().ipv4 = true;
        sock
    }

    pub fn push_inbound(&self, data: &[u8], from: SocketAddr) {
        self.state.borrow_mut().inbound.push_back((data.to_vec(), from));
    }

    pub fn set_max_datagram(&self, max: Option<usize>) {
        self.state.borrow_mut().max_datagram = max;
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.state.borrow().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.borrow().sent.len()
    }

    pub fn tos_values(&self) -> Vec<i32> {
        self.state.borrow().tos.clone()
    }
}

impl ListenSocket for MockSocket {
    fn is_ipv4(&self) -> bool {
        self.state.borrow().ipv4
    }

    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), WireError> {
        let mut state = self.state.borrow_mut();
        if let Some(max) = state.max_datagram {
            if data.len() > max {
                return Err(WireError::MessageTooLong);
            }
        }
        state.sent.push((data.to_vec(), addr));
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), WireError> {
        let mut state = self.state.borrow_mut();
        match state.inbound.pop_front() {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(WireError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "no datagram queued",
            ))),
        }
    }

    fn set_tos(&self, tos: i32) -> Result<(), WireError> {
        self.state.borrow_mut().tos.push(tos);
        Ok(())
    }
}

/// A data plane with one IPv4 listening socket and manual time.
pub fn dataplane(config: Config) -> (Dataplane, MockSocket, Arc<ManualTimeProvider>) {
    let time = Arc::new(ManualTimeProvider::new(Instant::now()));
    let mut seed_rng = StdRng::seed_from_u64(7);
    let mut dp = Dataplane::new(config, "local", time.clone(), &mut seed_rng);
    let sock = MockSocket::new_v4();
    dp.add_listen_socket(Box::new(sock.clone()));
    (dp, sock, time)
}

/// A reachable peer with a full set of session keys installed.
///
/// Outbound traffic uses `cipher(1)`/`digest(3)`; inbound traffic is
/// expected under `cipher(2)`/`digest(4)`, so [`encode_udp`] with those
/// parameters emulates the remote end.
pub fn ready_peer(dp: &mut Dataplane, name: &str, address: SocketAddr) -> PeerId {
    let mut peer = Peer::new(name, name, address);
    peer.status.reachable = true;
    peer.status.valid_key = true;
    peer.outcipher = Some(cipher(1));
    peer.outdigest = Some(digest(3));
    peer.incipher = Some(cipher(2));
    peer.indigest = Some(digest(4));
    dp.add_peer(peer)
}

/// Encodes a datagram the way the remote peer would put it on the wire.
pub fn encode_udp(
    payload: &[u8],
    seqno: u32,
    cipher: Option<&Cipher>,
    digest: Option<&Digest>,
    level: u8,
) -> Vec<u8> {
    let body = if level > 0 {
        let mut out = vec![0u8; payload.len() + 512];
        let n = codec::compress(level, payload, &mut out).unwrap();
        out.truncate(n);
        out
    } else {
        payload.to_vec()
    };
    let mut wire = seqno.to_be_bytes().to_vec();
    wire.extend_from_slice(&body);
    if let Some(c) = cipher {
        c.apply(&mut wire);
    }
    if let Some(d) = digest {
        let mut tag = vec![0u8; d.len()];
        d.create(&wire, &mut tag);
        wire.extend_from_slice(&tag);
    }
    wire
}

/// Decodes a captured datagram the way the remote peer would: verify the
/// MAC, strip it, undo the keystream, and split off the seqno.
pub fn decode_udp(
    wire: &[u8],
    cipher: Option<&Cipher>,
    digest: Option<&Digest>,
) -> (u32, Vec<u8>) {
    let mut region = wire.to_vec();
    if let Some(d) = digest {
        let tag_start = region.len() - d.len();
        let tag = region.split_off(tag_start);
        assert!(d.verify(&region, &tag), "MAC verification failed");
    }
    if let Some(c) = cipher {
        c.apply(&mut region);
    }
    let seqno = u32::from_be_bytes([region[0], region[1], region[2], region[3]]);
    (seqno, region[4..].to_vec())
}

/// A link-layer frame with a nonzero ethertype, so it never looks like a
/// probe.
pub fn data_frame(len: usize) -> Frame {
    let mut payload = vec![0u8; len];
    if len > 13 {
        payload[12] = 0x08;
        payload[13] = 0x00;
    }
    for (i, b) in payload.iter_mut().enumerate().skip(14) {
        *b = i as u8;
    }
    Frame::from_data(&payload).unwrap()
}

/// The payload of an MTU probe (or probe reply).
pub fn probe_payload(len: usize, reply: bool) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    for (i, b) in payload.iter_mut().enumerate().skip(14) {
        *b = (i * 7) as u8;
    }
    if reply {
        payload[0] = 1;
    }
    payload
}
