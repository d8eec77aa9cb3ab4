//! Per-peer and per-connection state containers.
//!
//! These are passive: the control plane creates them and writes the
//! identity, status, crypto, and routing fields; the pipelines mutate only
//! the sequence counters, the replay window, and the MTU estimate.

use std::fmt;
use std::net::SocketAddr;

use crate::codec::{Cipher, Digest};
use crate::mtu::MtuState;
use crate::replay::ReplayWindow;

/// Identifies a peer in the data plane's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Placeholder for routing hooks not yet pointed anywhere.
    pub(crate) const UNSET: PeerId = PeerId(u32::MAX);
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a TCP meta-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-peer behavior flags, set by the control plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerOptions {
    /// All traffic to this peer must use the TCP meta-connection.
    pub tcp_only: bool,
    /// Path-MTU discovery is active for this peer.
    pub pmtu_discovery: bool,
}

/// Peer status bits, written by the control plane and read by the core.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStatus {
    pub reachable: bool,
    pub valid_key: bool,
    pub waiting_for_key: bool,
}

/// A remote participant in the mesh.
pub struct Peer {
    /// Stable node name.
    pub name: String,
    /// Printable endpoint, for logs.
    pub hostname: String,
    pub(crate) address: SocketAddr,
    pub status: PeerStatus,
    pub options: PeerOptions,

    /// Inbound and outbound session crypto; `None` means inactive.
    pub incipher: Option<Cipher>,
    pub outcipher: Option<Cipher>,
    pub indigest: Option<Digest>,
    pub outdigest: Option<Digest>,
    /// Compression levels: 0 off, 1..=9 zlib, 10 fast, 11 best.
    pub incompression: u8,
    pub outcompression: u8,

    /// Remote endpoints of graph edges terminating at this peer. The
    /// receive-side fallback scans these when a datagram arrives from an
    /// address no peer is known by.
    pub edges: Vec<SocketAddr>,

    /// Peer to relay through when no direct path may be used.
    pub nexthop: PeerId,
    /// Preferred carrier for this peer's traffic.
    pub via: PeerId,
    /// TCP meta-connection, if one is established.
    pub connection: Option<ConnectionId>,

    pub(crate) sent_seqno: u32,
    pub(crate) window: ReplayWindow,
    pub(crate) mtu: MtuState,
}

impl Peer {
    /// A fresh peer with inactive crypto and default MTU bounds. The
    /// routing hooks start unset; [`crate::dataplane::Dataplane::add_peer`]
    /// points them at the peer itself unless the caller already did.
    pub fn new(name: &str, hostname: &str, address: SocketAddr) -> Self {
        Self {
            name: name.to_owned(),
            hostname: hostname.to_owned(),
            address,
            status: PeerStatus::default(),
            options: PeerOptions::default(),
            incipher: None,
            outcipher: None,
            indigest: None,
            outdigest: None,
            incompression: 0,
            outcompression: 0,
            edges: Vec::new(),
            nexthop: PeerId::UNSET,
            via: PeerId::UNSET,
            connection: None,
            sent_seqno: 0,
            window: ReplayWindow::new(),
            mtu: MtuState::new(),
        }
    }

    /// Current UDP endpoint. Changed through
    /// [`crate::dataplane::Dataplane::set_peer_address`] so the receive-side
    /// index stays consistent.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Outbound sequence number of the last emitted UDP frame.
    pub fn sent_seqno(&self) -> u32 {
        self.sent_seqno
    }

    /// Inbound replay window.
    pub fn window(&self) -> &ReplayWindow {
        &self.window
    }

    /// Path-MTU estimate.
    pub fn mtu(&self) -> &MtuState {
        &self.mtu
    }

    /// MTU bounds are control-plane inputs at session setup (e.g. a
    /// configured ceiling); afterwards only the prober touches them.
    pub fn mtu_mut(&mut self) -> &mut MtuState {
        &mut self.mtu
    }

    /// Clears both directions' session crypto and sequence state. The
    /// control plane calls this when the session key is regenerated, so the
    /// replay window restarts cleanly under the new key.
    pub fn reset_crypto(&mut self) {
        self.incipher = None;
        self.outcipher = None;
        self.indigest = None;
        self.outdigest = None;
        self.status.valid_key = false;
        self.status.waiting_for_key = false;
        self.sent_seqno = 0;
        self.window.reset();
    }
}

/// A TCP meta-connection the control plane maintains. The data plane reads
/// these when broadcasting and when accepting TCP-carried frames.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Peer at the far end.
    pub peer: PeerId,
    /// The connection is established and usable.
    pub active: bool,
    /// The connection is part of the broadcast spanning tree. Maintained by
    /// the routing collaborator.
    pub mst: bool,
    /// Frames received here must stay on TCP when forwarded.
    pub tcp_only: bool,
}

impl Connection {
    pub fn new(peer: PeerId) -> Self {
        Self { peer, active: false, mst: false, tcp_only: false }
    }
}
