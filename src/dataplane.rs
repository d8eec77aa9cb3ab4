//! The per-peer packet path: egress, ingress, broadcast, and the MTU probe
//! driver.
//!
//! Everything here runs on the daemon's single-threaded event loop. The
//! `Dataplane` owns the peer and connection tables, the listening sockets,
//! and the process-wide IP_TOS cache; collaborators are passed into each
//! entry point.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::control::{ControlPlane, TunDevice};
use crate::error::WireError;
use crate::frame::{Frame, MAX_FRAME_LEN, PAYLOAD_CAPACITY, SEQNO_LEN};
use crate::mtu::{ProbeTimer, MIN_PROBE_LEN, PROBES_PER_ROUND, PROBE_INTERVAL};
use crate::peer::{Connection, ConnectionId, Peer, PeerId};
use crate::replay::Admit;
use crate::socket::{unmap_v4, ListenSocket};
use crate::time::TimeProvider;

/// Process-wide configuration knobs read by the data plane.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Copy each frame's DSCP-like priority into IP_TOS on IPv4 sends.
    pub priority_inheritance: bool,
    /// Do not forward broadcast frames between tunnels. The spanning tree
    /// may be inconsistent across tunnels and could loop.
    pub tunnel_server: bool,
    /// Overwrite the source MAC of locally delivered frames with this one.
    pub overwrite_mac: Option<[u8; 6]>,
}

/// The packet data plane of the VPN daemon.
pub struct Dataplane {
    config: Config,
    local: PeerId,
    peers: BTreeMap<PeerId, Peer>,
    next_peer_id: u32,
    connections: BTreeMap<ConnectionId, Connection>,
    next_connection_id: u32,
    /// Exact (address, port) to peer mapping for the receive path.
    udp_index: BTreeMap<SocketAddr, PeerId>,
    listen: Vec<Box<dyn ListenSocket>>,
    time: Arc<dyn TimeProvider>,
    rng: StdRng,
    /// Last IP_TOS value written to a socket (priority inheritance).
    last_tos: i32,
}

impl Dataplane {
    /// Creates a data plane holding only the local node, registered under
    /// [`Dataplane::local_id`].
    pub fn new(
        config: Config,
        local_name: &str,
        time: Arc<dyn TimeProvider>,
        rng: &mut dyn RngCore,
    ) -> Self {
        let local = PeerId(0);
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let mut me = Peer::new(local_name, local_name, unspecified);
        me.nexthop = local;
        me.via = local;
        let mut peers = BTreeMap::new();
        peers.insert(local, me);
        Self {
            config,
            local,
            peers,
            next_peer_id: 0,
            connections: BTreeMap::new(),
            next_connection_id: 0,
            udp_index: BTreeMap::new(),
            listen: Vec::new(),
            time,
            rng: StdRng::seed_from_u64(rng.next_u64()),
            last_tos: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Id of the local node's own peer entry.
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Registers a peer. Routing hooks left unset point at the peer itself
    /// (a direct neighbor).
    pub fn add_peer(&mut self, mut peer: Peer) -> PeerId {
        self.next_peer_id += 1;
        let id = PeerId(self.next_peer_id);
        if peer.nexthop == PeerId::UNSET {
            peer.nexthop = id;
        }
        if peer.via == PeerId::UNSET {
            peer.via = id;
        }
        self.udp_index.insert(peer.address(), id);
        self.peers.insert(id, peer);
        id
    }

    /// Removes a peer. Any armed probe timer dies with it.
    pub fn remove_peer(&mut self, id: PeerId) {
        if id == self.local {
            return;
        }
        if let Some(peer) = self.peers.remove(&id) {
            if self.udp_index.get(&peer.address()) == Some(&id) {
                self.udp_index.remove(&peer.address());
            }
        }
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Moves a peer to a new UDP endpoint, keeping the receive-side index
    /// consistent.
    pub fn set_peer_address(&mut self, id: PeerId, addr: SocketAddr) {
        let Self { peers, udp_index, .. } = self;
        if let Some(peer) = peers.get_mut(&id) {
            if udp_index.get(&peer.address) == Some(&id) {
                udp_index.remove(&peer.address);
            }
            peer.address = addr;
            udp_index.insert(addr, id);
        }
    }

    pub fn add_connection(&mut self, conn: Connection) -> ConnectionId {
        self.next_connection_id += 1;
        let id = ConnectionId(self.next_connection_id);
        self.connections.insert(id, conn);
        id
    }

    pub fn remove_connection(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn add_listen_socket(&mut self, socket: Box<dyn ListenSocket>) {
        self.listen.push(socket);
    }

    pub fn listen_socket_count(&self) -> usize {
        self.listen.len()
    }

    /// Sends a link-layer frame to a peer, choosing carrier and transport.
    pub fn send_packet<C: ControlPlane, D: TunDevice>(
        &mut self,
        cp: &mut C,
        dev: &mut D,
        peer: PeerId,
        frame: &mut Frame,
    ) {
        if peer == self.local {
            if let Some(mac) = self.config.overwrite_mac {
                let data = frame.data_mut();
                if data.len() >= 12 {
                    data[6..12].copy_from_slice(&mac);
                }
            }
            dev.write_packet(frame);
            return;
        }

        let Some(n) = self.peers.get(&peer) else {
            debug!("dropping packet for unknown peer {}", peer);
            return;
        };
        debug!("sending packet of {} bytes to {} ({})", frame.len(), n.name, n.hostname);

        if !n.status.reachable {
            debug!("peer {} ({}) is not reachable", n.name, n.hostname);
            return;
        }

        let name = n.name.clone();
        let via = if frame.priority == -1 || n.via == self.local {
            n.nexthop
        } else {
            n.via
        };
        if via != peer {
            if let Some(v) = self.peers.get(&via) {
                debug!("sending packet to {} via {} ({})", name, v.name, v.hostname);
            }
        }

        let local_tcp_only = self
            .peers
            .get(&self.local)
            .map(|v| v.options.tcp_only)
            .unwrap_or(false);
        let via_tcp_only = self
            .peers
            .get(&via)
            .map(|v| v.options.tcp_only)
            .unwrap_or(false);

        if frame.priority == -1 || local_tcp_only || via_tcp_only {
            match self.peers.get(&via).and_then(|v| v.connection) {
                Some(conn) => {
                    if !cp.send_tcp_packet(conn, frame) {
                        cp.terminate_connection(conn, true);
                    }
                }
                None => debug!("no TCP meta-connection to reach {} via {}", name, via),
            }
        } else {
            self.send_udp(cp, via, frame);
        }
    }

    /// Builds and sends one UDP datagram for `frame`, falling back to TCP
    /// while the session key or MTU estimate is missing.
    fn send_udp<C: ControlPlane>(&mut self, cp: &mut C, id: PeerId, frame: &Frame) {
        let Some(n) = self.peers.get(&id) else { return };
        let name = n.name.clone();
        let hostname = n.hostname.clone();
        let address = n.address();
        let nexthop = n.nexthop;
        let status = n.status;
        let options = n.options;
        let minmtu = n.mtu.minmtu;
        let outlevel = n.outcompression;
        let outcipher = n.outcipher.clone();
        let outdigest = n.outdigest.clone();

        if !status.valid_key {
            debug!("no valid key known yet for {} ({}), forwarding via TCP", name, hostname);
            if !status.waiting_for_key {
                cp.send_req_key(id);
                if let Some(n) = self.peers.get_mut(&id) {
                    n.status.waiting_for_key = true;
                }
            }
            self.tcp_fallback(cp, nexthop, frame);
            return;
        }

        // Probes bypass this gate; they are how the estimate gets made.
        if options.pmtu_discovery && minmtu == 0 && !frame.is_probe() {
            debug!("no minimum MTU established yet for {} ({}), forwarding via TCP", name, hostname);
            self.tcp_fallback(cp, nexthop, frame);
            return;
        }

        let origlen = frame.len();
        let origpriority = frame.priority;

        let mut work = Frame::new();
        let payload_len = if outlevel > 0 {
            match codec::compress(outlevel, frame.data(), work.payload_buf_mut()) {
                Ok(len) => len,
                Err(err) => {
                    error!("error while compressing packet to {} ({}): {}", name, hostname, err);
                    return;
                }
            }
        } else {
            work.payload_buf_mut()[..origlen].copy_from_slice(frame.data());
            origlen
        };
        work.set_len(payload_len);

        let seqno = match self.peers.get_mut(&id) {
            Some(n) => {
                n.sent_seqno += 1;
                n.sent_seqno
            }
            None => return,
        };
        work.put_seqno(seqno);
        let mut wire_len = SEQNO_LEN + payload_len;

        if let Some(cipher) = &outcipher {
            cipher.apply(&mut work.buf_mut()[..wire_len]);
        }

        if let Some(digest) = &outdigest {
            let tag_len = digest.len();
            let (region, tail) = work.buf_mut().split_at_mut(wire_len);
            digest.create(region, &mut tail[..tag_len]);
            wire_len += tag_len;
        }

        let sock_index = self
            .listen
            .iter()
            .position(|s| s.is_ipv4() == address.is_ipv4())
            .unwrap_or(0);
        let Some(sock) = self.listen.get(sock_index) else {
            error!("no listening socket available to reach {} ({})", name, hostname);
            return;
        };

        if self.config.priority_inheritance && sock.is_ipv4() && origpriority != self.last_tos {
            self.last_tos = origpriority;
            debug!("setting outgoing packet priority to {}", origpriority);
            if let Err(err) = sock.set_tos(origpriority) {
                error!("setting IP_TOS failed: {}", err);
            }
        }

        match sock.send_to(work.wire(wire_len), address) {
            Ok(()) => {}
            Err(WireError::MessageTooLong) => {
                if let Some(n) = self.peers.get_mut(&id) {
                    n.mtu.note_too_big(origlen as u16);
                }
            }
            Err(err) => error!("error sending packet to {} ({}): {}", name, hostname, err),
        }
    }

    fn tcp_fallback<C: ControlPlane>(&self, cp: &mut C, nexthop: PeerId, frame: &Frame) {
        match self.peers.get(&nexthop).and_then(|n| n.connection) {
            Some(conn) => {
                cp.send_tcp_packet(conn, frame);
            }
            None => debug!("no TCP meta-connection for fallback via peer {}", nexthop),
        }
    }

    /// Reads one datagram from listening socket `sock` and runs the receive
    /// pipeline on it.
    pub fn handle_incoming_vpn_data<C: ControlPlane, D: TunDevice>(
        &mut self,
        cp: &mut C,
        dev: &mut D,
        sock: usize,
    ) {
        let mut frame = Frame::new();
        let (wire_len, from) = {
            let Some(s) = self.listen.get(sock) else {
                error!("no listening socket with index {}", sock);
                return;
            };
            match s.recv_from(frame.buf_mut()) {
                Ok(received) => received,
                Err(err) => {
                    error!("receiving packet failed: {}", err);
                    return;
                }
            }
        };
        let from = unmap_v4(from);

        let id = match self.udp_index.get(&from).copied() {
            Some(id) => id,
            None => match self.try_harder(&from, frame.wire(wire_len)) {
                Some(id) => id,
                None => return,
            },
        };

        self.receive_udp(cp, dev, id, frame, wire_len);
    }

    /// Resolves a datagram from an unknown source address: scan peers with a
    /// graph edge on the same IP (port-agnostic) and accept the first whose
    /// inbound MAC verifies the datagram. An address-only match is only a
    /// hint for the log; it never delivers.
    fn try_harder(&mut self, from: &SocketAddr, wire: &[u8]) -> Option<PeerId> {
        let mut hint = None;
        let mut verified = None;
        for (id, n) in &self.peers {
            if !n.edges.iter().any(|e| e.ip() == from.ip()) {
                continue;
            }
            if hint.is_none() {
                hint = Some(*id);
            }
            if try_mac(n, wire) {
                verified = Some(*id);
                break;
            }
        }
        match verified {
            Some(id) => {
                self.set_peer_address(id, *from);
                Some(id)
            }
            None => {
                match hint.and_then(|h| self.peers.get(&h)) {
                    Some(n) => debug!(
                        "received UDP packet from unknown source {} (address matches {} but MAC does not)",
                        from, n.name
                    ),
                    None => debug!("received UDP packet from unknown source {}", from),
                }
                None
            }
        }
    }

    /// Authenticates, decrypts, de-duplicates, and decompresses one inbound
    /// datagram, then dispatches it to routing or the MTU prober.
    fn receive_udp<C: ControlPlane, D: TunDevice>(
        &mut self,
        cp: &mut C,
        dev: &mut D,
        id: PeerId,
        mut frame: Frame,
        wire_len: usize,
    ) {
        let Some(n) = self.peers.get(&id) else { return };
        let name = n.name.clone();
        let hostname = n.hostname.clone();
        let indigest = n.indigest.clone();
        let inlevel = n.incompression;

        let Some(cipher) = n.incipher.clone() else {
            debug!("got packet from {} ({}) but they do not have our key yet", name, hostname);
            return;
        };

        let digest_len = indigest.as_ref().map(|d| d.len()).unwrap_or(0);
        if wire_len < SEQNO_LEN + digest_len {
            debug!("got too short packet from {} ({})", name, hostname);
            return;
        }
        let region_len = wire_len - digest_len;
        let payload_len = region_len - SEQNO_LEN;
        if payload_len > PAYLOAD_CAPACITY {
            debug!("got oversized packet from {} ({})", name, hostname);
            return;
        }

        if let Some(digest) = &indigest {
            let (region, tag) = frame.wire(wire_len).split_at(region_len);
            if !digest.verify(region, tag) {
                debug!("got unauthenticated packet from {} ({})", name, hostname);
                return;
            }
        }

        cipher.apply(&mut frame.buf_mut()[..region_len]);

        let seqno = frame.seqno();
        frame.set_len(payload_len);

        let admit = match self.peers.get_mut(&id) {
            Some(n) => n.window.admit(seqno),
            None => return,
        };
        match admit {
            Admit::Reject => {
                warn!("got late or replayed packet from {} ({}), seqno {}", name, hostname, seqno);
                return;
            }
            Admit::Accepted { lost } => {
                if lost > 0 {
                    warn!("lost {} packets from {} ({})", lost, name, hostname);
                }
            }
        }
        if self.peers.get(&id).map(|n| n.window.needs_rekey()).unwrap_or(false) {
            cp.regenerate_key();
        }

        let mut accounted = payload_len;
        if inlevel > 0 {
            let mut out = Frame::new();
            match codec::decompress(inlevel, frame.data(), out.payload_buf_mut()) {
                Ok(len) => {
                    out.set_len(len);
                    frame = out;
                }
                Err(err) => {
                    error!("error while uncompressing packet from {} ({}): {}", name, hostname, err);
                    return;
                }
            }
            // Probes are incompressible; discount the framing the compressor
            // added so the accounted length tracks the wire payload.
            accounted = accounted.saturating_sub(MAX_FRAME_LEN / 64 + 20);
        }

        frame.priority = 0;

        if frame.is_probe() {
            self.handle_mtu_probe(cp, dev, id, frame, accounted);
        } else {
            debug!("received packet of {} bytes from {} ({})", frame.len(), name, hostname);
            cp.route(id, &mut frame);
        }
    }

    fn handle_mtu_probe<C: ControlPlane, D: TunDevice>(
        &mut self,
        cp: &mut C,
        dev: &mut D,
        id: PeerId,
        mut frame: Frame,
        accounted: usize,
    ) {
        if let Some(n) = self.peers.get(&id) {
            debug!("got MTU probe length {} from {} ({})", frame.len(), n.name, n.hostname);
        }
        if frame.data()[0] == 0 {
            // Their probe; flip it into a reply and bounce it back.
            frame.data_mut()[0] = 1;
            self.send_packet(cp, dev, id, &mut frame);
        } else if let Some(n) = self.peers.get_mut(&id) {
            n.mtu.note_reply(accounted as u16);
        }
    }

    /// Accepts a frame that arrived over a TCP meta-connection. It was
    /// authenticated at the meta-connection layer, so crypto is bypassed.
    pub fn receive_tcp_packet<C: ControlPlane>(
        &mut self,
        cp: &mut C,
        conn: ConnectionId,
        bytes: &[u8],
    ) {
        let Some(c) = self.connections.get(&conn) else {
            debug!("got TCP packet on unknown connection {}", conn);
            return;
        };
        let Some(mut frame) = Frame::from_data(bytes) else {
            debug!("got oversized TCP packet on connection {}", conn);
            return;
        };
        frame.priority = if c.tcp_only { -1 } else { 0 };
        let peer = c.peer;
        debug!("received TCP packet of {} bytes for peer {}", frame.len(), peer);
        cp.route(peer, &mut frame);
    }

    /// Reads one frame from the tunnel device and routes it as local
    /// traffic.
    pub fn handle_device_data<C: ControlPlane, D: TunDevice>(&mut self, cp: &mut C, dev: &mut D) {
        let mut frame = Frame::new();
        if dev.read_packet(&mut frame) {
            cp.route(self.local, &mut frame);
        }
    }

    /// Forwards a frame along the spanning tree: deliver locally first when
    /// it originated remotely, then fan out over every active MST
    /// connection except the one it arrived through.
    pub fn broadcast_packet<C: ControlPlane, D: TunDevice>(
        &mut self,
        cp: &mut C,
        dev: &mut D,
        from: PeerId,
        frame: &mut Frame,
    ) {
        if let Some(n) = self.peers.get(&from) {
            debug!("broadcasting packet of {} bytes from {} ({})", frame.len(), n.name, n.hostname);
        }

        if from != self.local {
            self.send_packet(cp, dev, self.local, frame);
            if self.config.tunnel_server {
                return;
            }
        }

        let inbound = self
            .peers
            .get(&from)
            .and_then(|n| self.peers.get(&n.nexthop))
            .and_then(|nh| nh.connection);
        let targets: Vec<PeerId> = self
            .connections
            .iter()
            .filter(|(id, c)| c.active && c.mst && Some(**id) != inbound)
            .map(|(_, c)| c.peer)
            .collect();
        for peer in targets {
            self.send_packet(cp, dev, peer, frame);
        }
    }

    /// Starts or continues MTU probing toward a peer. The first call arms
    /// the peer's probe timer; afterwards [`Dataplane::service`] keeps the
    /// rounds going.
    pub fn send_mtu_probe<C: ControlPlane>(&mut self, cp: &mut C, id: PeerId) {
        let now = self.time.now_instant();
        self.mtu_probe_round(cp, id, now);
    }

    fn mtu_probe_round<C: ControlPlane>(&mut self, cp: &mut C, id: PeerId, now: Instant) {
        let (name, hostname) = {
            let Some(n) = self.peers.get_mut(&id) else { return };
            n.mtu.probes += 1;
            if n.mtu.abandoned() {
                debug!("no response to MTU probes from {} ({})", n.name, n.hostname);
                n.mtu.timer = ProbeTimer::Stopped;
                return;
            }
            (n.name.clone(), n.hostname.clone())
        };

        for _ in 0..PROBES_PER_ROUND {
            // Re-read each iteration: a send can tighten the bounds.
            let (minmtu, maxmtu) = {
                let Some(n) = self.peers.get_mut(&id) else { return };
                if n.mtu.must_fix() {
                    info!(
                        "fixing MTU of {} ({}) to {} after {} probes",
                        name, hostname, n.mtu.minmtu, n.mtu.probes
                    );
                    n.mtu.fix();
                    return;
                }
                (n.mtu.minmtu, n.mtu.maxmtu)
            };

            let span = usize::from(maxmtu - minmtu);
            let len = (usize::from(minmtu) + 1 + self.rng.gen_range(0..span)).max(MIN_PROBE_LEN);

            let mut frame = Frame::new();
            frame.set_len(len);
            {
                let data = frame.data_mut();
                data[..14].fill(0);
                self.rng.fill_bytes(&mut data[14..]);
            }
            frame.priority = 0;

            debug!("sending MTU probe length {} to {} ({})", len, name, hostname);
            self.send_udp(cp, id, &frame);
        }

        if let Some(n) = self.peers.get_mut(&id) {
            n.mtu.timer = ProbeTimer::Armed(now + PROBE_INTERVAL);
        }
    }

    /// Fires any probe timers whose deadline has passed. The event loop
    /// calls this once per tick.
    pub fn service<C: ControlPlane>(&mut self, cp: &mut C) {
        let now = self.time.now_instant();
        let due: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, n)| matches!(n.mtu.timer, ProbeTimer::Armed(at) if at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.mtu_probe_round(cp, id, now);
        }
    }

    /// Earliest armed probe deadline, for the event loop's timer wait.
    pub fn next_probe_deadline(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter_map(|n| match n.mtu.timer {
                ProbeTimer::Armed(at) => Some(at),
                _ => None,
            })
            .min()
    }
}

/// Verifies a raw datagram against a peer's inbound MAC without touching
/// any other state.
fn try_mac(n: &Peer, wire: &[u8]) -> bool {
    let Some(digest) = &n.indigest else {
        return false;
    };
    if wire.len() < SEQNO_LEN + digest.len() {
        return false;
    }
    let (region, tag) = wire.split_at(wire.len() - digest.len());
    digest.verify(region, tag)
}
