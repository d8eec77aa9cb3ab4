//! Collaborator interfaces the data plane calls out to.
//!
//! The implementations live outside this crate: the TCP meta-protocol, the
//! key-exchange machinery, the routing graph, and the tunnel device driver.
//! Everything runs inline on the daemon's single-threaded event loop; the
//! collaborators are passed into each entry point the way the loop already
//! holds them.

use crate::frame::Frame;
use crate::peer::{ConnectionId, PeerId};

/// Control-plane services: the TCP fallback transport, key management, and
/// routing.
pub trait ControlPlane {
    /// Sends a frame over a TCP meta-connection. `false` means the
    /// connection is dead.
    fn send_tcp_packet(&mut self, conn: ConnectionId, frame: &Frame) -> bool;

    /// Asks a peer for a session key.
    fn send_req_key(&mut self, peer: PeerId);

    /// Triggers regeneration of the local session key.
    fn regenerate_key(&mut self);

    /// Tears down a TCP meta-connection. `report` asks the control plane to
    /// tell the rest of the mesh about it.
    fn terminate_connection(&mut self, conn: ConnectionId, report: bool);

    /// Hands an inbound authenticated plaintext frame to the routing layer.
    fn route(&mut self, from: PeerId, frame: &mut Frame);
}

/// The tunnel device the local node exchanges link-layer frames with.
pub trait TunDevice {
    /// Reads one frame; `false` if nothing was available.
    fn read_packet(&mut self, frame: &mut Frame) -> bool;

    /// Writes one frame to the device.
    fn write_packet(&mut self, frame: &Frame);
}
