//! # meshwire
//!
//! The packet data plane of a mesh-VPN daemon: the per-peer path that turns
//! a plaintext link-layer frame into an authenticated, encrypted, optionally
//! compressed UDP datagram, and the inverse on receipt.
//!
//! ## Architecture
//!
//! - **Egress**: compress, stamp a sequence number, encrypt, append a MAC,
//!   send over UDP; fall back to the TCP meta-connection while no session
//!   key or path-MTU estimate exists, or when a frame demands TCP.
//! - **Ingress**: authenticate, decrypt, de-duplicate against a replay
//!   window, decompress, then dispatch to routing or the MTU prober. A
//!   datagram from an unknown source address is resolved by MAC
//!   verification against peers sharing that IP.
//! - **Path MTU**: timer-driven random-length probes converge a per-peer
//!   estimate, tightened further by message-too-long send failures.
//! - **Broadcast**: frames fan out along the control plane's spanning tree.
//!
//! The control plane (key exchange, routing graph, TCP meta-protocol) and
//! the tunnel device are collaborators behind traits. Everything runs on a
//! single-threaded event loop; no state here is shared across threads.

pub mod codec;
pub mod control;
pub mod dataplane;
pub mod error;
pub mod frame;
pub mod mtu;
pub mod peer;
pub mod replay;
pub mod socket;
pub mod time;

pub use codec::{Cipher, Digest};
pub use control::{ControlPlane, TunDevice};
pub use dataplane::{Config, Dataplane};
pub use error::{CodecError, WireError};
pub use frame::{Frame, MAXSIZE, MAX_FRAME_LEN};
pub use mtu::{MtuState, ProbeTimer};
pub use peer::{Connection, ConnectionId, Peer, PeerId, PeerOptions, PeerStatus};
pub use replay::{Admit, ReplayWindow, MAX_SEQNO};
pub use socket::{ListenSocket, UdpListenSocket};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
