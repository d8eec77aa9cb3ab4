use std::fmt;

/// Largest link-layer frame carried through the tunnel.
pub const MAX_FRAME_LEN: usize = 1518;
/// Width of the wire sequence number.
pub const SEQNO_LEN: usize = 4;
/// Largest MAC tag a digest can be configured with.
pub const MAX_DIGEST_LEN: usize = 32;
/// Headroom for compression levels that enlarge incompressible input.
pub const COMPRESS_SLACK: usize = 128;
/// Bytes a payload may occupy inside a frame buffer.
pub const PAYLOAD_CAPACITY: usize = MAX_FRAME_LEN + COMPRESS_SLACK;
/// Capacity of a frame buffer: seqno slot, payload with slack, MAC tail.
pub const MAXSIZE: usize = SEQNO_LEN + PAYLOAD_CAPACITY + MAX_DIGEST_LEN;

/// Byte offset of the ethernet ethertype field within a payload.
const ETHERTYPE_OFFSET: usize = 12;

/// One link-layer datagram as it moves through the data plane.
///
/// The buffer reserves a 4-byte slot ahead of the payload so the
/// `(seqno || payload)` region handed to the MAC and cipher is contiguous,
/// and a tail for the appended MAC. `len` counts payload bytes only.
/// `priority` is a DSCP-like hint; `-1` demands the TCP fallback.
#[derive(Clone)]
pub struct Frame {
    buf: [u8; MAXSIZE],
    len: usize,
    pub priority: i32,
}

impl Frame {
    pub fn new() -> Self {
        Self { buf: [0; MAXSIZE], len: 0, priority: 0 }
    }

    /// Builds a frame holding a copy of `bytes`. `None` if it does not fit.
    pub fn from_data(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > PAYLOAD_CAPACITY {
            return None;
        }
        let mut frame = Self::new();
        frame.buf[SEQNO_LEN..SEQNO_LEN + bytes.len()].copy_from_slice(bytes);
        frame.len = bytes.len();
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks `len` payload bytes as valid. `len` must fit the payload region.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= PAYLOAD_CAPACITY);
        self.len = len;
    }

    /// The valid payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[SEQNO_LEN..SEQNO_LEN + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[SEQNO_LEN..SEQNO_LEN + self.len]
    }

    /// The whole payload region, for codec stages that write past `len`.
    pub(crate) fn payload_buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf[SEQNO_LEN..SEQNO_LEN + PAYLOAD_CAPACITY]
    }

    /// The raw buffer, starting at the seqno slot.
    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The first `wire_len` bytes as they appear on the wire.
    pub(crate) fn wire(&self, wire_len: usize) -> &[u8] {
        &self.buf[..wire_len]
    }

    pub(crate) fn put_seqno(&mut self, seqno: u32) {
        self.buf[..SEQNO_LEN].copy_from_slice(&seqno.to_be_bytes());
    }

    pub(crate) fn seqno(&self) -> u32 {
        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
    }

    /// Whether the payload is an MTU probe rather than user traffic.
    ///
    /// No real ethernet frame carries ethertype 0x0000, so both ethertype
    /// bytes being zero marks a probe. This exact predicate is part of the
    /// wire protocol.
    pub fn is_probe(&self) -> bool {
        self.len > ETHERTYPE_OFFSET + 1
            && self.buf[SEQNO_LEN + ETHERTYPE_OFFSET] == 0
            && self.buf[SEQNO_LEN + ETHERTYPE_OFFSET + 1] == 0
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len)
            .field("priority", &self.priority)
            .finish()
    }
}
