use thiserror::Error;

/// Errors from the packet codec primitives.
///
/// The pipelines never propagate these to the caller; a failing packet is
/// dropped with a log entry and the data plane keeps running.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported compression level {0}")]
    UnsupportedLevel(u8),
    /// The compressor failed or its output does not fit the frame buffer.
    #[error("compression failed")]
    Compress,
    #[error("corrupt compressed payload")]
    Decompress,
}

/// Errors surfaced by a listening socket.
#[derive(Debug, Error)]
pub enum WireError {
    /// The datagram exceeds the path MTU. The egress pipeline reacts by
    /// tightening the peer's MTU bounds; the datagram itself is lost.
    #[error("datagram exceeds the path MTU")]
    MessageTooLong,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
