use std::io;

use crate::types::Port;

/// Errors from the frame codec and the per-peer read path.
///
/// Parse errors never escape the peer boundary: `BadMagic` causes a one-byte
/// resync, anything else discards the frame and (for stream corruption)
/// disconnects the peer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("frame truncated")]
    Truncated,

    #[error("malformed varint")]
    MalformedVarint,

    #[error("frame length inconsistent with payload")]
    InconsistentLength,

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("buffer too small for frame")]
    BufferTooSmall,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the router's public API.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("all {0} peer ports are in use")]
    TooManyPeers(usize),

    #[error("no peer on port {0}")]
    PeerNotFound(Port),

    #[error("peer presented key {got} but {expected} was expected")]
    HandshakeFailed {
        expected: Box<str>,
        got: Box<str>,
    },

    #[error("router is shut down")]
    Shutdown,

    #[error("ping timed out")]
    PingTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
