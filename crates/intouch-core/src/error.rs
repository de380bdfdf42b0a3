//! Error types for the in.touch 2 core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer does not start with a known opening tag
    #[error("unknown frame start: {0:02x?}")]
    UnknownFrame(Vec<u8>),

    /// A frame was delimited but its inner structure is invalid
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Datagram ended before the frame was complete
    #[error("incomplete frame")]
    Incomplete,

    /// Datagram carried bytes after its single frame
    #[error("unexpected trailing data: {0} bytes")]
    TrailingData(usize),

    /// Memory update does not fit in the image
    #[error("update out of bounds: address {address:#06x} + {len} bytes exceeds memory size {size}")]
    OutOfBounds { address: u16, len: usize, size: usize },

    /// Write request rejected before anything was sent
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}
