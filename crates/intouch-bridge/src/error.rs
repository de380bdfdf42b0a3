//! Bridge error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(#[from] intouch_transport::TransportError),

    #[error("spa at {0} did not answer hello")]
    SpaTimeout(String),

    #[error("invalid spa hello: {0}")]
    InvalidSpaHello(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a write request submitted through a command sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Rejected before anything was sent
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Accepted but could not be delivered
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl From<intouch_core::Error> for CommandError {
    fn from(e: intouch_core::Error) -> Self {
        match e {
            intouch_core::Error::InvalidCommand(reason) => CommandError::InvalidCommand(reason),
            other => CommandError::SendFailed(other.to_string()),
        }
    }
}
