//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("cannot resolve {0}")]
    Resolve(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("sender closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
