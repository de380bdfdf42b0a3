//! Wire-level package types

use bytes::Bytes;
use std::fmt;

/// `<DATAS>` content of a ping
pub const PING: &[u8] = b"APING";

/// `<DATAS>` content of a pong
pub const PONG: &[u8] = b"APING.";

/// Content of an authorized package
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageContent {
    /// Keepalive request
    Ping,
    /// Keepalive answer
    Pong,
    /// Any other payload (memory pushes, commands, version queries...)
    Unknown(Bytes),
}

impl PackageContent {
    /// Classify raw `<DATAS>` bytes. Ping and pong are matched exactly.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        match data.as_ref() {
            PING => PackageContent::Ping,
            PONG => PackageContent::Pong,
            _ => PackageContent::Unknown(data),
        }
    }

    /// Raw `<DATAS>` bytes for this content
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PackageContent::Ping => PING,
            PackageContent::Pong => PONG,
            PackageContent::Unknown(data) => data,
        }
    }

    /// Ping or pong
    pub fn is_keepalive(&self) -> bool {
        matches!(self, PackageContent::Ping | PackageContent::Pong)
    }
}

impl From<Bytes> for PackageContent {
    fn from(data: Bytes) -> Self {
        PackageContent::from_bytes(data)
    }
}

impl fmt::Display for PackageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageContent::Ping => write!(f, "PING"),
            PackageContent::Pong => write!(f, "PONG"),
            PackageContent::Unknown(data) => write!(f, "{}", printable(data)),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Package {
    /// Unauthenticated handshake frame
    Hello(Bytes),
    /// Frame exchanged within a session
    Authorized {
        source: Option<Bytes>,
        destination: Option<Bytes>,
        content: PackageContent,
    },
}

impl Package {
    pub fn hello(payload: impl Into<Bytes>) -> Self {
        Package::Hello(payload.into())
    }

    /// Authorized package from `source` to `destination`
    pub fn authorized(
        source: impl Into<Bytes>,
        destination: impl Into<Bytes>,
        content: PackageContent,
    ) -> Self {
        Package::Authorized {
            source: Some(source.into()),
            destination: Some(destination.into()),
            content,
        }
    }

    pub fn source(&self) -> Option<&Bytes> {
        match self {
            Package::Authorized { source, .. } => source.as_ref(),
            Package::Hello(_) => None,
        }
    }

    pub fn destination(&self) -> Option<&Bytes> {
        match self {
            Package::Authorized { destination, .. } => destination.as_ref(),
            Package::Hello(_) => None,
        }
    }

    pub fn content(&self) -> Option<&PackageContent> {
        match self {
            Package::Authorized { content, .. } => Some(content),
            Package::Hello(_) => None,
        }
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Package::Hello(payload) => write!(f, "HELLO {}", printable(payload)),
            Package::Authorized {
                source,
                destination,
                content,
            } => {
                let id = |id: &Option<Bytes>| {
                    id.as_deref()
                        .map(|id| String::from_utf8_lossy(id).into_owned())
                        .unwrap_or_else(|| "-".to_string())
                };
                write!(f, "{} -> {}: {}", id(source), id(destination), content)
            }
        }
    }
}

/// Render bytes as text where printable, hex escapes otherwise
pub fn printable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &byte in data {
        if byte.is_ascii_graphic() || byte == b' ' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\x{:02x}", byte));
        }
    }
    out
}
