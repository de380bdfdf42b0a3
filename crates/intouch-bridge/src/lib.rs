//! in.touch 2 bridge
//!
//! Keeps a session with an in.touch 2 spa and mirrors its memory:
//! - Handshake and keepalive state machine ([`session`])
//! - Spa driver with a state-change feed and a command sink ([`spa`])
//! - UDP relay sharing one spa with controller apps ([`relay`])

pub mod config;
pub mod error;
pub mod forward;
pub mod relay;
pub mod session;
pub mod spa;
pub mod traits;

pub use config::BridgeConfig;
pub use error::{BridgeError, CommandError, Result};
pub use forward::{ForwardTable, Peer};
pub use relay::{DumpedPackage, Relay, TrafficSource};
pub use session::{Output, Session, SessionConfig, SessionEvent, SessionState};
pub use spa::{SpaConnection, SpaEvent, SpaHandle};
pub use traits::{udp_link, CommandSink, Link, PackageSender};
