//! in.touch 2 core
//!
//! Protocol primitives for talking to in.touch 2 spa controllers.
//!
//! This crate provides:
//! - Wire package types ([`Package`], [`PackageContent`])
//! - Tag-delimited frame encoding/decoding ([`frame`])
//! - The typed payload sub-grammar carried inside `<DATAS>` ([`datas`])
//! - The cached device memory image ([`MemoryImage`])
//! - Translation of write requests into wire payloads ([`Translator`])
//!
//! Nothing in here performs I/O; the transport and session crates drive it.

pub mod command;
pub mod datas;
pub mod error;
pub mod frame;
pub mod memory;
pub mod types;

pub use command::{AddressWidth, Command, CommandConfig, TranslatedCommand, Translator};
pub use datas::{Datas, PackAction, Version};
pub use error::{Error, Result};
pub use frame::{decode, decode_datagram, decode_frame, encode, Decoded};
pub use memory::{MemoryImage, StateChange, Width};
pub use types::*;

/// Default UDP port of the in.touch 2 module
pub const DEFAULT_SPA_PORT: u16 = 10022;

/// Byte separating the destination id from the device name in a spa hello
pub const HELLO_DELIMITER: u8 = b'|';

/// Prefix used for locally generated session keys
pub const SESSION_KEY_PREFIX: &str = "IOS";
