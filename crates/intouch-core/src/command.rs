//! Translation of write requests into wire payloads
//!
//! Requests are validated before anything is produced: a rejected request
//! yields [`Error::InvalidCommand`] and no payload at all.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::datas::{Datas, PackAction};
use crate::{Error, Result, Width};

/// A write request from outside the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Write bytes at a memory address
    RawWrite {
        address: u16,
        #[serde(with = "bytes_as_vec")]
        data: Bytes,
    },
    /// Set the watercare mode
    ModeWrite { value: u8 },
    /// Press `key` `count` times
    KeyPress { key: u8, count: u32 },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::RawWrite { address, data } => {
                write!(f, "write {:?} at {:#06x}", data.as_ref(), address)
            }
            Command::ModeWrite { value } => write!(f, "watercare mode {}", value),
            Command::KeyPress { key, count } => write!(f, "press key {} x{}", key, count),
        }
    }
}

/// Device-specific parameters for building command payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Pack type byte of `SPACK` payloads
    pub pack_type: u8,
    pub config_version: u8,
    pub log_version: u8,
    /// Minimum spacing between repeated key presses
    pub key_press_delay_ms: u64,
    /// Accepted key codes; empty accepts any key
    pub known_keys: Vec<u8>,
    /// Highest accepted watercare mode
    pub max_watercare_mode: u8,
    /// Declared widths of writable addresses
    pub addresses: Vec<AddressWidth>,
}

/// Declared width of one writable address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressWidth {
    pub address: u16,
    pub width: Width,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            pack_type: 10,
            config_version: 0,
            log_version: 0,
            key_press_delay_ms: 250,
            known_keys: Vec::new(),
            max_watercare_mode: 4,
            addresses: Vec::new(),
        }
    }
}

impl CommandConfig {
    pub fn key_press_delay(&self) -> Duration {
        Duration::from_millis(self.key_press_delay_ms)
    }
}

/// Payloads for one validated request, sent in order with `spacing`
/// between them.
///
/// Repeated key presses are composed one at a time by
/// [`Translator::next_payload`], so a large count holds no memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedCommand {
    frames: Frames,
    pub spacing: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frames {
    Single(Option<Bytes>),
    KeyPress { key: u8, remaining: u32 },
}

impl TranslatedCommand {
    /// Payloads not yet taken
    pub fn remaining(&self) -> u32 {
        match self.frames {
            Frames::Single(ref payload) => u32::from(payload.is_some()),
            Frames::KeyPress { remaining, .. } => remaining,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Builds command payloads and hands out sequence numbers
#[derive(Debug)]
pub struct Translator {
    config: CommandConfig,
    widths: BTreeMap<u16, Width>,
    memory_size: usize,
    seq: AtomicU8,
}

impl Translator {
    pub fn new(config: CommandConfig, memory_size: usize) -> Self {
        let widths = config
            .addresses
            .iter()
            .map(|declared| (declared.address, declared.width))
            .collect();
        Self {
            config,
            widths,
            memory_size,
            seq: AtomicU8::new(0),
        }
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// Next sequence number (wraps)
    pub fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Check a request without consuming sequence numbers
    pub fn validate(&self, command: &Command) -> Result<()> {
        match command {
            Command::RawWrite { address, data } => {
                if data.is_empty() {
                    return Err(invalid("empty write"));
                }
                if *address as usize + data.len() > self.memory_size {
                    return Err(invalid(format!(
                        "address {:#06x}+{} outside memory of {} bytes",
                        address,
                        data.len(),
                        self.memory_size
                    )));
                }
                match self.widths.get(address) {
                    Some(width) if width.len() != data.len() => Err(invalid(format!(
                        "address {:#06x} is {:?}, got {} bytes",
                        address,
                        width,
                        data.len()
                    ))),
                    Some(_) => Ok(()),
                    None if matches!(data.len(), 1 | 2) => Ok(()),
                    None => Err(invalid(format!(
                        "undeclared address {:#06x} takes 1 or 2 bytes, got {}",
                        address,
                        data.len()
                    ))),
                }
            }
            Command::ModeWrite { value } => {
                if *value > self.config.max_watercare_mode {
                    return Err(invalid(format!("watercare mode {} out of range", value)));
                }
                Ok(())
            }
            Command::KeyPress { key, .. } => {
                if !self.config.known_keys.is_empty() && !self.config.known_keys.contains(key) {
                    return Err(invalid(format!("unknown key {}", key)));
                }
                Ok(())
            }
        }
    }

    /// Validate and translate a request
    pub fn translate(&self, command: &Command) -> Result<TranslatedCommand> {
        self.validate(command)?;

        let translated = match command {
            Command::RawWrite { address, data } => TranslatedCommand {
                frames: Frames::Single(Some(self.pack(PackAction::Set {
                    config_version: self.config.config_version,
                    log_version: self.config.log_version,
                    pos: *address,
                    data: data.clone(),
                }))),
                spacing: Duration::ZERO,
            },
            Command::ModeWrite { value } => TranslatedCommand {
                frames: Frames::Single(Some(
                    Datas::SetWatercare {
                        seq: self.next_seq(),
                        mode: *value,
                    }
                    .compose(),
                )),
                spacing: Duration::ZERO,
            },
            Command::KeyPress { key, count } => TranslatedCommand {
                frames: Frames::KeyPress {
                    key: *key,
                    remaining: *count,
                },
                spacing: self.config.key_press_delay(),
            },
        };
        Ok(translated)
    }

    /// Take the next payload of `command`, composing key presses on demand
    pub fn next_payload(&self, command: &mut TranslatedCommand) -> Option<Bytes> {
        match command.frames {
            Frames::Single(ref mut payload) => payload.take(),
            Frames::KeyPress { key, ref mut remaining } => {
                if *remaining == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(self.pack(PackAction::KeyPress { key }))
            }
        }
    }

    /// Take every remaining payload
    pub fn drain(&self, command: &mut TranslatedCommand) -> Vec<Bytes> {
        std::iter::from_fn(|| self.next_payload(command)).collect()
    }

    fn pack(&self, action: PackAction) -> Bytes {
        Datas::Pack {
            seq: self.next_seq(),
            pack_type: self.config.pack_type,
            action,
        }
        .compose()
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidCommand(reason.into())
}

mod bytes_as_vec {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> Translator {
        let config = CommandConfig {
            known_keys: vec![1, 2],
            addresses: vec![AddressWidth {
                address: 0x10,
                width: Width::U16,
            }],
            ..Default::default()
        };
        Translator::new(config, 0x20)
    }

    #[test]
    fn test_key_press_fan_out() {
        let t = translator();
        let mut translated = t.translate(&Command::KeyPress { key: 1, count: 2 }).unwrap();
        assert_eq!(translated.remaining(), 2);
        let payloads = t.drain(&mut translated);
        assert_eq!(payloads.len(), 2);
        assert!(translated.is_empty());
        for payload in &payloads {
            match Datas::parse(payload) {
                Some(Datas::Pack {
                    action: PackAction::KeyPress { key },
                    ..
                }) => assert_eq!(key, 1),
                other => panic!("unexpected payload {:?}", other),
            }
        }
        assert_eq!(translated.spacing, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_presses() {
        let t = translator();
        assert!(t
            .translate(&Command::KeyPress { key: 2, count: 0 })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_huge_press_count_composed_lazily() {
        let t = translator();
        let mut translated = t
            .translate(&Command::KeyPress {
                key: 1,
                count: u32::MAX,
            })
            .unwrap();
        assert_eq!(translated.remaining(), u32::MAX);
        // nothing is composed up front
        assert_eq!(t.next_seq(), 0);

        assert!(t.next_payload(&mut translated).is_some());
        assert!(t.next_payload(&mut translated).is_some());
        assert_eq!(translated.remaining(), u32::MAX - 2);
    }

    #[test]
    fn test_single_payload_taken_once() {
        let t = translator();
        let mut translated = t.translate(&Command::ModeWrite { value: 1 }).unwrap();
        assert_eq!(translated.remaining(), 1);
        assert!(t.next_payload(&mut translated).is_some());
        assert_eq!(t.next_payload(&mut translated), None);
        assert!(translated.is_empty());
    }

    #[test]
    fn test_rejections() {
        let t = translator();
        let bad = [
            Command::KeyPress { key: 9, count: 1 },
            Command::RawWrite {
                address: 0x10,
                data: Bytes::from_static(&[1]),
            },
            Command::RawWrite {
                address: 0x1f,
                data: Bytes::from_static(&[1, 2]),
            },
            Command::RawWrite {
                address: 0x00,
                data: Bytes::from_static(&[1, 2, 3]),
            },
            Command::ModeWrite { value: 5 },
        ];
        for command in &bad {
            assert!(
                matches!(t.translate(command), Err(Error::InvalidCommand(_))),
                "{} accepted",
                command
            );
        }
    }

    #[test]
    fn test_rejection_does_not_consume_seq() {
        let t = translator();
        let _ = t.translate(&Command::ModeWrite { value: 9 });
        assert_eq!(t.next_seq(), 0);
    }

    #[test]
    fn test_command_json() {
        let command: Command =
            serde_json::from_str(r#"{"type":"raw_write","address":16,"data":[1,2]}"#).unwrap();
        assert_eq!(
            command,
            Command::RawWrite {
                address: 16,
                data: Bytes::from_static(&[1, 2])
            }
        );
    }
}
