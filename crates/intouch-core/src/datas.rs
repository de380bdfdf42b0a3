//! Typed payloads carried inside `<DATAS>`
//!
//! Every payload starts with a five byte ASCII tag followed by a fixed
//! layout. Multi-byte integers are big-endian. Payloads that do not match a
//! known layout stay opaque: [`Datas::parse`] returns `None` and callers keep
//! the raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const AVERS: &[u8; 5] = b"AVERS";
pub const SVERS: &[u8; 5] = b"SVERS";
pub const STATU: &[u8; 5] = b"STATU";
pub const STATV: &[u8; 5] = b"STATV";
pub const STATP: &[u8; 5] = b"STATP";
pub const STATQ: &[u8; 5] = b"STATQ";
pub const SPACK: &[u8; 5] = b"SPACK";
pub const SETWC: &[u8; 5] = b"SETWC";

const KEY_PRESS_ACTION: u8 = 57;
const SET_ACTION: u8 = 70;

/// Firmware versions reported by the spa
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub en_build: u16,
    pub en_major: u8,
    pub en_minor: u8,
    pub co_build: u16,
    pub co_major: u8,
    pub co_minor: u8,
}

/// One two-byte memory change inside a status push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub pos: u16,
    pub data: [u8; 2],
}

/// Action carried by a pack command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackAction {
    KeyPress {
        key: u8,
    },
    Set {
        config_version: u8,
        log_version: u8,
        pos: u16,
        data: Bytes,
    },
}

/// Known `<DATAS>` payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datas {
    /// `AVERS`: ask the spa for its versions
    VersionQuery { seq: u8 },
    /// `SVERS`: version reply
    Version(Version),
    /// `STATU`: request a memory download
    StatusRequest { seq: u8, start: u16, length: u16 },
    /// `STATV`: one chunk of a memory download
    StatusChunk { seq: u8, next: u8, data: Bytes },
    /// `STATP`: memory changes pushed by the spa
    StatusPush(Vec<StatusChange>),
    /// `STATQ`: acknowledge a push
    StatusAck { seq: u8 },
    /// `SPACK`: pack command
    Pack {
        seq: u8,
        pack_type: u8,
        action: PackAction,
    },
    /// `SETWC`: set watercare mode
    SetWatercare { seq: u8, mode: u8 },
}

impl Datas {
    /// Parse a payload. Returns `None` for unknown tags, short or overlong
    /// bodies, and inconsistent length fields.
    pub fn parse(input: &[u8]) -> Option<Datas> {
        if input.len() < 5 {
            return None;
        }
        let (tag, mut body) = input.split_at(5);

        let datas = match tag {
            t if t == AVERS => Datas::VersionQuery {
                seq: take_u8(&mut body)?,
            },
            t if t == SVERS => Datas::Version(Version {
                en_build: take_u16(&mut body)?,
                en_major: take_u8(&mut body)?,
                en_minor: take_u8(&mut body)?,
                co_build: take_u16(&mut body)?,
                co_major: take_u8(&mut body)?,
                co_minor: take_u8(&mut body)?,
            }),
            t if t == STATU => Datas::StatusRequest {
                seq: take_u8(&mut body)?,
                start: take_u16(&mut body)?,
                length: take_u16(&mut body)?,
            },
            t if t == STATV => {
                let seq = take_u8(&mut body)?;
                let next = take_u8(&mut body)?;
                let length = take_u8(&mut body)?;
                Datas::StatusChunk {
                    seq,
                    next,
                    data: take_bytes(&mut body, length.into())?,
                }
            }
            t if t == STATP => {
                let count = take_u8(&mut body)?;
                let mut changes = Vec::with_capacity(count.into());
                for _ in 0..count {
                    let pos = take_u16(&mut body)?;
                    let data = [take_u8(&mut body)?, take_u8(&mut body)?];
                    changes.push(StatusChange { pos, data });
                }
                Datas::StatusPush(changes)
            }
            t if t == STATQ => Datas::StatusAck {
                seq: take_u8(&mut body)?,
            },
            t if t == SPACK => {
                let seq = take_u8(&mut body)?;
                let pack_type = take_u8(&mut body)?;
                let len = take_u8(&mut body)?;
                let action = take_bytes(&mut body, len.into())?;
                Datas::Pack {
                    seq,
                    pack_type,
                    action: PackAction::parse(&action)?,
                }
            }
            t if t == SETWC => Datas::SetWatercare {
                seq: take_u8(&mut body)?,
                mode: take_u8(&mut body)?,
            },
            _ => return None,
        };

        body.is_empty().then_some(datas)
    }

    /// Wire bytes for this payload
    pub fn compose(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Datas::VersionQuery { seq } => {
                buf.put_slice(AVERS);
                buf.put_u8(*seq);
            }
            Datas::Version(v) => {
                buf.put_slice(SVERS);
                buf.put_u16(v.en_build);
                buf.put_u8(v.en_major);
                buf.put_u8(v.en_minor);
                buf.put_u16(v.co_build);
                buf.put_u8(v.co_major);
                buf.put_u8(v.co_minor);
            }
            Datas::StatusRequest { seq, start, length } => {
                buf.put_slice(STATU);
                buf.put_u8(*seq);
                buf.put_u16(*start);
                buf.put_u16(*length);
            }
            Datas::StatusChunk { seq, next, data } => {
                buf.put_slice(STATV);
                buf.put_u8(*seq);
                buf.put_u8(*next);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
            Datas::StatusPush(changes) => {
                buf.put_slice(STATP);
                buf.put_u8(changes.len() as u8);
                for change in changes {
                    buf.put_u16(change.pos);
                    buf.put_slice(&change.data);
                }
            }
            Datas::StatusAck { seq } => {
                buf.put_slice(STATQ);
                buf.put_u8(*seq);
            }
            Datas::Pack {
                seq,
                pack_type,
                action,
            } => {
                let action = action.compose();
                buf.put_slice(SPACK);
                buf.put_u8(*seq);
                buf.put_u8(*pack_type);
                buf.put_u8(action.len() as u8);
                buf.put_slice(&action);
            }
            Datas::SetWatercare { seq, mode } => {
                buf.put_slice(SETWC);
                buf.put_u8(*seq);
                buf.put_u8(*mode);
            }
        }
        buf.freeze()
    }
}

impl PackAction {
    pub fn parse(input: &[u8]) -> Option<PackAction> {
        let mut body = input;
        let action = match take_u8(&mut body)? {
            KEY_PRESS_ACTION => PackAction::KeyPress {
                key: take_u8(&mut body)?,
            },
            SET_ACTION => {
                let config_version = take_u8(&mut body)?;
                let log_version = take_u8(&mut body)?;
                let pos = take_u16(&mut body)?;
                let data = Bytes::copy_from_slice(body);
                body = &[];
                PackAction::Set {
                    config_version,
                    log_version,
                    pos,
                    data,
                }
            }
            _ => return None,
        };
        body.is_empty().then_some(action)
    }

    pub fn compose(&self) -> Bytes {
        match self {
            PackAction::KeyPress { key } => Bytes::copy_from_slice(&[KEY_PRESS_ACTION, *key]),
            PackAction::Set {
                config_version,
                log_version,
                pos,
                data,
            } => {
                let mut buf = BytesMut::with_capacity(5 + data.len());
                buf.put_u8(SET_ACTION);
                buf.put_u8(*config_version);
                buf.put_u8(*log_version);
                buf.put_u16(*pos);
                buf.put_slice(data);
                buf.freeze()
            }
        }
    }
}

fn take_u8(body: &mut &[u8]) -> Option<u8> {
    (body.remaining() >= 1).then(|| body.get_u8())
}

fn take_u16(body: &mut &[u8]) -> Option<u16> {
    (body.remaining() >= 2).then(|| body.get_u16())
}

fn take_bytes(body: &mut &[u8], len: usize) -> Option<Bytes> {
    (body.remaining() >= len).then(|| body.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_push() {
        let raw = b"STATP\x02\x01\x00\xaa\xbb\x02\x10\x01\x02";
        assert_eq!(
            Datas::parse(raw),
            Some(Datas::StatusPush(vec![
                StatusChange {
                    pos: 0x0100,
                    data: [0xaa, 0xbb]
                },
                StatusChange {
                    pos: 0x0210,
                    data: [0x01, 0x02]
                },
            ]))
        );
    }

    #[test]
    fn test_status_push_count_mismatch() {
        assert_eq!(Datas::parse(b"STATP\x02\x01\x00\xaa\xbb"), None);
        assert_eq!(Datas::parse(b"STATP\x00\x01"), None);
    }

    #[test]
    fn test_key_press_layout() {
        let pack = Datas::Pack {
            seq: 4,
            pack_type: 10,
            action: PackAction::KeyPress { key: 1 },
        };
        assert_eq!(pack.compose().as_ref(), b"SPACK\x04\x0a\x02\x39\x01");
        assert_eq!(Datas::parse(&pack.compose()), Some(pack));
    }

    #[test]
    fn test_set_layout() {
        let pack = Datas::Pack {
            seq: 0,
            pack_type: 10,
            action: PackAction::Set {
                config_version: 7,
                log_version: 8,
                pos: 0x0102,
                data: Bytes::from_static(&[0x03, 0x04]),
            },
        };
        assert_eq!(
            pack.compose().as_ref(),
            b"SPACK\x00\x0a\x07\x46\x07\x08\x01\x02\x03\x04"
        );
    }

    #[test]
    fn test_status_chunk() {
        assert_eq!(
            Datas::parse(b"STATV\x00\x01\x03abc"),
            Some(Datas::StatusChunk {
                seq: 0,
                next: 1,
                data: Bytes::from_static(b"abc")
            })
        );
        assert_eq!(Datas::parse(b"STATV\x00\x01\x04abc"), None);
    }

    #[test]
    fn test_unknown_tags_stay_opaque() {
        assert_eq!(Datas::parse(b"APING"), None);
        assert_eq!(Datas::parse(b"1 < 3"), None);
        assert_eq!(Datas::parse(b"AVERS"), None);
        assert_eq!(Datas::parse(b"AVERS\x01\x02"), None);
    }
}
