//! Tag-delimited frame encoding/decoding
//!
//! in.touch 2 frame grammar:
//! ```text
//! <HELLO>raw bytes</HELLO>
//! <PACKT>[<SRCCN>source</SRCCN>][<DESCN>destination</DESCN>]<DATAS>content</DATAS></PACKT>
//! ```
//!
//! Tags are ASCII and case-sensitive. Nothing is escaped: a field ends at the
//! first occurrence of its closing tag, so a stray `<` inside `<DATAS>` is
//! just data.
//!
//! Decoding is incremental. A buffer that ends inside a frame is not an
//! error; the partial frame is left unconsumed until more bytes arrive.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Package, PackageContent, Result};

pub const HELLO_OPEN: &[u8] = b"<HELLO>";
pub const HELLO_CLOSE: &[u8] = b"</HELLO>";
pub const PACKT_OPEN: &[u8] = b"<PACKT>";
pub const PACKT_CLOSE: &[u8] = b"</PACKT>";
pub const SRCCN_OPEN: &[u8] = b"<SRCCN>";
pub const SRCCN_CLOSE: &[u8] = b"</SRCCN>";
pub const DESCN_OPEN: &[u8] = b"<DESCN>";
pub const DESCN_CLOSE: &[u8] = b"</DESCN>";
pub const DATAS_OPEN: &[u8] = b"<DATAS>";
pub const DATAS_CLOSE: &[u8] = b"</DATAS>";

/// Result of greedy decoding over a buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Complete frames, in buffer order
    pub packages: Vec<Package>,
    /// Bytes consumed from the front of the buffer (frames and discarded bytes)
    pub consumed: usize,
    /// Bytes skipped because they did not form a valid frame
    pub discarded: usize,
}

/// Encode a package to its wire representation
pub fn encode(package: &Package) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(package));
    match package {
        Package::Hello(payload) => {
            buf.put_slice(HELLO_OPEN);
            buf.put_slice(payload);
            buf.put_slice(HELLO_CLOSE);
        }
        Package::Authorized {
            source,
            destination,
            content,
        } => {
            buf.put_slice(PACKT_OPEN);
            if let Some(source) = source {
                buf.put_slice(SRCCN_OPEN);
                buf.put_slice(source);
                buf.put_slice(SRCCN_CLOSE);
            }
            if let Some(destination) = destination {
                buf.put_slice(DESCN_OPEN);
                buf.put_slice(destination);
                buf.put_slice(DESCN_CLOSE);
            }
            buf.put_slice(DATAS_OPEN);
            buf.put_slice(content.as_bytes());
            buf.put_slice(DATAS_CLOSE);
            buf.put_slice(PACKT_CLOSE);
        }
    }
    buf.freeze()
}

/// Size of the encoded package in bytes
pub fn encoded_len(package: &Package) -> usize {
    match package {
        Package::Hello(payload) => HELLO_OPEN.len() + payload.len() + HELLO_CLOSE.len(),
        Package::Authorized {
            source,
            destination,
            content,
        } => {
            let source = source
                .as_ref()
                .map_or(0, |s| SRCCN_OPEN.len() + s.len() + SRCCN_CLOSE.len());
            let destination = destination
                .as_ref()
                .map_or(0, |d| DESCN_OPEN.len() + d.len() + DESCN_CLOSE.len());
            PACKT_OPEN.len()
                + source
                + destination
                + DATAS_OPEN.len()
                + content.as_bytes().len()
                + DATAS_CLOSE.len()
                + PACKT_CLOSE.len()
        }
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only the beginning of a frame, and the
/// package with the number of bytes it occupied otherwise.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Package, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if let Some(body) = buf.strip_prefix(HELLO_OPEN) {
        return Ok(find(body, HELLO_CLOSE).map(|end| {
            let payload = Bytes::copy_from_slice(&body[..end]);
            (
                Package::Hello(payload),
                HELLO_OPEN.len() + end + HELLO_CLOSE.len(),
            )
        }));
    }

    if let Some(body) = buf.strip_prefix(PACKT_OPEN) {
        let Some(end) = find(body, PACKT_CLOSE) else {
            return Ok(None);
        };
        let package = decode_packt_body(&body[..end])?;
        return Ok(Some((package, PACKT_OPEN.len() + end + PACKT_CLOSE.len())));
    }

    if is_partial_tag(buf, HELLO_OPEN) || is_partial_tag(buf, PACKT_OPEN) {
        return Ok(None);
    }

    Err(Error::UnknownFrame(buf[..buf.len().min(8)].to_vec()))
}

/// Decode as many complete frames as `buf` holds.
///
/// Bytes that cannot start a frame are skipped up to the next `<`. A trailing
/// partial frame is left in place: `consumed` stops in front of it.
pub fn decode(buf: &[u8]) -> Decoded {
    let mut decoded = Decoded::default();

    while decoded.consumed < buf.len() {
        let rest = &buf[decoded.consumed..];
        match decode_frame(rest) {
            Ok(Some((package, used))) => {
                decoded.packages.push(package);
                decoded.consumed += used;
            }
            Ok(None) => break,
            Err(_) => {
                let skip = rest[1..]
                    .iter()
                    .position(|&b| b == b'<')
                    .map_or(rest.len(), |pos| pos + 1);
                decoded.consumed += skip;
                decoded.discarded += skip;
            }
        }
    }

    decoded
}

/// Decode a datagram that must hold exactly one complete frame
pub fn decode_datagram(buf: &[u8]) -> Result<Package> {
    match decode_frame(buf)? {
        Some((package, used)) if used == buf.len() => Ok(package),
        Some((_, used)) => Err(Error::TrailingData(buf.len() - used)),
        None => Err(Error::Incomplete),
    }
}

fn decode_packt_body(inner: &[u8]) -> Result<Package> {
    let (source, rest) = optional_field(inner, SRCCN_OPEN, SRCCN_CLOSE)?;
    let (destination, rest) = optional_field(rest, DESCN_OPEN, DESCN_CLOSE)?;

    let Some(body) = rest.strip_prefix(DATAS_OPEN) else {
        return Err(Error::MalformedFrame("missing <DATAS>".to_string()));
    };
    let Some(end) = find(body, DATAS_CLOSE) else {
        return Err(Error::MalformedFrame("unterminated <DATAS>".to_string()));
    };
    let trailing = body.len() - end - DATAS_CLOSE.len();
    if trailing != 0 {
        return Err(Error::MalformedFrame(format!(
            "{} bytes after </DATAS>",
            trailing
        )));
    }

    Ok(Package::Authorized {
        source,
        destination,
        content: PackageContent::from_bytes(Bytes::copy_from_slice(&body[..end])),
    })
}

fn optional_field<'a>(
    input: &'a [u8],
    open: &[u8],
    close: &[u8],
) -> Result<(Option<Bytes>, &'a [u8])> {
    let Some(body) = input.strip_prefix(open) else {
        return Ok((None, input));
    };
    let Some(end) = find(body, close) else {
        return Err(Error::MalformedFrame(format!(
            "unterminated {}",
            String::from_utf8_lossy(open)
        )));
    };
    Ok((
        Some(Bytes::copy_from_slice(&body[..end])),
        &body[end + close.len()..],
    ))
}

fn is_partial_tag(buf: &[u8], tag: &[u8]) -> bool {
    buf.len() < tag.len() && tag.starts_with(buf)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let package = Package::hello(&b"My hello"[..]);
        let encoded = encode(&package);
        assert_eq!(encoded.as_ref(), b"<HELLO>My hello</HELLO>");
        assert_eq!(encoded.len(), encoded_len(&package));
        assert_eq!(decode_datagram(&encoded).unwrap(), package);
    }

    #[test]
    fn test_truncated_frames_are_incomplete() {
        let encoded = encode(&Package::authorized(
            &b"src"[..],
            &b"dst"[..],
            PackageContent::Ping,
        ));
        for len in 0..encoded.len() {
            assert_eq!(decode_frame(&encoded[..len]).unwrap(), None, "len {}", len);
        }
    }

    #[test]
    fn test_unknown_frame_start() {
        assert!(matches!(
            decode_frame(b"<HALLO>x</HALLO>"),
            Err(Error::UnknownFrame(_))
        ));
    }

    #[test]
    fn test_missing_datas_is_malformed() {
        assert!(matches!(
            decode_frame(b"<PACKT><SRCCN>a</SRCCN></PACKT>"),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_decode_skips_garbage() {
        let decoded = decode(b"xx<HELLO>1</HELLO>");
        assert_eq!(decoded.packages, vec![Package::hello(&b"1"[..])]);
        assert_eq!(decoded.discarded, 2);
        assert_eq!(decoded.consumed, 18);
    }
}
