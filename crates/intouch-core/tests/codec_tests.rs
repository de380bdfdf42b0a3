//! Wire codec tests

use bytes::Bytes;
use intouch_core::{decode, decode_datagram, decode_frame, encode, Error, Package, PackageContent};

fn sample_packages() -> Vec<Package> {
    vec![
        Package::hello(&b"My hello"[..]),
        Package::hello(Bytes::new()),
        Package::Authorized {
            source: Some(Bytes::from_static(b"some-src")),
            destination: None,
            content: PackageContent::Ping,
        },
        Package::authorized(&b"some-src"[..], &b"some-dest"[..], PackageContent::Pong),
        Package::Authorized {
            source: None,
            destination: Some(Bytes::from_static(b"dst")),
            content: PackageContent::Unknown(Bytes::from_static(b"STATQ\x05")),
        },
        Package::Authorized {
            source: None,
            destination: None,
            content: PackageContent::Unknown(Bytes::new()),
        },
    ]
}

#[test]
fn test_roundtrip_single_frames() {
    for package in sample_packages() {
        let encoded = encode(&package);
        let decoded = decode(&encoded);
        assert_eq!(decoded.packages, vec![package.clone()]);
        assert_eq!(decoded.consumed, encoded.len());
        assert_eq!(decoded.discarded, 0);
    }
}

#[test]
fn test_ping_from_sender() {
    let package =
        decode_datagram(b"<PACKT><SRCCN>sender-id</SRCCN><DATAS>APING</DATAS></PACKT>").unwrap();
    assert_eq!(
        package,
        Package::Authorized {
            source: Some(Bytes::from_static(b"sender-id")),
            destination: None,
            content: PackageContent::Ping,
        }
    );
}

#[test]
fn test_pong_between_peers() {
    let package = decode_datagram(
        b"<PACKT><SRCCN>sender-id</SRCCN><DESCN>receiver-id</DESCN><DATAS>APING.</DATAS></PACKT>",
    )
    .unwrap();
    assert_eq!(
        package,
        Package::authorized(&b"sender-id"[..], &b"receiver-id"[..], PackageContent::Pong)
    );
}

#[test]
fn test_less_than_is_plain_data() {
    let package = decode_datagram(b"<PACKT><DATAS>1 < 3</DATAS></PACKT>").unwrap();
    assert_eq!(
        package.content(),
        Some(&PackageContent::Unknown(Bytes::from_static(b"1 < 3")))
    );
}

#[test]
fn test_near_ping_is_unknown() {
    let package = decode_datagram(b"<PACKT><DATAS>APUNG</DATAS></PACKT>").unwrap();
    assert_eq!(
        package.content(),
        Some(&PackageContent::Unknown(Bytes::from_static(b"APUNG")))
    );
}

#[test]
fn test_stream_of_frames_with_partial_tail() {
    let mut stream = Vec::new();
    for package in sample_packages() {
        stream.extend_from_slice(&encode(&package));
    }
    let complete = stream.len();
    stream.extend_from_slice(b"<PACKT><DATAS>API");

    let decoded = decode(&stream);
    assert_eq!(decoded.packages, sample_packages());
    assert_eq!(decoded.consumed, complete);

    // the tail decodes once the rest arrives
    let mut tail = stream[decoded.consumed..].to_vec();
    tail.extend_from_slice(b"NG</DATAS></PACKT>");
    let decoded = decode(&tail);
    assert_eq!(decoded.packages.len(), 1);
    assert_eq!(decoded.packages[0].content(), Some(&PackageContent::Ping));
    assert_eq!(decoded.consumed, tail.len());
}

#[test]
fn test_partial_open_tag_waits() {
    assert_eq!(decode_frame(b"<PAC").unwrap(), None);
    assert_eq!(decode_frame(b"<").unwrap(), None);
    let decoded = decode(b"<HELLO>1</HELLO><HEL");
    assert_eq!(decoded.packages.len(), 1);
    assert_eq!(decoded.consumed, 16);
}

#[test]
fn test_malformed_frame_is_skipped() {
    let stream = b"<PACKT><DATAS>x</DATAS>junk</PACKT><HELLO>ok</HELLO>";
    let decoded = decode(stream);
    assert_eq!(decoded.packages, vec![Package::hello(&b"ok"[..])]);
    assert_eq!(decoded.consumed, stream.len());
    assert!(decoded.discarded > 0);
}

#[test]
fn test_datagram_errors() {
    assert_eq!(decode_datagram(b"<HELLO>abc"), Err(Error::Incomplete));
    assert_eq!(
        decode_datagram(b"<HELLO>a</HELLO>xy"),
        Err(Error::TrailingData(2))
    );
    assert!(matches!(
        decode_datagram(b"<PACKT><DESCN>a</DESCN><SRCCN>b</SRCCN><DATAS>x</DATAS></PACKT>"),
        Err(Error::MalformedFrame(_))
    ));
    assert!(matches!(
        decode_datagram(b"garbage"),
        Err(Error::UnknownFrame(_))
    ));
}

#[test]
fn test_hello_payload_may_contain_delimiter() {
    let package = decode_datagram(b"<HELLO>SPA00:11:22|My Spa</HELLO>").unwrap();
    assert_eq!(package, Package::hello(&b"SPA00:11:22|My Spa"[..]));
}
