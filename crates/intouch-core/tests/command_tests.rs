//! Command translation tests

use bytes::Bytes;
use intouch_core::datas::{Datas, PackAction};
use intouch_core::{AddressWidth, Command, CommandConfig, Error, Translator, Width};

fn translator() -> Translator {
    Translator::new(
        CommandConfig {
            pack_type: 10,
            config_version: 3,
            log_version: 4,
            known_keys: vec![1, 17],
            addresses: vec![
                AddressWidth {
                    address: 0x0001,
                    width: Width::U16,
                },
                AddressWidth {
                    address: 0x0131,
                    width: Width::U8,
                },
            ],
            ..Default::default()
        },
        0x200,
    )
}

#[test]
fn test_raw_write_layout() {
    let t = translator();
    let mut translated = t
        .translate(&Command::RawWrite {
            address: 0x0001,
            data: Bytes::from_static(&[0x01, 0x68]),
        })
        .unwrap();
    let payloads = t.drain(&mut translated);
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        Datas::parse(&payloads[0]),
        Some(Datas::Pack {
            seq: 0,
            pack_type: 10,
            action: PackAction::Set {
                config_version: 3,
                log_version: 4,
                pos: 0x0001,
                data: Bytes::from_static(&[0x01, 0x68]),
            },
        })
    );
}

#[test]
fn test_width_mismatch_rejected() {
    let t = translator();
    let result = t.translate(&Command::RawWrite {
        address: 0x0131,
        data: Bytes::from_static(&[1, 2]),
    });
    assert!(matches!(result, Err(Error::InvalidCommand(_))));
}

#[test]
fn test_mode_write() {
    let t = translator();
    let mut translated = t.translate(&Command::ModeWrite { value: 2 }).unwrap();
    assert_eq!(
        t.next_payload(&mut translated).and_then(|payload| Datas::parse(&payload)),
        Some(Datas::SetWatercare { seq: 0, mode: 2 })
    );
}

#[test]
fn test_key_presses_use_fresh_sequence_numbers() {
    let t = translator();
    let mut translated = t.translate(&Command::KeyPress { key: 17, count: 3 }).unwrap();
    let seqs: Vec<u8> = t
        .drain(&mut translated)
        .iter()
        .map(|payload| match Datas::parse(payload) {
            Some(Datas::Pack {
                seq,
                action: PackAction::KeyPress { key: 17 },
                ..
            }) => seq,
            other => panic!("unexpected payload {:?}", other),
        })
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}

#[test]
fn test_open_key_set() {
    let t = Translator::new(CommandConfig::default(), 16);
    assert!(t.translate(&Command::KeyPress { key: 200, count: 1 }).is_ok());
}

#[test]
fn test_config_defaults_from_partial_json() {
    let config: CommandConfig =
        serde_json::from_str(r#"{"pack_type": 7, "addresses": [{"address": 1, "width": "u16"}]}"#)
            .unwrap();
    assert_eq!(config.pack_type, 7);
    assert_eq!(config.key_press_delay_ms, 250);
    assert_eq!(config.addresses[0].width, Width::U16);
}
