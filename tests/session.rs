//! Whole-session tests against a scripted transport.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use common::{assert_frames_in_order, MockTransport};
use stcisp::error::Error;
use stcisp::flashing::{Flashing, NullProgress, SessionConfig};
use stcisp::frame::{ChecksumKind, FrameCodec};
use stcisp::protocol::ProtocolKind;

fn config(protocol: ProtocolKind) -> SessionConfig {
    SessionConfig {
        protocol,
        handshake_baud: 2400,
        transfer_baud: 19200,
        trim_khz: 0.0,
        power_cycle: None,
    }
}

fn session(mock: &MockTransport, cfg: SessionConfig) -> Flashing {
    Flashing::new(Box::new(mock.clone()), cfg, Box::new(NullProgress))
}

fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("stcisp-{}-{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

fn ihex_for(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let addr = i * 16;
        let mut line = vec![chunk.len() as u8, (addr >> 8) as u8, addr as u8, 0x00];
        line.extend_from_slice(chunk);
        let sum: u32 = line.iter().map(|&b| b as u32).sum();
        line.push((0u32.wrapping_sub(sum) & 0xff) as u8);
        out.push(':');
        out.push_str(&hex::encode_upper(&line));
        out.push('\n');
    }
    out.push_str(":00000001FF\n");
    out
}

/// Announcement of an IAP15F2K61S2 with the internal RC selected.
fn stc15_status(bsl_version: u8, bsl_minor: u8, magic: u16) -> Vec<u8> {
    let mut status = vec![0u8; 40];
    status[0] = 0x50;
    status[1..3].copy_from_slice(&35000u16.to_be_bytes()); // wakeup counter
    status[4] = 0x40; // 24 MHz pre-trim
    status[5] = 0x01;
    status[6] = 0x40;
    status[7] = 0x03; // internal clock
    status[12] = 0x01;
    status[13..15].copy_from_slice(&0x2b51u16.to_be_bytes()); // freq counter
    status[17] = bsl_version;
    status[18] = b'S';
    status[20..22].copy_from_slice(&magic.to_be_bytes());
    status[22] = bsl_minor;
    status[37] = 0xfd;
    status
}

#[test]
fn identify_only_stc15() {
    let dual = FrameCodec::new(ChecksumKind::Dual);
    let mock = MockTransport::new();
    mock.push_read(&dual.encode_device(&stc15_status(0x71, 0x04, 0xf449)));

    let mut session = session(&mock, config(ProtocolKind::Stc15));
    session.run(None, None, &[]).unwrap();

    let target = session.target().unwrap();
    assert_eq!(target.model.as_ref().unwrap().name, "IAP15F2K61S2");
    assert_eq!(target.bsl_version, "7.1.4S");
    assert!((target.model.as_ref().unwrap().code_kb() - 61.0).abs() < f64::EPSILON);
    // the factory counter converts to just above 10 MHz
    assert!(target.clock_hz > 10.00e6 && target.clock_hz < 10.10e6);

    // clean disconnect, nothing left unread
    assert_frames_in_order(&mock.writes(), &[dual.encode_host(&[0xff])]);
    assert_eq!(mock.leftover_reads(), 0);
    // stc15 talks with even parity from the start
    assert_eq!(mock.parities().first(), Some(&stcisp::transport::Parity::Even));
}

#[test]
fn program_stc89_binary() {
    let single = FrameCodec::new(ChecksumKind::Single);
    let mock = MockTransport::new();

    // announcement: STC89C52RC at 11.0592 MHz, 12T
    let mut status = vec![0u8; 23];
    status[0] = 0x00;
    for i in 0..8 {
        status[1 + 2 * i..3 + 2 * i].copy_from_slice(&2688u16.to_be_bytes());
    }
    status[17] = 0x61;
    status[18] = b'C';
    status[19] = 0x01; // 12T part
    status[20..22].copy_from_slice(&0xf002u16.to_be_bytes());
    mock.push_read(&single.encode_device(&status));

    // handshake check/set, four pings, erase, one block, options
    mock.push_read(&single.encode_device(&[0x8f]));
    mock.push_read(&single.encode_device(&[0x8e]));
    for _ in 0..4 {
        mock.push_read(&single.encode_device(&[0x80]));
    }
    mock.push_read(&single.encode_device(&[0x80]));

    let code: Vec<u8> = (0u32..80).map(|i| i as u8).collect();
    let mut block = code.clone();
    block.resize(128, 0xff);
    let block_csum = (block.iter().map(|&b| b as u32).sum::<u32>() & 0xff) as u8;
    mock.push_read(&single.encode_device(&[0x80, block_csum]));
    mock.push_read(&single.encode_device(&[0x8d]));

    let path = temp_file("stc89.bin", &code);
    let mut session = session(&mock, config(ProtocolKind::Stc89));
    session.run(Some(&path), None, &[]).unwrap();
    std::fs::remove_file(&path).unwrap();

    // 11059200 / (19200 * 32) = 18 -> BRT 0xffee
    let mut write_payload = vec![0u8, 0, 0, 0, 0, 0, 128];
    write_payload.extend_from_slice(&block);
    assert_frames_in_order(
        &mock.writes(),
        &[
            single.encode_host(&[0x8f, 0xff, 0xee, 0x00, 0x24, 0xa0, 0x81]),
            single.encode_host(&[0x8e, 0xff, 0xee, 0x00, 0x24, 0xa0]),
            single.encode_host(&[0x80, 0x00, 0x00, 0x36, 0x01, 0xf0, 0x02]),
            single.encode_host(&[0x84, 0x02, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33]),
            single.encode_host(&write_payload),
            single.encode_host(&[0x8d, 0x01, 0xff, 0xff, 0xff]),
            single.encode_host(&[0x82]),
        ],
    );
    assert_eq!(mock.leftover_reads(), 0);
    // the session ends up at the transfer baud
    assert_eq!(mock.bauds().last(), Some(&19200));
}

#[test]
fn program_stc15_hex_with_trim() {
    let dual = FrameCodec::new(ChecksumKind::Dual);
    let mock = MockTransport::new();

    // BSL 7.2.5S wants the 5A A5 key and the write-finish sentinel
    mock.push_read(&dual.encode_device(&stc15_status(0x72, 0x05, 0xf449)));

    // calibration round one: counts over the four coarse ranges
    let mut round1 = vec![0x00, 12];
    for count in [
        4000u16, 4400, 4800, 6000, 8000, 10000, 12000, 16000, 20000, 22000, 30000, 34000,
    ] {
        round1.extend_from_slice(&count.to_be_bytes());
    }
    mock.push_read(&dual.encode_device(&round1));

    // round two: user candidates land on 8333 (9.9996 MHz), program
    // candidates on 18432 (22.1184 MHz)
    let mut round2 = vec![0x00, 12];
    for count in [
        8200u16, 8266, 8333, 8400, 8466, 8533, 18300, 18400, 18432, 18500, 18560, 18600,
    ] {
        round2.extend_from_slice(&count.to_be_bytes());
    }
    mock.push_read(&dual.encode_device(&round2));

    mock.push_read(&dual.encode_device(&[0x01])); // baud switch ack
    mock.push_read(&dual.encode_device(&[0x05])); // prepare ack
    mock.push_read(&dual.encode_device(&[0x03, 1, 2, 3, 4, 5, 6, 7])); // erase ack + UID
    mock.push_read(&dual.encode_device(&[0x02, 0x54])); // block ack
    mock.push_read(&dual.encode_device(&[0x07, 0x54])); // finish ack
    mock.push_read(&dual.encode_device(&[0x04, 0x54])); // options ack

    let code: Vec<u8> = (0u32..80).map(|i| (i * 3) as u8).collect();
    let path = temp_file("stc15.hex", ihex_for(&code).as_bytes());

    let mut cfg = config(ProtocolKind::Stc15);
    cfg.trim_khz = 10_000.0;
    let mut session = session(&mock, cfg);
    session.run(Some(&path), None, &[]).unwrap();
    std::fs::remove_file(&path).unwrap();

    // one 256-byte block, 0xFF padded, opened with the 0x22 command
    let mut block_payload = vec![0x22, 0x00, 0x00, 0x5a, 0xa5];
    block_payload.extend_from_slice(&code);
    block_payload.resize(5 + 256, 0xff);

    assert_frames_in_order(
        &mock.writes(),
        &[
            // interpolated program trim 205/0x40, user trim 148/0x80,
            // 22118400 / (19200 * 4) = 288 -> divisor 0xfedf
            dual.encode_host(&[0x01, 204, 0x40, 0xfe, 0xdf, 148, 0x80, 0x81]),
            dual.encode_host(&[0x05, 0x00, 0x00, 0x5a, 0xa5]),
            dual.encode_host(&[0x03, 0x00, 0x00, 0x5a, 0xa5]),
            dual.encode_host(&block_payload),
            dual.encode_host(&[0x07, 0x00, 0x00, 0x5a, 0xa5]),
            dual.encode_host(&[0xff]),
        ],
    );

    let target = session.target().unwrap();
    assert_eq!(target.uid.as_deref(), Some(&[1, 2, 3, 4, 5, 6, 7][..]));
    assert_eq!(mock.leftover_reads(), 0);
}

#[test]
fn corrupted_handshake_response_is_retried() {
    let single = FrameCodec::new(ChecksumKind::Single);
    let mock = MockTransport::new();

    let mut status = vec![0u8; 23];
    status[0] = 0x00;
    for i in 0..8 {
        status[1 + 2 * i..3 + 2 * i].copy_from_slice(&2688u16.to_be_bytes());
    }
    status[17] = 0x61;
    status[18] = b'C';
    status[19] = 0x01;
    status[20..22].copy_from_slice(&0xf002u16.to_be_bytes());
    mock.push_read(&single.encode_device(&status));

    // first baud-check reply arrives corrupted; the handshake is retried
    // at the handshake baud and succeeds on the second attempt
    let mut corrupt = single.encode_device(&[0x8f]);
    corrupt[5] ^= 0x01;
    mock.push_read(&corrupt);
    mock.push_read(&single.encode_device(&[0x8f]));
    mock.push_read(&single.encode_device(&[0x8e]));
    for _ in 0..4 {
        mock.push_read(&single.encode_device(&[0x80]));
    }
    mock.push_read(&single.encode_device(&[0x80]));

    let code = vec![0x02u8; 16];
    let mut block = code.clone();
    block.resize(128, 0xff);
    let block_csum = (block.iter().map(|&b| b as u32).sum::<u32>() & 0xff) as u8;
    mock.push_read(&single.encode_device(&[0x80, block_csum]));
    mock.push_read(&single.encode_device(&[0x8d]));

    let path = temp_file("retry.bin", &code);
    let mut session = session(&mock, config(ProtocolKind::Stc89));
    session.run(Some(&path), None, &[]).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(mock.leftover_reads(), 0);
}

#[test]
fn corrupted_announcement_is_retried() {
    let dual = FrameCodec::new(ChecksumKind::Dual);
    let mock = MockTransport::new();

    let good = dual.encode_device(&stc15_status(0x71, 0x04, 0xf449));
    let mut corrupt = good.clone();
    corrupt[10] ^= 0xff;
    mock.push_read(&corrupt);
    mock.push_read(&good);

    let mut session = session(&mock, config(ProtocolKind::Stc15));
    session.run(None, None, &[]).unwrap();

    let target = session.target().unwrap();
    assert_eq!(target.model.as_ref().unwrap().magic, 0xf449);
    assert_eq!(mock.leftover_reads(), 0);
}

#[test]
fn unknown_model_is_fatal_before_any_command() {
    let dual = FrameCodec::new(ChecksumKind::Dual);
    let mock = MockTransport::new();
    mock.push_read(&dual.encode_device(&stc15_status(0x71, 0x04, 0xdead)));

    let mut session = session(&mock, config(ProtocolKind::Stc15));
    let err = session.run(None, None, &[]).unwrap_err();
    assert!(matches!(err, Error::UnknownModel(0xdead)));

    // only sync pulses ever left the host
    assert!(mock.writes().iter().all(|&b| b == 0x7f));
}

#[test]
fn autodetect_ambiguity_lists_both_candidates() {
    let dual = FrameCodec::new(ChecksumKind::Dual);
    let mock = MockTransport::new();

    // an STC12C5204AD announcement matches both stc12 and stc12b
    let mut status = vec![0u8; 29];
    status[0] = 0x50;
    for i in 0..8 {
        status[1 + 2 * i..3 + 2 * i].copy_from_slice(&2688u16.to_be_bytes());
    }
    status[17] = 0x62;
    status[18] = b'C';
    status[20..22].copy_from_slice(&0xe204u16.to_be_bytes());
    mock.push_read(&dual.encode_device(&status));

    let mut session = session(&mock, config(ProtocolKind::Auto));
    let err = session.run(None, None, &[]).unwrap_err();
    match err {
        Error::AutodetectAmbiguous(candidates) => {
            assert!(candidates.contains(&"stc12".to_string()));
            assert!(candidates.contains(&"stc12b".to_string()));
        }
        other => panic!("expected ambiguity, got {}", other),
    }

    // nothing but sync pulses after the announcement was read
    assert!(mock.writes().iter().all(|&b| b == 0x7f));
}

#[test]
fn autoreset_asserts_the_line_once() {
    let dual = FrameCodec::new(ChecksumKind::Dual);
    let mock = MockTransport::new();
    mock.push_read(&dual.encode_device(&stc15_status(0x71, 0x04, 0xf449)));

    let mut cfg = config(ProtocolKind::Stc15);
    cfg.power_cycle = Some(stcisp::flashing::PowerCycle::Line(Duration::from_millis(1)));
    let mut session = session(&mock, cfg);
    session.run(None, None, &[]).unwrap();
    assert_eq!(mock.resets(), 1);
}
