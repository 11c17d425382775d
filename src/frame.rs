//! Byte-level framing of BSL request/response packets.

use scroll::{Pread, BE};

use crate::error::FrameError;

/// Magic word that starts a packet.
pub const PACKET_START: [u8; 2] = [0x46, 0xb9];
/// Direction byte for packets received from the MCU.
pub const PACKET_MCU: u8 = 0x68;
/// Direction byte for packets sent by the host.
pub const PACKET_HOST: u8 = 0x6a;
/// Magic byte that ends a packet.
pub const PACKET_END: u8 = 0x16;

/// Upper bound on the wire length field. The largest legitimate frame is an
/// option-laden 256-byte write block; anything near this limit is garbage.
pub const MAX_FRAME_LEN: usize = 1024;

/// Per-dialect checksum rule. The early stc89/stc12a BSLs use a single
/// additive byte, everything later uses a 16-bit sum. `Raw` skips
/// verification entirely and keeps the checksum bytes in the payload; it is
/// used by protocol autodetection, which cannot know the rule yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Single,
    Dual,
    Raw,
}

/// UART frame codec, parameterized by the checksum rule.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    checksum: ChecksumKind,
}

impl FrameCodec {
    pub fn new(checksum: ChecksumKind) -> Self {
        FrameCodec { checksum }
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        self.checksum
    }

    /// Bytes counted by the length field beyond the payload itself:
    /// direction byte, the length field, the checksum and the terminator.
    fn overhead(&self) -> usize {
        match self.checksum {
            ChecksumKind::Single => 5,
            ChecksumKind::Dual => 6,
            ChecksumKind::Raw => 4,
        }
    }

    fn checksum_len(&self) -> usize {
        match self.checksum {
            ChecksumKind::Single => 1,
            ChecksumKind::Dual => 2,
            ChecksumKind::Raw => 0,
        }
    }

    /// Serialize a host frame around `payload`.
    pub fn encode_host(&self, payload: &[u8]) -> Vec<u8> {
        self.encode(PACKET_HOST, payload)
    }

    /// Serialize a device frame. Only exercised by tests and by the
    /// autodetect hand-off, which re-frames a raw announcement so the
    /// concrete dialect can verify it under its own checksum rule.
    pub fn encode_device(&self, payload: &[u8]) -> Vec<u8> {
        self.encode(PACKET_MCU, payload)
    }

    fn encode(&self, direction: u8, payload: &[u8]) -> Vec<u8> {
        let len = payload.len() + self.overhead();
        let mut frame = Vec::with_capacity(len + 2);
        frame.extend_from_slice(&PACKET_START);
        frame.push(direction);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        let csum: u32 = frame[2..].iter().map(|&b| b as u32).sum();
        match self.checksum {
            ChecksumKind::Single => frame.push((csum & 0xff) as u8),
            ChecksumKind::Dual => frame.extend_from_slice(&((csum & 0xffff) as u16).to_be_bytes()),
            ChecksumKind::Raw => {}
        }
        frame.push(PACKET_END);
        frame
    }

    /// Validate a complete device frame and return its payload.
    pub fn decode_device(&self, frame: &[u8]) -> Result<Vec<u8>, FrameError> {
        if frame.len() < self.overhead() + 2 {
            return Err(FrameError::Truncated);
        }
        if frame[0..2] != PACKET_START || frame[2] != PACKET_MCU {
            return Err(FrameError::PreambleMismatch);
        }
        let len: u16 = frame.pread_with(3, BE).map_err(|_| FrameError::Truncated)?;
        if len as usize + 2 != frame.len() || (len as usize) > MAX_FRAME_LEN {
            return Err(FrameError::LengthOutOfRange);
        }
        if frame[frame.len() - 1] != PACKET_END {
            return Err(FrameError::TerminatorMissing);
        }
        let csum_at = frame.len() - 1 - self.checksum_len();
        let calc: u32 = frame[2..csum_at].iter().map(|&b| b as u32).sum();
        match self.checksum {
            ChecksumKind::Single => {
                if frame[csum_at] != (calc & 0xff) as u8 {
                    return Err(FrameError::ChecksumMismatch);
                }
            }
            ChecksumKind::Dual => {
                let got = u16::from_be_bytes([frame[csum_at], frame[csum_at + 1]]);
                if got != (calc & 0xffff) as u16 {
                    return Err(FrameError::ChecksumMismatch);
                }
            }
            ChecksumKind::Raw => {}
        }
        Ok(frame[5..csum_at].to_vec())
    }
}

/// USB bulk frame header: packet counter, command, reserved, payload length
/// and an additive checksum over the payload. One frame per bulk transfer.
pub const USB_HEADER_LEN: usize = 8;

pub fn encode_usb(counter: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(USB_HEADER_LEN + payload.len());
    frame.extend_from_slice(&counter.to_be_bytes());
    frame.push(payload.first().copied().unwrap_or(0));
    frame.push(0);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    let csum: u32 = payload.iter().map(|&b| b as u32).sum();
    frame.extend_from_slice(&((csum & 0xffff) as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn decode_usb(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.len() < USB_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    let len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    if len > MAX_FRAME_LEN || frame.len() != USB_HEADER_LEN + len {
        return Err(FrameError::LengthOutOfRange);
    }
    let payload = &frame[USB_HEADER_LEN..];
    let calc: u32 = payload.iter().map(|&b| b as u32).sum();
    if u16::from_be_bytes([frame[6], frame[7]]) != (calc & 0xffff) as u16 {
        return Err(FrameError::ChecksumMismatch);
    }
    Ok(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xorshift(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    #[test]
    fn host_frame_single_checksum_golden() {
        // stc89 option packet: 8d aa ff ff ff
        let codec = FrameCodec::new(ChecksumKind::Single);
        let frame = codec.encode_host(&[0x8d, 0xaa, 0xff, 0xff, 0xff]);
        assert_eq!(frame[..3], [0x46, 0xb9, 0x6a]);
        assert_eq!(frame[3..5], [0x00, 0x0a]);
        let csum = (0x6au32 + 0x0a + 0x8d + 0xaa + 0xff * 3) & 0xff;
        assert_eq!(frame[frame.len() - 2], csum as u8);
        assert_eq!(*frame.last().unwrap(), 0x16);
    }

    #[test]
    fn host_frame_dual_checksum_golden() {
        // The 0x80 re-ack frame, byte for byte.
        let codec = FrameCodec::new(ChecksumKind::Dual);
        let frame = codec.encode_host(&[0x80]);
        assert_eq!(frame, [0x46, 0xb9, 0x6a, 0x00, 0x07, 0x80, 0x00, 0xf1, 0x16]);
    }

    #[test]
    fn device_roundtrip_both_checksums() {
        for kind in [ChecksumKind::Single, ChecksumKind::Dual] {
            let codec = FrameCodec::new(kind);
            let mut state = 0x1234_5678;
            for len in 0..1024usize {
                let payload: Vec<u8> = (0..len).map(|_| xorshift(&mut state) as u8).collect();
                let frame = codec.encode_device(&payload);
                assert_eq!(codec.decode_device(&frame).unwrap(), payload);
            }
        }
    }

    #[test]
    fn raw_codec_keeps_checksum_bytes() {
        let dual = FrameCodec::new(ChecksumKind::Dual);
        let raw = FrameCodec::new(ChecksumKind::Raw);
        let frame = dual.encode_device(&[0x50, 0x01, 0x02]);
        let payload = raw.decode_device(&frame).unwrap();
        // payload plus the two checksum bytes
        assert_eq!(payload.len(), 5);
        assert_eq!(&payload[..3], &[0x50, 0x01, 0x02]);
    }

    #[test]
    fn decode_rejects_corruption() {
        let codec = FrameCodec::new(ChecksumKind::Dual);
        let good = codec.encode_device(&[1, 2, 3]);

        let mut bad = good.clone();
        bad[0] = 0x47;
        assert_eq!(codec.decode_device(&bad), Err(FrameError::PreambleMismatch));

        let mut bad = good.clone();
        bad[6] ^= 0xff;
        assert_eq!(codec.decode_device(&bad), Err(FrameError::ChecksumMismatch));

        let mut bad = good.clone();
        let end = bad.len() - 1;
        bad[end] = 0x00;
        assert_eq!(codec.decode_device(&bad), Err(FrameError::TerminatorMissing));

        let mut bad = good.clone();
        bad[4] += 1;
        assert_eq!(codec.decode_device(&bad), Err(FrameError::LengthOutOfRange));

        assert_eq!(codec.decode_device(&good[..4]), Err(FrameError::Truncated));
    }

    #[test]
    fn usb_roundtrip() {
        let mut state = 0xdead_beef;
        for len in 0..512usize {
            let payload: Vec<u8> = (0..len).map(|_| xorshift(&mut state) as u8).collect();
            let frame = encode_usb(7, &payload);
            assert_eq!(decode_usb(&frame).unwrap(), payload);
        }
    }

    #[test]
    fn usb_rejects_corruption() {
        let frame = encode_usb(1, &[0x05, 0x00]);
        let mut bad = frame.clone();
        bad[7] ^= 1;
        assert_eq!(decode_usb(&bad), Err(FrameError::ChecksumMismatch));
        assert_eq!(decode_usb(&frame[..frame.len() - 1]), Err(FrameError::LengthOutOfRange));
        assert_eq!(decode_usb(&frame[..4]), Err(FrameError::Truncated));
    }
}
