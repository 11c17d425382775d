//! BSL protocol dialects and the shared link layer.
//!
//! Every dialect engine implements [`Engine`]; behavior shared between
//! dialects lives in free functions over [`Link`] rather than in a base
//! type, so each engine stays a plain state holder plus its packet
//! sequences.

use std::fmt;
use std::str::FromStr;
use std::thread::sleep;
use std::time::{Duration, Instant};

use scroll::{Pread, BE};

use crate::error::{Error, Result};
use crate::flashing::Progress;
use crate::frame::{ChecksumKind, FrameCodec, MAX_FRAME_LEN, PACKET_END, PACKET_MCU, PACKET_START};
use crate::models::{self, McuModel};
use crate::options::OptionSet;
use crate::transport::{Parity, Transport};

pub mod autodetect;
mod stc12;
mod stc12a;
mod stc15;
mod stc15a;
mod stc8;
mod stc89;
mod usb15;

pub use stc12::{Stc12, Stc12Flavor};
pub use stc12a::Stc12A;
pub use stc15::Stc15;
pub use stc15a::Stc15A;
pub use stc8::Stc8;
pub use stc89::Stc89;
pub use usb15::Usb15;

/// Read timeout while hunting for the power-up announcement.
pub(crate) const DETECT_TIMEOUT: Duration = Duration::from_millis(500);
/// Conservative read timeout once a session is established.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Soft deadline for the whole power-cycle wait.
pub(crate) const CONNECT_DEADLINE: Duration = Duration::from_secs(30);
/// Settling time after commanding a baud change on the device side.
pub(crate) const BAUD_SWITCH_DELAY: Duration = Duration::from_millis(200);
/// Reference frequency used to program flash on the trimming dialects.
pub(crate) const PROGRAM_SPEED: f64 = 22_118_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Stc89,
    Stc12A,
    Stc12B,
    Stc12,
    Stc15A,
    Stc15,
    Stc8,
    Usb15,
    Auto,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Stc89 => "stc89",
            ProtocolKind::Stc12A => "stc12a",
            ProtocolKind::Stc12B => "stc12b",
            ProtocolKind::Stc12 => "stc12",
            ProtocolKind::Stc15A => "stc15a",
            ProtocolKind::Stc15 => "stc15",
            ProtocolKind::Stc8 => "stc8",
            ProtocolKind::Usb15 => "usb15",
            ProtocolKind::Auto => "auto",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "stc89" => ProtocolKind::Stc89,
            "stc12a" => ProtocolKind::Stc12A,
            "stc12b" => ProtocolKind::Stc12B,
            "stc12" => ProtocolKind::Stc12,
            "stc15a" => ProtocolKind::Stc15A,
            "stc15" => ProtocolKind::Stc15,
            "stc8" => ProtocolKind::Stc8,
            "usb15" => ProtocolKind::Usb15,
            "auto" => ProtocolKind::Auto,
            _ => return Err(Error::Protocol(format!("unknown protocol '{}'", s))),
        })
    }
}

/// Everything learned about the target during identify, mutated
/// monotonically by the later protocol steps.
#[derive(Debug, Default, Clone)]
pub struct TargetState {
    pub magic: u16,
    pub model: Option<McuModel>,
    pub clock_hz: f64,
    pub bsl_version: String,
    pub bsl_version_byte: u8,
    pub uid: Option<Vec<u8>>,
}

impl TargetState {
    /// The descriptor must exist before any write-path operation runs.
    pub fn model(&self) -> Result<&McuModel> {
        self.model
            .as_ref()
            .ok_or_else(|| Error::Protocol("target has not been identified yet".into()))
    }
}

/// One serial/USB connection plus its current frame codec.
pub struct Link {
    transport: Box<dyn Transport>,
    codec: FrameCodec,
    usb_counter: u16,
}

impl Link {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Link {
            transport,
            codec: FrameCodec::new(ChecksumKind::Raw),
            usb_counter: 0,
        }
    }

    pub fn set_codec(&mut self, codec: FrameCodec) {
        self.codec = codec;
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        let raw = self.codec.encode_host(payload);
        log::debug!("=> {}", hex::encode(&raw));
        self.transport.write(&raw)
    }

    /// Read and validate one device frame. A silent device gets three
    /// chances at the full deadline each before the link counts as lost; a
    /// timeout mid-frame is a truncated frame.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut attempts = 0;
        let first = loop {
            match self.read_byte(timeout) {
                Ok(b) => break b,
                Err(Error::Timeout) => {
                    attempts += 1;
                    if attempts >= 3 {
                        return Err(Error::LinkLost("three consecutive read timeouts".into()));
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let mut frame = Vec::with_capacity(64);
        if first == PACKET_MCU {
            // some BSL versions skip the frame start on the status packet
            frame.extend_from_slice(&PACKET_START);
            frame.push(PACKET_MCU);
        } else {
            if first != PACKET_START[0] {
                return Err(Error::Frame(crate::error::FrameError::PreambleMismatch));
            }
            frame.push(first);
            for expected in [PACKET_START[1], PACKET_MCU] {
                let b = self.read_byte_mid(timeout)?;
                if b != expected {
                    return Err(Error::Frame(crate::error::FrameError::PreambleMismatch));
                }
                frame.push(b);
            }
        }

        let mut len_bytes = [0u8; 2];
        self.read_exact_mid(&mut len_bytes, timeout)?;
        frame.extend_from_slice(&len_bytes);
        let len = u16::from_be_bytes(len_bytes) as usize;
        if !(4..=MAX_FRAME_LEN).contains(&len) {
            return Err(Error::Frame(crate::error::FrameError::LengthOutOfRange));
        }

        let mut rest = vec![0u8; len - 3];
        self.read_exact_mid(&mut rest, timeout)?;
        frame.extend_from_slice(&rest);

        log::debug!("<= {}", hex::encode(&frame));
        Ok(self.codec.decode_device(&frame)?)
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.transport.read_exact(&mut buf, timeout)?;
        Ok(buf[0])
    }

    fn read_byte_mid(&mut self, timeout: Duration) -> Result<u8> {
        match self.read_byte(timeout) {
            Err(Error::Timeout) => Err(Error::Frame(crate::error::FrameError::Truncated)),
            other => other,
        }
    }

    fn read_exact_mid(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        match self.transport.read_exact(buf, timeout) {
            Err(Error::Timeout) => Err(Error::Frame(crate::error::FrameError::Truncated)),
            other => other,
        }
    }

    pub fn write_usb_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.usb_counter = self.usb_counter.wrapping_add(1);
        let raw = crate::frame::encode_usb(self.usb_counter, payload);
        log::debug!("=> {}", hex::encode(&raw));
        self.transport.write(&raw)
    }

    pub fn read_usb_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = [0u8; 512];
        let mut attempts = 0;
        let n = loop {
            match self.transport.read_chunk(&mut buf, timeout) {
                Ok(n) => break n,
                Err(Error::Timeout) => {
                    attempts += 1;
                    if attempts >= 3 {
                        return Err(Error::LinkLost("three consecutive read timeouts".into()));
                    }
                }
                Err(e) => return Err(e),
            }
        };
        log::debug!("<= {}", hex::encode(&buf[..n]));
        Ok(crate::frame::decode_usb(&buf[..n])?)
    }

    /// Send a sync character until the device starts talking back.
    pub fn pulse(&mut self, character: u8, deadline: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            self.transport.write(&[character])?;
            sleep(Duration::from_millis(15));
            if self.transport.bytes_waiting()? > 0 {
                return Ok(());
            }
            if start.elapsed() > deadline {
                return Err(Error::Timeout);
            }
            if crate::flashing::interrupted() {
                return Err(Error::UserAbort);
            }
        }
    }
}

/// The common capability set of all dialect engines: identify plumbing
/// plus the programming operations the orchestrator drives them with.
pub trait Engine {
    fn kind(&self) -> ProtocolKind;
    fn parity(&self) -> Parity;
    fn codec(&self) -> FrameCodec;
    fn state(&self) -> &TargetState;

    /// Read one announcement/status packet in this dialect's flavor.
    fn read_status(&mut self, link: &mut Link) -> Result<Vec<u8>>;

    /// Populate target state and options from the announcement payload.
    fn initialize(&mut self, status: &[u8]) -> Result<()>;

    /// Log what identify learned.
    fn describe(&self);

    fn options(&self) -> Option<&dyn OptionSet>;
    fn options_mut(&mut self) -> Option<&mut dyn OptionSet>;

    fn transfer_baud(&self) -> u32;
    fn set_transfer_baud(&mut self, baud: u32);

    /// Negotiate the transfer baud (and trim the RC oscillator where the
    /// dialect folds that into the same exchange).
    fn handshake(&mut self, link: &mut Link) -> Result<()>;

    fn erase(&mut self, link: &mut Link, erase_size: usize, flash_size: usize) -> Result<()>;

    /// Block-wise programming starting at `base` (0 for code, the code
    /// region size for EEPROM).
    fn write_blocks(
        &mut self,
        link: &mut Link,
        base: usize,
        data: &[u8],
        first: bool,
        progress: &mut dyn Progress,
    ) -> Result<()>;

    /// Sentinel after the last written block, on dialects that need one.
    fn finish_write(&mut self, _link: &mut Link) -> Result<()> {
        Ok(())
    }

    fn write_options(&mut self, link: &mut Link) -> Result<()>;

    fn terminate(&mut self, link: &mut Link) -> Result<()>;

    fn block_size(&self) -> usize;

    fn supports_trim(&self) -> bool {
        false
    }

    /// Base address of the EEPROM region in the programming address space.
    fn eeprom_base(&self) -> Result<usize> {
        Ok(self.state().model()?.code as usize)
    }
}

pub fn build_engine(
    kind: ProtocolKind,
    handshake_baud: u32,
    transfer_baud: u32,
    trim_khz: f64,
) -> Result<Box<dyn Engine>> {
    let trim_hz = (trim_khz * 1000.0).round();
    Ok(match kind {
        ProtocolKind::Stc89 => Box::new(Stc89::new(handshake_baud, transfer_baud)),
        ProtocolKind::Stc12A => Box::new(Stc12A::new(handshake_baud, transfer_baud)),
        ProtocolKind::Stc12 => Box::new(Stc12::new(handshake_baud, transfer_baud, Stc12Flavor::Plain)),
        ProtocolKind::Stc12B => Box::new(Stc12::new(handshake_baud, transfer_baud, Stc12Flavor::B)),
        ProtocolKind::Stc15A => Box::new(Stc15A::new(handshake_baud, transfer_baud, trim_hz)),
        ProtocolKind::Stc15 => Box::new(Stc15::new(handshake_baud, transfer_baud, trim_hz)),
        ProtocolKind::Stc8 => Box::new(Stc8::new(handshake_baud, transfer_baud, trim_hz)),
        ProtocolKind::Usb15 => Box::new(Usb15::new()),
        ProtocolKind::Auto => {
            return Err(Error::Protocol("autodetect is not a concrete dialect".into()))
        }
    })
}

/// Wait for the spontaneous power-up announcement: keep pulsing the sync
/// character and retrying until a plausible status packet arrives or the
/// soft deadline passes.
pub(crate) fn await_announcement(
    link: &mut Link,
    read_status: &mut dyn FnMut(&mut Link) -> Result<Vec<u8>>,
) -> Result<Vec<u8>> {
    let start = Instant::now();
    loop {
        if crate::flashing::interrupted() {
            return Err(Error::UserAbort);
        }
        let remaining = CONNECT_DEADLINE
            .checked_sub(start.elapsed())
            .ok_or_else(|| Error::LinkLost("no power-up announcement from target".into()))?;
        match link.pulse(0x7f, remaining) {
            Ok(()) => {}
            Err(Error::Timeout) => {
                return Err(Error::LinkLost("no power-up announcement from target".into()))
            }
            Err(e) => return Err(e),
        }
        match read_status(link) {
            Ok(status) if status.len() >= 23 => return Ok(status),
            // short, corrupt or stale packets: keep probing until the
            // connect deadline runs out
            Ok(_)
            | Err(Error::Frame(_))
            | Err(Error::Timeout)
            | Err(Error::LinkLost(_))
            | Err(Error::Protocol(_)) => {}
            Err(e) => return Err(e),
        }
    }
}

/// Baseline status read shared by the even-parity dialects: a 0x80 packet
/// asks for a re-ack at even parity before the real announcement.
pub(crate) fn read_status_with_reack(link: &mut Link, expect: Option<u8>) -> Result<Vec<u8>> {
    let mut status = link.read_frame(DETECT_TIMEOUT)?;
    if status.first() == Some(&0x80) {
        link.transport().set_parity(Parity::Even)?;
        // re-ack is always a dual-checksum frame, even during autodetect
        let reack = FrameCodec::new(ChecksumKind::Dual).encode_host(&[0x80]);
        link.transport().write(&reack)?;
        link.pulse(0x7f, CONNECT_DEADLINE)?;
        status = link.read_frame(DETECT_TIMEOUT)?;
    }
    if let Some(expect) = expect {
        if status.first() != Some(&expect) {
            return Err(Error::Protocol("incorrect magic in status packet".into()));
        }
    }
    Ok(status)
}

/// Re-frame a raw announcement (checksum bytes still attached) so a
/// concrete dialect can verify it under its own checksum rule after
/// autodetection hands over the link.
pub(crate) fn revalidate_announcement(codec: FrameCodec, raw: &[u8]) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(raw.len() + 6);
    frame.extend_from_slice(&PACKET_START);
    frame.push(PACKET_MCU);
    frame.extend_from_slice(&((raw.len() + 4) as u16).to_be_bytes());
    frame.extend_from_slice(raw);
    frame.push(PACKET_END);
    Ok(codec.decode_device(&frame)?)
}

/// Status read of the STC15 lineage: a 0x80 packet wants a plain 0x80 ack
/// before the real announcement, which must lead with 0x50.
pub(crate) fn read_status_50(link: &mut Link) -> Result<Vec<u8>> {
    let mut status = link.read_frame(DETECT_TIMEOUT)?;
    if status.first() == Some(&0x80) {
        link.write_frame(&[0x80])?;
        link.pulse(0x7f, CONNECT_DEADLINE)?;
        status = link.read_frame(DETECT_TIMEOUT)?;
    }
    if status.first() != Some(&0x50) {
        return Err(Error::Protocol("incorrect magic in status packet".into()));
    }
    Ok(status)
}

/// Extract the magic and resolve the model, including the W/E rename for
/// the two shared STC15 magics.
pub(crate) fn identify_model(state: &mut TargetState, status: &[u8]) -> Result<()> {
    let magic: u16 = status.pread_with(20, BE)?;
    let mut model = models::find_model(magic)?;
    if magic == 0xF294 || magic == 0xF2D4 {
        model.name.pop();
        model.name.push(if status[17] < 0x70 { 'E' } else { 'W' });
    }
    state.magic = magic;
    state.model = Some(model);
    Ok(())
}

/// IAP wait states for STC12A and later, straight from the datasheets.
pub(crate) fn iap_delay(clock_hz: f64) -> u8 {
    match clock_hz {
        c if c < 1e6 => 0x87,
        c if c < 2e6 => 0x86,
        c if c < 3e6 => 0x85,
        c if c < 6e6 => 0x84,
        c if c < 12e6 => 0x83,
        c if c < 20e6 => 0x82,
        c if c < 24e6 => 0x81,
        _ => 0x80,
    }
}

/// `cmd 00 00 36 01 <magic>` packets used to start and finish exchanges on
/// the stc12/stc15a lineage.
pub(crate) fn magic_packet(cmd: u8, magic: u16) -> Vec<u8> {
    let mut packet = vec![cmd, 0x00, 0x00, 0x36, 0x01];
    packet.extend_from_slice(&magic.to_be_bytes());
    packet
}

pub(crate) fn warn_baud_error(requested: u32, actual: f64) {
    let error = (requested as f64 - actual).abs() * 100.0 / requested as f64;
    if error > 5.0 {
        log::warn!(
            "baudrate error is {:.2}%. You may need to set a slower rate.",
            error
        );
    }
}

/// Average of the big-endian u16 frequency counters the early dialects
/// report at the start of the announcement.
pub(crate) fn average_counter(status: &[u8], count: usize) -> Result<f64> {
    let mut sum = 0u32;
    for i in 0..count {
        let v: u16 = status.pread_with(1 + 2 * i, BE)?;
        sum += v as u32;
    }
    Ok(sum as f64 / count as f64)
}

/// Two-part BSL version string, e.g. `6.2C`.
pub(crate) fn version2(status: &[u8]) -> (String, u8) {
    let version = status[17];
    let stepping = status[18] as char;
    (
        format!("{}.{}{}", version >> 4, version & 0x0f, stepping),
        version,
    )
}

/// Three-part BSL version string used from STC15 on, e.g. `7.2.4S`.
pub(crate) fn version3(status: &[u8]) -> (String, u8) {
    let version = status[17];
    let stepping = status[18] as char;
    let minor = status[22] & 0x0f;
    (
        format!("{}.{}.{}{}", version >> 4, version & 0x0f, minor, stepping),
        version,
    )
}

pub(crate) fn describe_common(state: &TargetState) {
    if let Some(model) = &state.model {
        log::info!("Target model: {}", model);
        log::info!(
            "Code flash: {:.1} KB, EEPROM flash: {:.1} KB",
            model.code_kb(),
            model.eeprom_kb()
        );
    }
    log::info!("Target frequency: {:.3} MHz", state.clock_hz / 1e6);
    log::info!("Target BSL version: {}", state.bsl_version);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iap_delay_tiers() {
        assert_eq!(iap_delay(0.5e6), 0x87);
        assert_eq!(iap_delay(11.0592e6), 0x83);
        assert_eq!(iap_delay(22.1184e6), 0x81);
        assert_eq!(iap_delay(35e6), 0x80);
    }

    #[test]
    fn magic_packet_layout() {
        assert_eq!(magic_packet(0x50, 0xf449), [0x50, 0x00, 0x00, 0x36, 0x01, 0xf4, 0x49]);
    }

    #[test]
    fn version_strings() {
        let mut status = vec![0u8; 23];
        status[17] = 0x62;
        status[18] = b'C';
        assert_eq!(version2(&status).0, "6.2C");
        status[17] = 0x72;
        status[18] = b'S';
        status[22] = 0x04;
        assert_eq!(version3(&status).0, "7.2.4S");
    }
}
