//! STC89/90 series dialect: no parity, single-byte checksums, three-step
//! baud switch.

use std::thread::sleep;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flashing::Progress;
use crate::frame::{ChecksumKind, FrameCodec};
use crate::options::{OptionSet, Stc89Options};
use crate::transport::Parity;

use super::{
    average_counter, describe_common, identify_model, magic_packet, version2, warn_baud_error,
    Engine, Link, ProtocolKind, TargetState, BAUD_SWITCH_DELAY, DETECT_TIMEOUT, READ_TIMEOUT,
};

pub struct Stc89 {
    handshake_baud: u32,
    transfer_baud: u32,
    state: TargetState,
    cpu_6t: bool,
    opts: Option<Stc89Options>,
}

impl Stc89 {
    pub fn new(handshake_baud: u32, transfer_baud: u32) -> Self {
        Stc89 {
            handshake_baud,
            transfer_baud,
            state: TargetState::default(),
            cpu_6t: false,
            opts: None,
        }
    }

    /// BRT reload value plus its checksum byte, wait states and the post
    /// switch delay for the 0x8F/0x8E exchange.
    fn calculate_baud(&self) -> Result<(u16, u8, u8, u8)> {
        let clock = self.state.clock_hz;
        let sample_rate = if self.cpu_6t { 16.0 } else { 32.0 };
        let divisor = (clock / (self.transfer_baud as f64 * sample_rate)).round() as i64;
        if !(1..=65535).contains(&divisor) {
            return Err(Error::Protocol("requested baudrate cannot be set".into()));
        }
        let brt = (65536 - divisor) as u16;
        let brt_csum = (2 * (256 - brt as i64)).rem_euclid(256) as u8;
        let actual = clock / (sample_rate * divisor as f64);
        warn_baud_error(self.transfer_baud, actual);

        let iap_wait = match clock {
            c if c < 5e6 => 0x83,
            c if c < 10e6 => 0x82,
            c if c < 20e6 => 0x81,
            _ => 0x80,
        };
        Ok((brt, brt_csum, iap_wait, 0xa0))
    }
}

impl Engine for Stc89 {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Stc89
    }

    fn parity(&self) -> Parity {
        Parity::None
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(ChecksumKind::Single)
    }

    fn state(&self) -> &TargetState {
        &self.state
    }

    fn read_status(&mut self, link: &mut Link) -> Result<Vec<u8>> {
        let status = link.read_frame(DETECT_TIMEOUT)?;
        if status.first() != Some(&0x00) {
            return Err(Error::Protocol("incorrect magic in status packet".into()));
        }
        Ok(status)
    }

    fn initialize(&mut self, status: &[u8]) -> Result<()> {
        identify_model(&mut self.state, status)?;

        self.cpu_6t = status[19] & 1 == 0;
        let cpu_t = if self.cpu_6t { 6.0 } else { 12.0 };
        let counter = average_counter(status, 8)?;
        self.state.clock_hz = self.handshake_baud as f64 * counter * cpu_t / 7.0;

        let (version, byte) = version2(status);
        self.state.bsl_version = version;
        self.state.bsl_version_byte = byte;

        self.opts = Some(Stc89Options::new(status[19]));
        Ok(())
    }

    fn describe(&self) {
        describe_common(&self.state);
        if let Some(opts) = &self.opts {
            opts.describe();
        }
    }

    fn options(&self) -> Option<&dyn OptionSet> {
        self.opts.as_ref().map(|o| o as &dyn OptionSet)
    }

    fn options_mut(&mut self) -> Option<&mut dyn OptionSet> {
        self.opts.as_mut().map(|o| o as &mut dyn OptionSet)
    }

    fn transfer_baud(&self) -> u32 {
        self.transfer_baud
    }

    fn set_transfer_baud(&mut self, baud: u32) {
        self.transfer_baud = baud;
    }

    fn handshake(&mut self, link: &mut Link) -> Result<()> {
        log::info!("Switching to {} baud", self.transfer_baud);
        let (brt, brt_csum, iap, delay) = self.calculate_baud()?;
        let brt_high_inv = 0xff - (brt >> 8) as u8;

        // check that the device can do the rate
        let mut packet = vec![0x8f];
        packet.extend_from_slice(&brt.to_be_bytes());
        packet.extend_from_slice(&[brt_high_inv, brt_csum, delay, iap]);
        link.write_frame(&packet)?;
        sleep(BAUD_SWITCH_DELAY);
        link.transport().set_baud(self.transfer_baud)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        link.transport().set_baud(self.handshake_baud)?;
        if response.first() != Some(&0x8f) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        // commit the rate
        let mut packet = vec![0x8e];
        packet.extend_from_slice(&brt.to_be_bytes());
        packet.extend_from_slice(&[brt_high_inv, brt_csum, delay]);
        link.write_frame(&packet)?;
        sleep(BAUD_SWITCH_DELAY);
        link.transport().set_baud(self.transfer_baud)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x8e) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        // ping-pong test at the new rate
        let packet = magic_packet(0x80, self.state.magic);
        for _ in 0..4 {
            link.write_frame(&packet)?;
            let response = link.read_frame(READ_TIMEOUT)?;
            if response.first() != Some(&0x80) {
                return Err(Error::Protocol("incorrect magic in handshake packet".into()));
            }
        }
        Ok(())
    }

    fn erase(&mut self, link: &mut Link, erase_size: usize, _flash_size: usize) -> Result<()> {
        let blks = ((erase_size + 511) / 512 * 2) as u8;
        log::info!("Erasing {} blocks", blks);
        let packet = [0x84, blks, 0x33, 0x33, 0x33, 0x33, 0x33, 0x33];
        link.write_frame(&packet)?;
        let wait = Duration::from_secs(self.state.model()?.erase_wait_secs);
        let response = link.read_frame(wait)?;
        if response.first() != Some(&0x80) {
            return Err(Error::Protocol("incorrect magic in erase packet".into()));
        }
        Ok(())
    }

    fn write_blocks(
        &mut self,
        link: &mut Link,
        base: usize,
        data: &[u8],
        _first: bool,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        program_blocks_checked(link, self.block_size(), base, data, progress)
    }

    fn write_options(&mut self, link: &mut Link) -> Result<()> {
        log::info!("Setting options");
        let msr = self.opts.as_ref().map(|o| o.msr()).unwrap_or_default();
        let packet = [0x8d, msr[0], 0xff, 0xff, 0xff];
        link.write_frame(&packet)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x8d) {
            return Err(Error::Protocol("incorrect magic in option packet".into()));
        }
        Ok(())
    }

    fn terminate(&mut self, link: &mut Link) -> Result<()> {
        link.write_frame(&[0x82])?;
        log::info!("Disconnected");
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.state.model.as_ref().map(|m| m.block).unwrap_or(128)
    }
}

/// Block write with the per-block verify checksum in the ack, shared by the
/// stc89 and stc12a dialects.
pub(crate) fn program_blocks_checked(
    link: &mut Link,
    block: usize,
    base: usize,
    data: &[u8],
    progress: &mut dyn Progress,
) -> Result<()> {
    for (i, chunk) in data.chunks(block).enumerate() {
        if crate::flashing::interrupted() {
            return Err(Error::UserAbort);
        }
        let addr = base + i * block;
        let mut packet = vec![0u8; 3];
        packet.extend_from_slice(&(addr as u16).to_be_bytes());
        packet.extend_from_slice(&(block as u16).to_be_bytes());
        packet.extend_from_slice(chunk);
        packet.resize(block + 7, 0x00);
        let csum = (packet[7..].iter().map(|&b| b as u32).sum::<u32>() & 0xff) as u8;
        link.write_frame(&packet)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x80) {
            return Err(Error::Protocol("incorrect magic in write packet".into()));
        }
        if response.get(1) != Some(&csum) {
            return Err(Error::Protocol("verification checksum mismatch".into()));
        }
        progress.on_bytes(i * block + chunk.len(), data.len());
    }
    Ok(())
}
