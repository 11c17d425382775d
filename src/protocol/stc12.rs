//! STC10/11/12 mainline dialect, covering the plain and the "B" flavor
//! (which commits options the stc12a way).

use std::thread::sleep;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flashing::Progress;
use crate::frame::{ChecksumKind, FrameCodec};
use crate::options::{OptionSet, Stc12Options};
use crate::transport::Parity;

use super::stc12a::{countdown_erase_packet, program_options_12a};
use super::{
    average_counter, describe_common, iap_delay, identify_model, magic_packet,
    read_status_with_reack, version2, warn_baud_error, Engine, Link, ProtocolKind, TargetState,
    BAUD_SWITCH_DELAY, READ_TIMEOUT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stc12Flavor {
    Plain,
    B,
}

pub struct Stc12 {
    flavor: Stc12Flavor,
    handshake_baud: u32,
    transfer_baud: u32,
    state: TargetState,
    opts: Option<Stc12Options>,
}

impl Stc12 {
    pub fn new(handshake_baud: u32, transfer_baud: u32, flavor: Stc12Flavor) -> Self {
        Stc12 {
            flavor,
            handshake_baud,
            transfer_baud,
            state: TargetState::default(),
            opts: None,
        }
    }

    fn calculate_baud(&self) -> Result<(u8, u8, u8, u8)> {
        let clock = self.state.clock_hz;
        let divisor = (clock / (self.transfer_baud as f64 * 16.0)).round() as i64;
        let brt = 256 - divisor;
        if brt <= 1 || brt > 255 {
            return Err(Error::Protocol("requested baudrate cannot be set".into()));
        }
        let brt_csum = (2 * (256 - brt)).rem_euclid(256) as u8;
        let actual = clock / (16.0 * divisor as f64);
        warn_baud_error(self.transfer_baud, actual);
        Ok((brt as u8, brt_csum, iap_delay(clock), 0x80))
    }
}

impl Engine for Stc12 {
    fn kind(&self) -> ProtocolKind {
        match self.flavor {
            Stc12Flavor::Plain => ProtocolKind::Stc12,
            Stc12Flavor::B => ProtocolKind::Stc12B,
        }
    }

    fn parity(&self) -> Parity {
        Parity::Even
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(ChecksumKind::Dual)
    }

    fn state(&self) -> &TargetState {
        &self.state
    }

    fn read_status(&mut self, link: &mut Link) -> Result<Vec<u8>> {
        read_status_with_reack(link, None)
    }

    fn initialize(&mut self, status: &[u8]) -> Result<()> {
        identify_model(&mut self.state, status)?;

        let counter = average_counter(status, 8)?;
        self.state.clock_hz = self.handshake_baud as f64 * counter * 12.0 / 7.0;

        let (version, byte) = version2(status);
        self.state.bsl_version = version;
        self.state.bsl_version_byte = byte;

        if status.len() < 29 {
            return Err(Error::Protocol("invalid options in status packet".into()));
        }
        let mut msr = [0u8; 4];
        msr[..3].copy_from_slice(&status[23..26]);
        msr[3] = status[27];
        self.opts = Some(Stc12Options::new(msr));
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
        let (brt, brt_csum, iap, delay) = self.calculate_baud()?;
        log::info!("Switching to {} baud", self.transfer_baud);

        link.write_frame(&magic_packet(0x50, self.state.magic))?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x8f) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        // try the new settings
        let packet = [0x8f, 0xc0, brt, 0x3f, brt_csum, delay, iap];
        link.write_frame(&packet)?;
        sleep(BAUD_SWITCH_DELAY);
        link.transport().set_baud(self.transfer_baud)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        link.transport().set_baud(self.handshake_baud)?;
        if response.first() != Some(&0x8f) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        // commit
        let packet = [0x8e, 0xc0, brt, 0x3f, brt_csum, delay];
        link.write_frame(&packet)?;
        sleep(BAUD_SWITCH_DELAY);
        link.transport().set_baud(self.transfer_baud)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x84) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }
        Ok(())
    }

    fn erase(&mut self, link: &mut Link, erase_size: usize, flash_size: usize) -> Result<()> {
        log::info!("Erasing flash");
        let packet = countdown_erase_packet(erase_size, flash_size, 0x0d);
        link.write_frame(&packet)?;
        let wait = Duration::from_secs(self.state.model()?.erase_wait_secs);
        let response = link.read_frame(wait)?;
        if response.first() != Some(&0x00) {
            return Err(Error::Protocol("incorrect magic in erase packet".into()));
        }
        // UID is only sent with this packet by some BSLs
        if response.len() >= 8 {
            self.state.uid = Some(response[1..8].to_vec());
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
        program_blocks_simple(link, self.block_size(), base, data, progress)
    }

    fn finish_write(&mut self, link: &mut Link) -> Result<()> {
        finish_write_69(link, self.state.magic)
    }

    fn write_options(&mut self, link: &mut Link) -> Result<()> {
        log::info!("Setting options");
        let msr = self.opts.as_ref().map(|o| o.msr()).unwrap_or_default();
        match self.flavor {
            Stc12Flavor::B => {
                program_options_12a(link, &msr, self.state.clock_hz, self.state.bsl_version_byte)?
            }
            Stc12Flavor::Plain => {
                // msr[3] index is not entirely consistent between parts, so
                // write it to both candidate positions.
                let mut packet = vec![
                    0x8d, msr[0], msr[1], msr[2], msr[3], 0xff, 0xff, 0xff, 0xff, msr[3], 0xff,
                    0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
                ];
                packet.extend_from_slice(&(self.state.clock_hz as u32).to_be_bytes());
                link.write_frame(&packet)?;
                let response = link.read_frame(READ_TIMEOUT)?;
                if response.first() != Some(&0x50) {
                    return Err(Error::Protocol("incorrect magic in option packet".into()));
                }
                // UID arrives here when the erase ack did not carry it
                if self.state.uid.is_none() && response.len() >= 25 {
                    self.state.uid = Some(response[18..25].to_vec());
                }
            }
        }
        if let Some(uid) = &self.state.uid {
            log::info!("Target UID: {}", hex::encode_upper(uid));
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

/// The 0x69 write-finish sentinel, shared with stc15a.
pub(crate) fn finish_write_69(link: &mut Link, magic: u16) -> Result<()> {
    log::info!("Finishing write");
    link.write_frame(&magic_packet(0x69, magic))?;
    let response = link.read_frame(READ_TIMEOUT)?;
    if response.first() != Some(&0x8d) {
        return Err(Error::Protocol("incorrect magic in finish packet".into()));
    }
    Ok(())
}

/// Plain block write, ack carries no checksum. Shared with stc15a.
pub(crate) fn program_blocks_simple(
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
        link.write_frame(&packet)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x00) {
            return Err(Error::Protocol("incorrect magic in write packet".into()));
        }
        progress.on_bytes(i * block + chunk.len(), data.len());
    }
    Ok(())
}
