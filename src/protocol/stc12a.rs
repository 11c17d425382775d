//! STC12x052 dialect: stc89 framing with an 8-bit baud-rate generator and
//! the long countdown erase packet.

use std::thread::sleep;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flashing::Progress;
use crate::frame::{ChecksumKind, FrameCodec};
use crate::options::{OptionSet, Stc12AOptions};
use crate::transport::Parity;

use super::stc89::program_blocks_checked;
use super::{
    average_counter, describe_common, iap_delay, identify_model, magic_packet, version2,
    warn_baud_error, Engine, Link, ProtocolKind, TargetState, BAUD_SWITCH_DELAY, DETECT_TIMEOUT,
    READ_TIMEOUT,
};

pub struct Stc12A {
    handshake_baud: u32,
    transfer_baud: u32,
    state: TargetState,
    opts: Option<Stc12AOptions>,
}

impl Stc12A {
    pub fn new(handshake_baud: u32, transfer_baud: u32) -> Self {
        Stc12A {
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

impl Engine for Stc12A {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Stc12A
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

        let counter = average_counter(status, 8)?;
        self.state.clock_hz = self.handshake_baud as f64 * counter * 12.0 / 7.0;

        let (version, byte) = version2(status);
        self.state.bsl_version = version;
        self.state.bsl_version_byte = byte;

        if status.len() < 31 {
            return Err(Error::Protocol("invalid options in status packet".into()));
        }
        let mut msr = [0u8; 4];
        msr[..3].copy_from_slice(&status[23..26]);
        msr[3] = status[29];
        self.opts = Some(Stc12AOptions::new(msr));
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

        let packet = [0x8f, 0xc0, brt, 0x3f, brt_csum, delay, iap];
        link.write_frame(&packet)?;
        sleep(BAUD_SWITCH_DELAY);
        link.transport().set_baud(self.transfer_baud)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        link.transport().set_baud(self.handshake_baud)?;
        if response.first() != Some(&0x8f) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        let packet = [0x8e, 0xc0, brt, 0x3f, brt_csum, delay];
        link.write_frame(&packet)?;
        sleep(BAUD_SWITCH_DELAY);
        link.transport().set_baud(self.transfer_baud)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x8e) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

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

    fn erase(&mut self, link: &mut Link, erase_size: usize, flash_size: usize) -> Result<()> {
        log::info!("Erasing flash");
        let packet = countdown_erase_packet(erase_size, flash_size, 0x0d);
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
        program_options_12a(
            link,
            &msr,
            self.state.clock_hz,
            self.state.bsl_version_byte,
        )
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

/// Countdown-style erase packet shared by the stc12a/stc12/stc15a lineage.
pub(crate) fn countdown_erase_packet(erase_size: usize, flash_size: usize, countdown: u8) -> Vec<u8> {
    let blks = ((erase_size + 511) / 512 * 2) as u8;
    let size = ((flash_size + 511) / 512 * 2) as u8;
    let mut packet = vec![
        0x84, 0xff, 0x00, blks, 0x00, 0x00, size, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ];
    packet.extend((countdown + 1..=0x80).rev());
    packet
}

/// The long options packet of the stc12a/stc12b dialects, with the measured
/// MCU clock embedded twice and the MSR bytes scattered through it.
pub(crate) fn program_options_12a(
    link: &mut Link,
    msr: &[u8],
    clock_hz: f64,
    bsl_version: u8,
) -> Result<()> {
    let clock = (clock_hz as u32).to_be_bytes();
    let mut packet = vec![0x8d, msr[0], msr[1], msr[2], 0xff, msr[3]];
    packet.extend_from_slice(&clock);
    packet.push(msr[3]);
    packet.extend_from_slice(&[0xff, msr[0], msr[1], 0xff, 0xff, 0xff, 0xff, msr[2]]);
    packet.extend_from_slice(&[0xff; 7]);
    packet.extend_from_slice(&clock);
    packet.extend_from_slice(&[0xff, 0xff, 0xff]);

    link.write_frame(&packet)?;
    let response = link.read_frame(READ_TIMEOUT)?;
    if response.first() != Some(&0x80) {
        return Err(Error::Protocol("incorrect magic in option packet".into()));
    }

    // STC-ISP does this extra exchange on newer parts; replicate it.
    if bsl_version >= 0x66 {
        link.write_frame(&[0x50])?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x10) {
            return Err(Error::Protocol("incorrect magic in option packet".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_erase_layout() {
        let packet = countdown_erase_packet(1024, 8192, 0x0d);
        assert_eq!(packet[0], 0x84);
        assert_eq!(packet[3], 4); // 1024 bytes -> 2 * 2 blocks
        assert_eq!(packet[6], 32); // 8192 bytes -> 2 * 16 blocks
        assert_eq!(packet[19], 0x80);
        assert_eq!(*packet.last().unwrap(), 0x0e);
        assert_eq!(packet.len(), 19 + (0x80 - 0x0d));
    }
}
