//! Early STC15 dialect. The baud-switch handshake doubles as the RC trim
//! procedure: two challenge-response rounds against the factory trim data,
//! then a switch to the fixed programming frequency.

use std::thread::sleep;
use std::time::Duration;

use scroll::{Pread, BE};

use crate::error::{Error, Result};
use crate::flashing::Progress;
use crate::frame::{ChecksumKind, FrameCodec};
use crate::options::{OptionSet, Stc15AOptions};
use crate::transport::Parity;

use super::stc12::{finish_write_69, program_blocks_simple};
use super::stc12a::countdown_erase_packet;
use super::{
    average_counter, describe_common, iap_delay, identify_model, magic_packet, version2, Engine,
    Link, ProtocolKind, TargetState, BAUD_SWITCH_DELAY, PROGRAM_SPEED, READ_TIMEOUT,
};

pub struct Stc15A {
    handshake_baud: u32,
    transfer_baud: u32,
    trim_hz: f64,
    state: TargetState,
    opts: Option<Stc15AOptions>,
    trim_data: Option<[u8; 7]>,
    freq_counter: f64,
}

impl Stc15A {
    pub fn new(handshake_baud: u32, transfer_baud: u32, trim_hz: f64) -> Self {
        Stc15A {
            handshake_baud,
            transfer_baud,
            trim_hz,
            state: TargetState::default(),
            opts: None,
            trim_data: None,
            freq_counter: 0.0,
        }
    }

    /// Frequency-specific coarse trim challenges for the first round.
    fn trim_sequence(frequency: f64) -> &'static [u8] {
        if frequency < 7.5e6 {
            &[
                0x18, 0x00, 0x02, 0x00, 0x18, 0x80, 0x02, 0x00, 0x18, 0x80, 0x02, 0x00, 0x18,
                0xff, 0x02, 0x00,
            ]
        } else if frequency < 10e6 {
            &[
                0x18, 0x80, 0x02, 0x00, 0x18, 0xff, 0x02, 0x00, 0x58, 0x00, 0x02, 0x00, 0x58,
                0xff, 0x02, 0x00,
            ]
        } else if frequency < 15e6 {
            &[
                0x58, 0x00, 0x02, 0x00, 0x58, 0x80, 0x02, 0x00, 0x58, 0x80, 0x02, 0x00, 0x58,
                0xff, 0x02, 0x00,
            ]
        } else if frequency < 21e6 {
            &[
                0x58, 0x80, 0x02, 0x00, 0x58, 0xff, 0x02, 0x00, 0x98, 0x00, 0x02, 0x00, 0x98,
                0x80, 0x02, 0x00,
            ]
        } else if frequency < 31e6 {
            &[
                0x98, 0x00, 0x02, 0x00, 0x98, 0x80, 0x02, 0x00, 0x98, 0x80, 0x02, 0x00, 0x98,
                0xff, 0x02, 0x00,
            ]
        } else {
            &[
                0xd8, 0x00, 0x02, 0x00, 0xd8, 0x80, 0x02, 0x00, 0xd8, 0x80, 0x02, 0x00, 0xd8,
                0xb4, 0x02, 0x00,
            ]
        }
    }
}

impl Engine for Stc15A {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Stc15A
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
        super::read_status_50(link)
    }

    fn initialize(&mut self, status: &[u8]) -> Result<()> {
        identify_model(&mut self.state, status)?;

        let counter = average_counter(status, 4)?;
        self.freq_counter = counter;
        self.state.clock_hz = self.handshake_baud as f64 * counter * 12.0 / 7.0;

        let (version, byte) = version2(status);
        self.state.bsl_version = version;
        self.state.bsl_version_byte = byte;

        if status.len() >= 58 {
            let mut trim_data = [0u8; 7];
            trim_data.copy_from_slice(&status[51..58]);
            self.trim_data = Some(trim_data);
        }

        if status.len() < 37 {
            return Err(Error::Protocol("invalid options in status packet".into()));
        }
        let mut msr = [0u8; 13];
        msr.copy_from_slice(&status[23..36]);
        self.opts = Some(Stc15AOptions::new(msr));
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

    fn supports_trim(&self) -> bool {
        true
    }

    fn handshake(&mut self, link: &mut Link) -> Result<()> {
        let trim_data = self
            .trim_data
            .ok_or_else(|| Error::TrimFailed("no factory trim data in announcement".into()))?;

        let user_speed = if self.trim_hz > 0.0 {
            self.trim_hz
        } else {
            self.state.clock_hz
        };
        let user_count = (self.freq_counter * user_speed / self.state.clock_hz) as i64;
        let program_count = (self.freq_counter * PROGRAM_SPEED / self.state.clock_hz) as i64;

        log::info!("Trimming frequency");
        link.write_frame(&magic_packet(0x50, self.state.magic))?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x8f) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        // round one: coarse ranges for the target and program frequencies
        let mut packet = vec![0x65];
        packet.extend_from_slice(&trim_data);
        packet.extend_from_slice(&[0xff, 0xff, 0x06, 0x06]);
        packet.extend_from_slice(Self::trim_sequence(user_speed));
        packet.extend_from_slice(&[0x98, 0x00, 0x02, 0x00, 0x98, 0x80, 0x02, 0x00]);
        link.write_frame(&packet)?;
        link.pulse(0x7f, Duration::from_secs(1))?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.len() < 36 || response[0] != 0x65 {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        // programming-speed trim from the last two challenge points
        let trim_a: u16 = response.pread_with(28, BE)?;
        let count_a: u16 = response.pread_with(30, BE)?;
        let trim_b: u16 = response.pread_with(32, BE)?;
        let count_b: u16 = response.pread_with(34, BE)?;
        if count_a == count_b {
            return Err(Error::TrimFailed("calibration counts did not vary".into()));
        }
        let m = (trim_b as f64 - trim_a as f64) / (count_b as f64 - count_a as f64);
        let n = trim_a as f64 - m * count_a as f64;
        let program_trim = (m * program_count as f64 + n).round() as i64;
        if !(0..=65535).contains(&program_trim) {
            return Err(Error::TrimFailed("program trim out of range".into()));
        }

        // pick the coarse range bracketing the user frequency
        let mut points = [(0u16, 0u16); 4];
        for (i, point) in points.iter_mut().enumerate() {
            point.0 = response.pread_with(12 + 4 * i, BE)?;
            point.1 = response.pread_with(14 + 4 * i, BE)?;
        }
        let (ta, tb, ca, cb) = if points[2].1 as i64 <= user_count && points[3].1 as i64 >= user_count
        {
            (points[2].0, points[3].0, points[2].1, points[3].1)
        } else {
            (points[0].0, points[1].0, points[0].1, points[1].1)
        };
        if ca == cb {
            return Err(Error::TrimFailed("calibration counts did not vary".into()));
        }
        let m = (tb as f64 - ta as f64) / (cb as f64 - ca as f64);
        let n = ta as f64 - m * ca as f64;
        let target_trim = (m * user_count as f64 + n).round() as i64;
        let start = target_trim.saturating_sub(5).max(ta as i64).min(tb as i64);
        if start + 11 > 65535 || start < 0 {
            return Err(Error::TrimFailed("trim scan out of range".into()));
        }

        // round two: linear scan of eleven candidates around the estimate
        let mut packet = vec![0x65];
        packet.extend_from_slice(&trim_data);
        packet.extend_from_slice(&[0xff, 0xff, 0x06, 0x0b]);
        for i in 0..11u16 {
            packet.extend_from_slice(&((start as u16 + i).to_be_bytes()));
            packet.extend_from_slice(&[0x02, 0x00]);
        }
        link.write_frame(&packet)?;
        link.pulse(0x7f, Duration::from_secs(1))?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.len() < 56 || response[0] != 0x65 {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        let mut best_trim = 0u16;
        let mut best_count = 65535u16;
        for i in 0..11 {
            let trim: u16 = response.pread_with(12 + 4 * i, BE)?;
            let count: u16 = response.pread_with(14 + 4 * i, BE)?;
            if (count as i64 - user_count).abs() < (best_count as i64 - user_count).abs() {
                best_trim = trim;
                best_count = count;
            }
        }
        let final_freq = best_count as f64 / self.freq_counter * self.state.clock_hz;
        log::info!("Trimmed to {:.3} MHz", final_freq / 1e6);
        if self.trim_hz > 0.0 {
            let error = (final_freq - user_speed).abs() / user_speed;
            if error > 0.005 {
                return Err(Error::TrimFailed(format!(
                    "best achievable frequency is {:.3} MHz, {:.2}% off target",
                    final_freq / 1e6,
                    error * 100.0
                )));
            }
        }
        if let Some(opts) = &mut self.opts {
            opts.set_trim(best_trim);
        }

        // switch to the programming frequency and the transfer baud
        log::info!("Switching to {} baud", self.transfer_baud);
        let mut packet = vec![0x8e];
        packet.extend_from_slice(&(program_trim as u16).to_be_bytes());
        packet.push((230400 / self.transfer_baud) as u8);
        packet.extend_from_slice(&[0xa1, 0x64, 0xb8, 0x00, iap_delay(PROGRAM_SPEED), 0x20, 0xff, 0x00]);
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
        let packet = countdown_erase_packet(erase_size, flash_size, 0x5e);
        link.write_frame(&packet)?;
        let wait = Duration::from_secs(self.state.model()?.erase_wait_secs);
        let response = link.read_frame(wait)?;
        if response.first() != Some(&0x00) {
            return Err(Error::Protocol("incorrect magic in erase packet".into()));
        }
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
        let mut packet = vec![0x8d];
        packet.extend_from_slice(&msr);
        packet.extend_from_slice(&[0xff; 6]);
        link.write_frame(&packet)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x50) {
            return Err(Error::Protocol("incorrect magic in option packet".into()));
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
        self.state.model.as_ref().map(|m| m.block).unwrap_or(256)
    }
}
