//! STC8 dialect: STC15 packet sequences with its own calibration search
//! (the trim divider) and a 40-byte option image.

use std::time::Duration;

use scroll::{Pread, BE};

use crate::error::{Error, Result};
use crate::flashing::Progress;
use crate::frame::{ChecksumKind, FrameCodec};
use crate::options::{OptionSet, Stc8Options};
use crate::transport::Parity;

use super::stc15::{
    choose_range, choose_trim, erase_keyed, finish_write_keyed, program_blocks_keyed,
};
use super::{
    describe_common, iap_delay, identify_model, read_status_50, version3, Engine, Link,
    ProtocolKind, TargetState, READ_TIMEOUT,
};

pub struct Stc8 {
    handshake_baud: u32,
    transfer_baud: u32,
    trim_hz: f64,
    state: TargetState,
    opts: Option<Stc8Options>,
    wakeup_freq: u32,
    reference_mv: u16,
    mfg_date: (u16, u8, u8),
    trim_value: Option<(u8, u8)>,
    trim_divider: u8,
    trim_frequency: f64,
}

impl Stc8 {
    pub fn new(handshake_baud: u32, transfer_baud: u32, trim_hz: f64) -> Self {
        Stc8 {
            handshake_baud,
            transfer_baud,
            trim_hz,
            state: TargetState::default(),
            opts: None,
            wakeup_freq: 0,
            reference_mv: 0,
            mfg_date: (0, 0, 0),
            trim_value: None,
            trim_divider: 1,
            trim_frequency: 0.0,
        }
    }

    fn key(&self) -> bool {
        self.state.bsl_version_byte >= 0x72
    }

    fn calibrate(&mut self, link: &mut Link) -> Result<()> {
        if self.state.clock_hz == 0.0 && self.trim_hz <= 0.0 {
            return Err(Error::TrimFailed(
                "target is uncalibrated, please provide a trim frequency".into(),
            ));
        }

        let user_speed = if self.trim_hz > 0.0 {
            self.trim_hz
        } else {
            self.state.clock_hz
        };
        let half_baud = self.handshake_baud as f64 / 2.0;
        let target_user_count = (user_speed / half_baud).round() as i64;

        // round one: a single coarse sweep; the divider search below maps
        // fast targets into the measurable range
        log::info!("Trimming frequency");
        let mut packet = vec![0x00, 12];
        packet.extend_from_slice(&[0x00, 0x00]);
        for i in 1..=10u16 {
            packet.push((23 * i) as u8);
            packet.push(0x00);
        }
        packet.extend_from_slice(&[255, 0x00]);
        link.write_frame(&packet)?;
        link.pulse(0xfe, Duration::from_secs(1))?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.len() < 2 || response[0] != 0x00 {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        let mut user_trim = None;
        for divider in 1..=5u8 {
            user_trim = choose_range(&packet[2..], &response, target_user_count * divider as i64)?;
            if user_trim.is_some() {
                self.trim_divider = divider;
                break;
            }
        }
        let user_trim =
            user_trim.ok_or_else(|| Error::TrimFailed("no coarse range brackets the target".into()))?;

        // round two: three candidates in each of the four trim banks
        let mut packet = vec![0x00, 12];
        for bank in 0..4u8 {
            for i in user_trim.0 - 1..user_trim.0 + 2 {
                packet.push((i & 0xff) as u8);
                packet.push(bank);
            }
        }
        link.write_frame(&packet)?;
        link.pulse(0xfe, Duration::from_secs(1))?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.len() < 2 || response[0] != 0x00 {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        let (pair, count) = choose_trim(&packet[2..], &response, target_user_count)?;
        self.trim_value = Some(pair);
        self.trim_frequency = (count as f64 * half_baud / self.trim_divider as f64).round();
        log::info!("Trimmed to {:.3} MHz", self.trim_frequency / 1e6);
        if self.trim_hz > 0.0 {
            let error = (self.trim_frequency - user_speed).abs() / user_speed;
            if error > 0.005 {
                return Err(Error::TrimFailed(format!(
                    "best achievable frequency is {:.3} MHz, {:.2}% off target",
                    self.trim_frequency / 1e6,
                    error * 100.0
                )));
            }
        }

        // switch baud; programming runs from the 24 MHz reference
        log::info!("Switching to {} baud", self.transfer_baud);
        let mut packet = vec![0x01, 0x00, 0x00];
        let divisor = (65535.0 - 24e6 / (self.transfer_baud as f64 * 4.0)).round();
        packet.extend_from_slice(&(divisor as u16).to_be_bytes());
        packet.push(pair.1);
        packet.push(pair.0);
        packet.push(iap_delay(24e6));
        link.write_frame(&packet)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.first() != Some(&0x01) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }
        link.transport().set_baud(self.transfer_baud)?;
        Ok(())
    }

    fn build_options(&self) -> Result<Vec<u8>> {
        let trim_value = self
            .trim_value
            .ok_or_else(|| Error::Protocol("options require a completed handshake".into()))?;
        let msr = self.opts.as_ref().map(|o| o.msr()).unwrap_or_default();
        let mut packet = vec![0xff; 40];
        packet[3] = 0;
        packet[6] = 0;
        packet[22] = 0;
        packet[24..28].copy_from_slice(&(self.trim_frequency as u32).to_be_bytes());
        packet[28] = trim_value.0;
        packet[29] = trim_value.1;
        packet[30] = self.trim_divider;
        packet[32] = msr[0];
        packet[36..40].copy_from_slice(&msr[1..5]);
        Ok(packet)
    }
}

fn decode_packed_bcd(byte: u8) -> u8 {
    (byte & 0x0f) + 10 * (byte >> 4)
}

impl Engine for Stc8 {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Stc8
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
        read_status_50(link)
    }

    fn initialize(&mut self, status: &[u8]) -> Result<()> {
        identify_model(&mut self.state, status)?;
        if status.len() < 40 {
            return Err(Error::Protocol("status packet too short".into()));
        }

        let clock: u32 = status.pread_with(1, BE)?;
        // all ones means the part shipped uncalibrated
        self.state.clock_hz = if clock == 0xffff_ffff { 0.0 } else { clock as f64 };

        let wakeup: u16 = status.pread_with(23, BE)?;
        self.wakeup_freq = wakeup as u32;
        self.reference_mv = status.pread_with(35, BE)?;
        self.mfg_date = (
            2000 + decode_packed_bcd(status[37]) as u16,
            decode_packed_bcd(status[38]),
            decode_packed_bcd(status[39]),
        );

        let (version, byte) = version3(status);
        self.state.bsl_version = version;
        self.state.bsl_version_byte = byte;

        let mut msr = [0u8; 5];
        msr[..3].copy_from_slice(&status[9..12]);
        msr[3..5].copy_from_slice(&status[15..17]);
        self.opts = Some(Stc8Options::new(msr));
        Ok(())
    }

    fn describe(&self) {
        describe_common(&self.state);
        log::info!("Target wakeup frequency: {:.3} KHz", self.wakeup_freq as f64 / 1000.0);
        log::info!("Target ref. voltage: {} mV", self.reference_mv);
        log::info!(
            "Target mfg. date: {:04}-{:02}-{:02}",
            self.mfg_date.0,
            self.mfg_date.1,
            self.mfg_date.2
        );
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
        self.calibrate(link)?;

        let mut packet = vec![0x05];
        if self.key() {
            packet.extend_from_slice(&[0x00, 0x00, 0x5a, 0xa5]);
        }
        link.write_frame(&packet)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.len() == 1 && response[0] == 0x0f {
            return Err(Error::DeviceNak("MCU is locked".into()));
        }
        if response.first() != Some(&0x05) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }
        Ok(())
    }

    fn erase(&mut self, link: &mut Link, _erase_size: usize, _flash_size: usize) -> Result<()> {
        let wait = Duration::from_secs(self.state.model()?.erase_wait_secs);
        let key = self.key();
        erase_keyed(link, &mut self.state, key, wait)
    }

    fn write_blocks(
        &mut self,
        link: &mut Link,
        base: usize,
        data: &[u8],
        first: bool,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        program_blocks_keyed(link, self.block_size(), base, data, first, self.key(), progress)
    }

    fn finish_write(&mut self, link: &mut Link) -> Result<()> {
        finish_write_keyed(link, self.key())
    }

    fn write_options(&mut self, link: &mut Link) -> Result<()> {
        log::info!("Setting options");
        let mut packet = vec![0x04, 0x00, 0x00];
        if self.key() {
            packet.extend_from_slice(&[0x5a, 0xa5]);
        }
        packet.extend_from_slice(&self.build_options()?);
        link.write_frame(&packet)?;
        let response = link.read_frame(READ_TIMEOUT)?;
        if response.len() < 2 || response[0] != 0x04 || response[1] != 0x54 {
            return Err(Error::Protocol("incorrect magic in option packet".into()));
        }
        if let Some(uid) = &self.state.uid {
            log::info!("Target UID: {}", hex::encode_upper(uid));
        }
        Ok(())
    }

    fn terminate(&mut self, link: &mut Link) -> Result<()> {
        link.write_frame(&[0xff])?;
        log::info!("Disconnected");
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.state.model.as_ref().map(|m| m.block).unwrap_or(128)
    }

    fn eeprom_base(&self) -> Result<usize> {
        let model = self.state.model()?;
        if model.iap {
            if let Some(opts) = &self.opts {
                let split = opts.eeprom_split();
                if split >= 512 && split % 512 == 0 && split < model.total {
                    return Ok(split as usize);
                }
            }
        }
        Ok(model.code as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcd_decoding() {
        assert_eq!(decode_packed_bcd(0x24), 24);
        assert_eq!(decode_packed_bcd(0x09), 9);
        assert_eq!(decode_packed_bcd(0x31), 31);
    }
}
