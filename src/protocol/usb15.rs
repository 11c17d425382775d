//! STC15 semantics carried over USB bulk frames. No baud negotiation, no
//! trim; programming runs from the pre-tuned 24 MHz reference.

use std::thread::sleep;
use std::time::Duration;

use scroll::{Pread, BE};

use crate::error::{Error, Result};
use crate::flashing::Progress;
use crate::frame::{ChecksumKind, FrameCodec};
use crate::options::{OptionSet, Stc15Options};
use crate::transport::Parity;

use super::stc15::{build_option_image, FREQ_COUNTER_LSB_HZ};
use super::{
    describe_common, identify_model, version3, Engine, Link, ProtocolKind, TargetState,
    DETECT_TIMEOUT, READ_TIMEOUT,
};

pub struct Usb15 {
    state: TargetState,
    opts: Option<Stc15Options>,
    freq_count_24: u8,
    wakeup_freq: u32,
}

impl Usb15 {
    pub fn new() -> Self {
        Usb15 {
            state: TargetState::default(),
            opts: None,
            freq_count_24: 0,
            wakeup_freq: 0,
        }
    }

    fn exchange(&self, link: &mut Link, payload: &[u8], settle: Duration) -> Result<Vec<u8>> {
        link.write_usb_frame(payload)?;
        if !settle.is_zero() {
            sleep(settle);
        }
        link.read_usb_frame(READ_TIMEOUT)
    }
}

impl Default for Usb15 {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Usb15 {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Usb15
    }

    fn parity(&self) -> Parity {
        Parity::None
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(ChecksumKind::Dual)
    }

    fn state(&self) -> &TargetState {
        &self.state
    }

    fn read_status(&mut self, link: &mut Link) -> Result<Vec<u8>> {
        let status = link.read_usb_frame(DETECT_TIMEOUT)?;
        if status.first() != Some(&0x50) {
            return Err(Error::Protocol("incorrect magic in status packet".into()));
        }
        Ok(status)
    }

    fn initialize(&mut self, status: &[u8]) -> Result<()> {
        identify_model(&mut self.state, status)?;
        if status.len() < 38 {
            return Err(Error::Protocol("status packet too short".into()));
        }

        let counter: u16 = status.pread_with(13, BE)?;
        self.state.clock_hz = if counter == 0 || counter == 0xffff {
            0.0
        } else {
            counter as f64 * FREQ_COUNTER_LSB_HZ
        };

        self.freq_count_24 = status[4];
        let wakeup: u16 = status.pread_with(1, BE)?;
        self.wakeup_freq = wakeup as u32;

        let (version, byte) = version3(status);
        self.state.bsl_version = version;
        self.state.bsl_version_byte = byte;

        let mut msr = Vec::with_capacity(5);
        msr.extend_from_slice(&status[5..8]);
        msr.push(status[12]);
        msr.push(status[37]);
        self.opts = Some(Stc15Options::new(msr));
        Ok(())
    }

    fn describe(&self) {
        describe_common(&self.state);
        log::info!("Target wakeup frequency: {:.3} KHz", self.wakeup_freq as f64 / 1000.0);
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
        0
    }

    fn set_transfer_baud(&mut self, _baud: u32) {}

    fn handshake(&mut self, link: &mut Link) -> Result<()> {
        log::info!("Initializing");
        let response = self.exchange(link, &[0x01, 0x03], Duration::ZERO)?;
        if response.first() != Some(&0x01) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }

        let response = self.exchange(link, &[0x05, 0xa5, 0x5a], Duration::ZERO)?;
        if response.first() == Some(&0x0f) {
            return Err(Error::DeviceNak("MCU is locked".into()));
        }
        if response.first() != Some(&0x05) {
            return Err(Error::Protocol("incorrect magic in handshake packet".into()));
        }
        Ok(())
    }

    fn erase(&mut self, link: &mut Link, _erase_size: usize, _flash_size: usize) -> Result<()> {
        log::info!("Erasing flash");
        let response = self.exchange(link, &[0x03, 0xa5, 0x5a], Duration::from_secs(2))?;
        if response.first() != Some(&0x03) {
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
        first: bool,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let block = self.block_size();
        for (i, chunk) in data.chunks(block).enumerate() {
            if crate::flashing::interrupted() {
                return Err(Error::UserAbort);
            }
            let addr = base + i * block;
            let cmd = if first && i == 0 { 0x22 } else { 0x02 };
            let mut packet = vec![cmd];
            packet.extend_from_slice(&(addr as u16).to_be_bytes());
            packet.extend_from_slice(chunk);
            let response = self.exchange(link, &packet, Duration::from_millis(100))?;
            if response.len() < 2 || response[0] != 0x02 || response[1] != 0x54 {
                return Err(Error::Protocol("incorrect magic in write packet".into()));
            }
            progress.on_bytes(i * block + chunk.len(), data.len());
        }
        Ok(())
    }

    fn write_options(&mut self, link: &mut Link) -> Result<()> {
        log::info!("Setting options");
        // no trim over USB; program the pre-tuned 24 MHz values
        let msr = self.opts.as_ref().map(|o| o.msr()).unwrap_or_default();
        let mut packet = vec![0x04, 0xa5, 0x5a];
        packet.extend_from_slice(&build_option_image(24_000_000, (self.freq_count_24, 0x40), &msr));
        let response = self.exchange(link, &packet, Duration::from_millis(500))?;
        if response.len() < 2 || response[0] != 0x04 || response[1] != 0x54 {
            return Err(Error::Protocol("incorrect magic in option packet".into()));
        }
        if let Some(uid) = &self.state.uid {
            log::info!("Target UID: {}", hex::encode_upper(uid));
        }
        Ok(())
    }

    fn terminate(&mut self, link: &mut Link) -> Result<()> {
        link.write_usb_frame(&[0xff])?;
        log::info!("Disconnected");
        Ok(())
    }

    fn block_size(&self) -> usize {
        128
    }
}
