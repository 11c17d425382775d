//! USB transportation for parts with a USB bootloader.

use std::thread::sleep;
use std::time::{Duration, Instant};

use rusb::{Context, DeviceHandle, UsbContext};

use super::{Parity, Transport};
use crate::error::{Error, Result};

/// VID/PID of the STC USB bootloader.
const USB_VID: u16 = 0x5354;
const USB_PID: u16 = 0x4312;

const ENDPOINT_OUT: u8 = 0x02;
const ENDPOINT_IN: u8 = 0x82;

const MAX_TRANSFER: usize = 512;

pub struct UsbTransport {
    handle: DeviceHandle<Context>,
}

impl UsbTransport {
    /// Wait for the bootloader to enumerate and claim it. The part only
    /// shows up on the bus for a short while after power-on.
    pub fn wait_and_open(deadline: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            match Self::open_once() {
                Ok(t) => return Ok(t),
                Err(_) if start.elapsed() < deadline => sleep(Duration::from_millis(500)),
                Err(e) => return Err(e),
            }
        }
    }

    fn open_once() -> Result<Self> {
        let context = Context::new()?;
        let device = context
            .devices()?
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|desc| desc.vendor_id() == USB_VID && desc.product_id() == USB_PID)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                Error::LinkLost(format!(
                    "no STC USB bootloader found ({:04x}:{:04x})",
                    USB_VID, USB_PID
                ))
            })?;
        log::debug!("found USB device {:?}", device);

        let handle = device.open()?;
        handle.set_active_configuration(1)?;
        handle.claim_interface(0)?;
        Ok(UsbTransport { handle })
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        // ignore any communication error
        let _ = self.handle.release_interface(0);
    }
}

impl Transport for UsbTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.handle
            .write_bulk(ENDPOINT_OUT, data, Duration::from_millis(5000))?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let n = self.read_chunk(&mut buf[..], timeout)?;
        if n != buf.len() {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut chunk = [0u8; MAX_TRANSFER];
        match self.handle.read_bulk(ENDPOINT_IN, &mut chunk, timeout) {
            Ok(n) => {
                let n = n.min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(rusb::Error::Timeout) => Err(Error::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn set_baud(&mut self, _baud: u32) -> Result<()> {
        Ok(())
    }

    fn set_parity(&mut self, _parity: Parity) -> Result<()> {
        Ok(())
    }

    fn assert_reset(&mut self, _duration: Duration) -> Result<()> {
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        Ok(())
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        Ok(0)
    }
}
