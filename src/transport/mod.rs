//! Abstraction of the transport layer: a duplex byte stream to the BSL.

use std::time::Duration;

use crate::error::Result;

pub use self::serial::{ResetLine, SerialTransport};
pub use self::usb::UsbTransport;

mod serial;
mod usb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
}

/// Duplex link to the target. The serial backend maps this onto a host serial
/// port; the USB backend maps it onto bulk endpoints and treats baud, parity
/// and reset as no-ops.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Fill `buf` completely or fail. A deadline expiry yields
    /// `Error::Timeout`; partially read bytes are discarded.
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;

    /// One link-level transfer: a single bulk transfer on USB, a single read
    /// on serial. Returns the number of bytes received.
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn set_baud(&mut self, baud: u32) -> Result<()>;

    fn set_parity(&mut self, parity: Parity) -> Result<()>;

    /// Assert the configured reset line for `duration`, then release it.
    fn assert_reset(&mut self, duration: Duration) -> Result<()>;

    /// Discard anything pending in the input buffer.
    fn drain(&mut self) -> Result<()>;

    fn bytes_waiting(&mut self) -> Result<usize>;
}
