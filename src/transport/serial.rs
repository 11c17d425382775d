//! Serial transportation.

use std::io::{ErrorKind, Read, Write};
use std::thread::sleep;
use std::time::Duration;

use serialport::SerialPort;

use super::{Parity, Transport};
use crate::error::{Error, Result};

/// Modem control line used for power-cycling the target board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetLine {
    #[default]
    Dtr,
    Rts,
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    reset_line: ResetLine,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32, reset_line: ResetLine) -> Result<Self> {
        log::debug!("opening {} at {} baud", path, baud);
        let builder = serialport::new(path, baud).timeout(Duration::from_millis(500));
        #[cfg(unix)]
        let port: Box<dyn SerialPort> = {
            let mut native = builder.open_native()?;
            // advisory TIOCEXCL lock for the lifetime of the session
            let _ = native.set_exclusive(true);
            Box::new(native)
        };
        #[cfg(not(unix))]
        let port = builder.open()?;
        Ok(SerialTransport { port, reset_line })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        match self.port.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::UnexpectedEof => {
                Err(Error::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.port.set_timeout(timeout)?;
        match self.port.read(buf) {
            Ok(0) => Err(Error::Timeout),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(Error::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        log::debug!("setting baud rate {}", baud);
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        let p = match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
        };
        self.port.set_parity(p)?;
        Ok(())
    }

    fn assert_reset(&mut self, duration: Duration) -> Result<()> {
        match self.reset_line {
            ResetLine::Dtr => {
                self.port.write_data_terminal_ready(true)?;
                sleep(duration);
                self.port.write_data_terminal_ready(false)?;
            }
            ResetLine::Rts => {
                self.port.write_request_to_send(true)?;
                sleep(duration);
                self.port.write_request_to_send(false)?;
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }
}
