//! Scripted transport for driving whole sessions without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stcisp::error::{Error, Result};
use stcisp::transport::{Parity, Transport};

#[derive(Default)]
pub struct MockState {
    pub reads: VecDeque<u8>,
    pub writes: Vec<u8>,
    pub bauds: Vec<u32>,
    pub parities: Vec<Parity>,
    pub resets: usize,
}

/// A transport whose "device" side is a pre-recorded byte script.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Queue bytes the device will "send".
    pub fn push_read(&self, bytes: &[u8]) {
        self.state.lock().unwrap().reads.extend(bytes.iter().copied());
    }

    pub fn writes(&self) -> Vec<u8> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().unwrap().resets
    }

    pub fn bauds(&self) -> Vec<u32> {
        self.state.lock().unwrap().bauds.clone()
    }

    pub fn parities(&self) -> Vec<Parity> {
        self.state.lock().unwrap().parities.clone()
    }

    pub fn leftover_reads(&self) -> usize {
        self.state.lock().unwrap().reads.len()
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.state.lock().unwrap().writes.extend_from_slice(data);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.reads.len() < buf.len() {
            return Err(Error::Timeout);
        }
        for slot in buf.iter_mut() {
            *slot = state.reads.pop_front().unwrap();
        }
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        // serial-style: hand over whatever is queued
        let available = self.state.lock().unwrap().reads.len().min(buf.len());
        if available == 0 {
            return Err(Error::Timeout);
        }
        self.read_exact(&mut buf[..available], timeout)?;
        Ok(available)
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        self.state.lock().unwrap().bauds.push(baud);
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        self.state.lock().unwrap().parities.push(parity);
        Ok(())
    }

    fn assert_reset(&mut self, _duration: Duration) -> Result<()> {
        self.state.lock().unwrap().resets += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        // keep the script; a real port would discard stale bytes here
        Ok(())
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        Ok(self.state.lock().unwrap().reads.len())
    }
}

/// Assert that `frames` appear in `stream` in order, as contiguous runs.
pub fn assert_frames_in_order(stream: &[u8], frames: &[Vec<u8>]) {
    let mut from = 0;
    for (i, frame) in frames.iter().enumerate() {
        let found = stream[from..]
            .windows(frame.len())
            .position(|window| window == frame.as_slice());
        match found {
            Some(pos) => from += pos + frame.len(),
            None => panic!(
                "frame #{} ({}) not found in host output after offset {}",
                i,
                hex::encode(frame),
                from
            ),
        }
    }
}
