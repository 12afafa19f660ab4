//! Scripted serial port for exercising the protocol without hardware

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::record::HEADER_LEN;
use crate::SerialPort;

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Line {
    Dtr(bool),
    Break(bool),
}

/// Answers each request frame (all bytes written since the last read)
/// through a responder, recording everything sent
pub struct MockPort {
    pub tx: Vec<u8>,
    pub lines: Vec<Line>,
    frames: Vec<Vec<u8>>,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
    responder: Box<dyn FnMut(&[u8]) -> Vec<u8>>,
}

impl MockPort {
    pub fn new(responder: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> Self {
        Self {
            tx: vec![],
            lines: vec![],
            frames: vec![],
            pending: vec![],
            rx: VecDeque::new(),
            responder: Box::new(responder),
        }
    }

    /// Request frames in the order they were sent, including any unanswered one
    pub fn requests(&self) -> Vec<Vec<u8>> {
        let mut frames = self.frames.clone();
        if !self.pending.is_empty() {
            frames.push(self.pending.clone());
        }
        frames
    }
}

impl Write<u8> for MockPort {
    type Error = ();

    fn write(&mut self, word: u8) -> nb::Result<(), ()> {
        self.tx.push(word);
        self.pending.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ()> {
        Ok(())
    }
}

impl Read<u8> for MockPort {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, ()> {
        if self.rx.is_empty() && !self.pending.is_empty() {
            let frame = std::mem::take(&mut self.pending);
            self.rx.extend((self.responder)(&frame));
            self.frames.push(frame);
        }
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<()> for MockPort {
    fn set_dtr(&mut self, level: bool) -> Result<(), ()> {
        self.lines.push(Line::Dtr(level));
        Ok(())
    }

    fn set_break(&mut self, level: bool) -> Result<(), ()> {
        self.lines.push(Line::Break(level));
        Ok(())
    }
}

/// Delay that returns immediately, keeping count of the time requested
#[derive(Default)]
pub struct NoDelay {
    pub total_ms: u64,
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += ms as u64;
    }
}

/// Encode one UWF record
pub fn record(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut r = Vec::with_capacity(HEADER_LEN + payload.len());
    r.push(tag);
    r.push(0);
    r.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    r.extend_from_slice(payload);
    r
}
