//! Timeout-bounded byte channel to the module
//!
//! Wraps a non-blocking serial port, polling it with a delay between
//! attempts until a response arrives or the response timeout expires.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::{Error, Options, SerialPort};

pub struct Link<P, D, E> {
    port: P,
    delay: D,
    options: Options,
    _err: PhantomData<E>,
}

impl<P, D, E> Link<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new link over an opened port
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self { port, delay, options, _err: PhantomData }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the underlying port and delay
    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;
        Ok(())
    }

    /// Read up to `n` bytes, returning short if the response times out.
    /// The timeout bounds the whole call, not each byte.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, Error<E>> {
        let mut buf = Vec::with_capacity(n);
        let mut elapsed = 0;
        while buf.len() < n {
            match self.read_byte(&mut elapsed)? {
                Some(b) => buf.push(b),
                None => {
                    trace!("Response timeout after {} of {} bytes", buf.len(), n);
                    break;
                }
            }
        }
        Ok(buf)
    }

    /// Read up to and including a newline, or whatever arrived before the timeout
    pub fn read_line(&mut self) -> Result<Vec<u8>, Error<E>> {
        let mut line = vec![];
        let mut elapsed = 0;
        while let Some(b) = self.read_byte(&mut elapsed)? {
            line.push(b);
            if b == b'\n' {
                break;
            }
        }
        Ok(line)
    }

    /// Write a request and read back a response of `n` bytes
    pub fn transact(&mut self, request: &[u8], n: usize) -> Result<Vec<u8>, Error<E>> {
        self.write(request)?;
        self.read(n)
    }

    /// Discard anything already buffered by the port
    pub fn drain(&mut self) -> Result<usize, Error<E>> {
        let mut n = 0;
        loop {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }
        if n > 0 {
            debug!("Discarded {} buffered bytes", n);
        }
        Ok(n)
    }

    pub fn set_dtr(&mut self, level: bool) -> Result<(), Error<E>> {
        self.port.set_dtr(level)?;
        Ok(())
    }

    pub fn set_break(&mut self, level: bool) -> Result<(), Error<E>> {
        self.port.set_break(level)?;
        Ok(())
    }

    pub fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    /// Poll for one byte, charging time spent waiting to `elapsed`
    fn read_byte(&mut self, elapsed: &mut u32) -> Result<Option<u8>, Error<E>> {
        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(Some(v)),
            };

            if *elapsed >= self.options.response_timeout_ms {
                return Ok(None);
            }

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            *elapsed = elapsed.saturating_add(self.options.poll_delay_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPort, NoDelay};

    fn link(port: MockPort) -> Link<MockPort, NoDelay, ()> {
        Link::new(port, NoDelay::default(), Options::default())
    }

    #[test]
    fn short_read_waits_out_the_timeout() {
        let mut l = link(MockPort::new(|_| vec![1, 2, 3]));
        assert_eq!(l.transact(&[0x80], 14), Ok(vec![1, 2, 3]));

        let (port, delay) = l.into_inner();
        assert_eq!(port.requests(), vec![vec![0x80]]);
        assert_eq!(delay.total_ms, 3000);
    }

    /// Port that produces a byte on every `gap`th poll
    struct Trickle {
        gap: u32,
        polls: u32,
    }

    impl embedded_hal::serial::Read<u8> for Trickle {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.polls += 1;
            if self.polls % self.gap == 0 {
                Ok(0x55)
            } else {
                Err(nb::Error::WouldBlock)
            }
        }
    }

    impl embedded_hal::serial::Write<u8> for Trickle {
        type Error = ();

        fn write(&mut self, _: u8) -> nb::Result<(), ()> {
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    impl SerialPort<()> for Trickle {
        fn set_dtr(&mut self, _: bool) -> Result<(), ()> {
            Ok(())
        }

        fn set_break(&mut self, _: bool) -> Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn slow_bytes_share_one_timeout() {
        let port = Trickle { gap: 1000, polls: 0 };
        let mut l = Link::new(port, NoDelay::default(), Options::default());

        assert_eq!(l.read(14), Ok(vec![0x55; 3]));
        assert_eq!(l.into_inner().1.total_ms, 3000);
    }

    #[test]
    fn read_line_stops_at_newline() {
        let mut l = link(MockPort::new(|_| b"\n01\tE00A\r\nrest".to_vec()));
        l.write(b"AT+FUP\r").unwrap();
        assert_eq!(l.read_line(), Ok(b"\n".to_vec()));
        assert_eq!(l.read_line(), Ok(b"01\tE00A\r\n".to_vec()));
        assert_eq!(l.drain(), Ok(4));
    }
}
