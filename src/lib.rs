//! UWF Firmware Loader.
//!
//! Reprograms the flash banks of Laird-style Bluetooth modules by replaying
//! a UWF firmware file through the module's UART bootloader.

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod driver;
pub mod error;
pub mod link;
pub mod model;
pub mod protocol;
pub mod record;
pub mod sector;
pub mod session;
pub mod state;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

pub use driver::{Driver, Summary};
pub use error::{Error, ErrorKind, Step};
pub use link::Link;
pub use model::{BootEntry, BootMode, BootModeService, Profile};
pub use record::{Opcode, Payload, Record, RecordReader, Registration};
pub use sector::{SectorGroup, SectorMap};
pub use session::Session;
pub use state::{MemoryBank, Phase, Selection, SessionState};

/// Serial port with the line controls needed to reset a module
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
    fn set_break(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for each bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Bytes per data write, 16 to 252 and a multiple of 4
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "252"))]
    pub block_size: usize,

    /// Data writes between checksum verifications
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "8"))]
    pub verify_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3000,
            poll_delay_ms: 1,
            block_size: protocol::MAX_BLOCK_SIZE,
            verify_limit: 8,
        }
    }
}

impl Options {
    pub fn validate<E>(&self) -> Result<(), Error<E>> {
        let bs = self.block_size;
        if bs < protocol::MIN_BLOCK_SIZE || bs > protocol::MAX_BLOCK_SIZE || bs % 4 != 0 {
            return Err(Error::InvalidOption(format!(
                "block size {} must be {}..={} and a multiple of 4",
                bs,
                protocol::MIN_BLOCK_SIZE,
                protocol::MAX_BLOCK_SIZE
            )));
        }
        if self.verify_limit == 0 {
            return Err(Error::InvalidOption("verify limit must be at least 1".into()));
        }
        if self.poll_delay_ms == 0 {
            return Err(Error::InvalidOption("poll delay must be at least 1ms".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_bounds() {
        assert_eq!(Options::default().validate::<()>(), Ok(()));

        for bs in &[12, 254, 256, 130] {
            let o = Options { block_size: *bs, ..Options::default() };
            assert!(matches!(o.validate::<()>(), Err(Error::InvalidOption(_))));
        }

        let o = Options { block_size: 16, ..Options::default() };
        assert_eq!(o.validate::<()>(), Ok(()));
    }
}
