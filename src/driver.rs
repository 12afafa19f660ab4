//! Runs a UWF file against a module
//!
//! Enters the bootloader, feeds every record to the session until the file
//! ends or a record fails, then returns the module to normal operation
//! exactly once.

use std::io::Read;

use embedded_hal::blocking::delay::DelayMs;

use crate::model::BootEntry;
use crate::record::{Record, RecordReader};
use crate::session::Session;
use crate::state::{Phase, SessionState};
use crate::{Error, Link, SerialPort};

#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct Summary {
    pub records: usize,
    pub sectors_erased: usize,
    pub bytes_written: usize,
}

pub struct Driver<P, D, E> {
    session: Session<P, D, E>,
    entry: BootEntry,
    state: SessionState,
}

impl<P, D, E> Driver<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(link: Link<P, D, E>, entry: BootEntry) -> Self {
        let session = Session::new(link, entry.profile());
        Self { session, entry, state: SessionState::default() }
    }

    /// State reached by the last run
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current phase, including any exchange still in flight
    pub fn phase(&self) -> Phase {
        self.session.phase(&self.state)
    }

    pub fn into_inner(self) -> Link<P, D, E> {
        self.session.into_inner()
    }

    /// Load a UWF stream, calling `progress` with each record before it is applied
    pub fn run<R, F>(&mut self, reader: &mut RecordReader<R>, mut progress: F) -> Result<Summary, Error<E>>
    where
        R: Read,
        F: FnMut(&Record),
    {
        self.session.link().options().validate::<E>()?;
        self.state = SessionState::default();

        let result = match self.entry.enter(self.session.link()) {
            Ok(()) => self.process(reader, &mut progress),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!("Update failed: {}", e);
            self.state.failed = true;
        }

        let exit = self.entry.exit(self.session.link());
        self.state.closed = true;

        match (result, exit) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(exit)) => {
                warn!("Failed to return module to normal operation: {}", exit);
                Err(e)
            }
        }
    }

    fn process<R, F>(&mut self, reader: &mut RecordReader<R>, progress: &mut F) -> Result<Summary, Error<E>>
    where
        R: Read,
        F: FnMut(&Record),
    {
        let mut records = 0;

        while let Some(record) = reader.next_record::<E>()? {
            progress(&record);
            let payload = record.decode::<E>()?;
            self.state = self.session.handle(&self.state, payload)?;
            records += 1;
        }

        info!("Reached end of firmware file after {} records", records);

        Ok(Summary {
            records,
            sectors_erased: self.state.sectors_erased,
            bytes_written: self.state.bytes_written,
        })
    }
}
