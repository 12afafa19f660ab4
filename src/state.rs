//! Bootloader session state
//!
//! The state is a plain value: each record handler takes the current state
//! and produces the next one, so the ordering rules between records can be
//! checked without a device attached. A failed step leaves the previous
//! state untouched.

use std::collections::BTreeMap;

use crate::record::Registration;
use crate::sector::SectorMap;
use crate::Error;

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct MemoryBank {
    pub base_address: u32,
    pub num_banks: u8,
    pub bank_size: u32,
    pub bank_algorithm: u8,
}

impl From<&Registration> for MemoryBank {
    fn from(r: &Registration) -> Self {
        Self {
            base_address: r.base_address,
            num_banks: r.num_banks,
            bank_size: r.bank_size,
            bank_algorithm: r.bank_algorithm,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Selection {
    pub handle: u8,
    pub bank: u8,
}

/// Coarse position in the update sequence
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Phase {
    Idle,
    /// Sync and platform check in progress
    Synchronizing,
    Synchronized,
    Registered,
    SectorMapped,
    Erased,
    /// Write and verify exchanges in progress
    Writing,
    WriteComplete,
    Failed,
    Closed,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct SessionState {
    pub synchronized: bool,
    pub registered: bool,
    pub erased: bool,
    pub write_complete: bool,
    pub failed: bool,
    pub closed: bool,

    pub sectors_erased: usize,
    pub bytes_written: usize,

    banks: BTreeMap<u8, MemoryBank>,
    selection: Option<Selection>,
    sector_map: Option<SectorMap>,
}

/// Everything an erase needs once its preconditions hold
pub struct EraseTarget<'a> {
    pub base_address: u32,
    pub map: &'a SectorMap,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        if self.closed {
            Phase::Closed
        } else if self.failed {
            Phase::Failed
        } else if self.write_complete {
            Phase::WriteComplete
        } else if self.erased {
            Phase::Erased
        } else if self.synchronized && self.registered && self.has_sector_map() {
            Phase::SectorMapped
        } else if self.synchronized && self.registered {
            Phase::Registered
        } else if self.synchronized {
            Phase::Synchronized
        } else {
            Phase::Idle
        }
    }

    pub fn bank(&self, handle: u8) -> Option<&MemoryBank> {
        self.banks.get(&handle)
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn sector_map(&self) -> Option<&SectorMap> {
        self.sector_map.as_ref()
    }

    fn has_sector_map(&self) -> bool {
        self.sector_map.as_ref().map(|m| !m.is_empty()).unwrap_or(false)
    }

    fn selected_bank(&self) -> Option<&MemoryBank> {
        self.selection.and_then(|s| self.banks.get(&s.handle))
    }

    pub fn synchronize(&self) -> Self {
        Self { synchronized: true, ..self.clone() }
    }

    pub fn register<E>(&self, reg: &Registration) -> Result<Self, Error<E>> {
        let mut next = self.clone();
        next.banks.insert(reg.handle, MemoryBank::from(reg));
        next.registered = true;
        next.check_sector_map::<E>()?;
        Ok(next)
    }

    pub fn select<E>(&self, handle: u8, bank: u8) -> Result<Self, Error<E>> {
        let mut next = self.clone();
        next.selection = Some(Selection { handle, bank });
        next.check_sector_map::<E>()?;
        Ok(next)
    }

    pub fn with_sector_map<E>(&self, map: SectorMap) -> Result<Self, Error<E>> {
        let mut next = self.clone();
        next.sector_map = Some(map);
        next.check_sector_map::<E>()?;
        Ok(next)
    }

    pub fn unregister(&self, handle: u8) -> Self {
        let mut next = self.clone();
        next.banks.remove(&handle);
        next
    }

    /// Validate an erase of `[offset, offset + size)` in the selected bank
    pub fn erase_target<E>(&self, offset: u32, size: u32) -> Result<EraseTarget<'_>, Error<E>> {
        let map = match &self.sector_map {
            Some(m) if self.synchronized && self.registered && !m.is_empty() => m,
            _ => {
                return Err(Error::Precondition(
                    "target platform, register device, or sector map not yet processed",
                ))
            }
        };
        let bank = self
            .selected_bank()
            .ok_or(Error::Precondition("no registered device selected for erase"))?;

        if offset as u64 + size as u64 > bank.bank_size as u64 {
            return Err(Error::OutOfBank {
                what: "erase",
                offset,
                size,
                bank_size: bank.bank_size,
            });
        }
        if !map.is_boundary(offset) || !map.is_boundary(offset + size) {
            return Err(Error::MisalignedErase { offset, size });
        }

        Ok(EraseTarget { base_address: bank.base_address, map })
    }

    pub fn erased(&self, sectors: usize) -> Self {
        Self {
            erased: true,
            sectors_erased: self.sectors_erased + sectors,
            ..self.clone()
        }
    }

    /// Validate a write of `len` bytes, returning the bank's base address
    pub fn write_target<E>(&self, offset: u32, len: usize) -> Result<u32, Error<E>> {
        if !self.erased {
            return Err(Error::Precondition("erase not yet processed"));
        }
        let bank = self
            .selected_bank()
            .ok_or(Error::Precondition("no registered device selected for write"))?;
        if len as u64 > bank.bank_size as u64 {
            return Err(Error::OutOfBank {
                what: "write",
                offset,
                size: len as u32,
                bank_size: bank.bank_size,
            });
        }
        Ok(bank.base_address)
    }

    pub fn written(&self, bytes: usize) -> Self {
        Self {
            write_complete: true,
            bytes_written: self.bytes_written + bytes,
            ..self.clone()
        }
    }

    /// The sector map must describe exactly the selected bank, once both are known
    fn check_sector_map<E>(&self) -> Result<(), Error<E>> {
        let (map, selection) = match (&self.sector_map, self.selection) {
            (Some(m), Some(s)) => (m, s),
            _ => return Ok(()),
        };
        let bank = match self.banks.get(&selection.handle) {
            Some(b) => b,
            None => return Ok(()),
        };
        let mapped = map.total_size();
        if mapped != bank.bank_size as u64 {
            return Err(Error::SectorMapMismatch {
                handle: selection.handle,
                mapped,
                bank_size: bank.bank_size,
            });
        }
        Ok(())
    }
}
