//! Sector layout of a memory bank
//!
//! A bank is described as a list of groups, each a run of equally sized
//! sectors. Erases are issued one sector at a time, so a byte range has to
//! be mapped onto the start addresses of the sectors it covers.

use byteorder::{ByteOrder, LittleEndian};

/// `count` consecutive sectors of `size` bytes each
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SectorGroup {
    pub count: u32,
    pub size: u32,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct SectorMap {
    groups: Vec<SectorGroup>,
}

impl SectorMap {
    pub fn new(groups: Vec<SectorGroup>) -> Self {
        Self { groups }
    }

    /// Decode repeated `(count: u32, size: u32)` little-endian pairs.
    /// Returns `None` if the payload is not a whole number of pairs.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() % 8 != 0 {
            return None;
        }
        let groups = payload
            .chunks_exact(8)
            .map(|c| SectorGroup {
                count: LittleEndian::read_u32(&c[0..4]),
                size: LittleEndian::read_u32(&c[4..8]),
            })
            .collect();
        Some(Self { groups })
    }

    pub fn groups(&self) -> &[SectorGroup] {
        &self.groups
    }

    /// A map is usable for erasing once its first group describes real sectors
    pub fn is_empty(&self) -> bool {
        match self.groups.first() {
            Some(g) => g.count == 0 || g.size == 0,
            None => true,
        }
    }

    /// Total number of bytes described by the map
    pub fn total_size(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| g.count as u64 * g.size as u64)
            .sum()
    }

    /// Whether `offset` falls exactly on a sector start (or the end of the map)
    pub fn is_boundary(&self, offset: u32) -> bool {
        let offset = offset as u64;
        let mut base = 0u64;
        for g in &self.groups {
            if g.size == 0 {
                continue;
            }
            let end = base + g.count as u64 * g.size as u64;
            if offset < end {
                return (offset - base) % g.size as u64 == 0;
            }
            base = end;
        }
        offset == base
    }

    /// Sector start addresses, relative to the bank, covering
    /// `[offset, offset + size)`.
    ///
    /// Both ends of the range are expected to sit on sector boundaries;
    /// an unaligned range yields every sector it touches.
    pub fn erase_addresses(&self, offset: u32, size: u32) -> EraseAddresses<'_> {
        EraseAddresses {
            groups: &self.groups,
            start: offset as u64,
            end: offset as u64 + size as u64,
            sector_base: 0,
            group: 0,
            index: 0,
        }
    }
}

/// Iterator returned by [`SectorMap::erase_addresses`]
pub struct EraseAddresses<'a> {
    groups: &'a [SectorGroup],
    start: u64,
    end: u64,
    sector_base: u64,
    group: usize,
    index: u32,
}

impl<'a> Iterator for EraseAddresses<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while self.sector_base < self.end {
            let g = self.groups.get(self.group)?;
            // zero sized groups cover nothing
            if self.index >= g.count || g.size == 0 {
                self.group += 1;
                self.index = 0;
                continue;
            }

            let base = self.sector_base;
            self.sector_base += g.size as u64;
            self.index += 1;

            if base + g.size as u64 > self.start {
                return Some(base as u32);
            }
        }
        None
    }
}
