//! UWF firmware container
//!
//! A UWF file is a flat sequence of records, each a 6 byte header
//! `[opcode][reserved][length: u32 LE]` followed by `length` payload bytes.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};

use crate::sector::SectorMap;
use crate::Error;

pub const HEADER_LEN: usize = 6;

/// Record opcodes understood by the loader
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Opcode {
    TargetPlatform,
    RegisterDevice,
    SelectDevice,
    SectorMap,
    EraseBlocks,
    WriteBlocks,
    UnregisterDevice,
    Unknown(u8),
}

impl From<u8> for Opcode {
    fn from(tag: u8) -> Self {
        match tag {
            b'T' => Opcode::TargetPlatform,
            b'G' => Opcode::RegisterDevice,
            b'S' => Opcode::SelectDevice,
            b'M' => Opcode::SectorMap,
            b'E' => Opcode::EraseBlocks,
            b'W' => Opcode::WriteBlocks,
            b'U' => Opcode::UnregisterDevice,
            other => Opcode::Unknown(other),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Record {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn opcode(&self) -> Opcode {
        Opcode::from(self.tag)
    }

    /// Size of the record as stored in the file
    pub fn stored_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Decode the payload according to the opcode's layout
    pub fn decode<E>(&self) -> Result<Payload, Error<E>> {
        let p = &self.payload;
        let bad_len = |what: &str| {
            Error::Format(format!("{} record has length {}", what, p.len()))
        };

        let payload = match self.opcode() {
            Opcode::TargetPlatform => {
                if p.len() != 4 {
                    return Err(bad_len("target platform"));
                }
                let mut platform_id = [0u8; 4];
                platform_id.copy_from_slice(p);
                Payload::TargetPlatform { platform_id }
            }
            Opcode::RegisterDevice => {
                if p.len() != Registration::LEN {
                    return Err(bad_len("register device"));
                }
                Payload::RegisterDevice(Registration::decode(p))
            }
            Opcode::SelectDevice => {
                if p.len() != 2 {
                    return Err(bad_len("select device"));
                }
                Payload::SelectDevice { handle: p[0], bank: p[1] }
            }
            Opcode::SectorMap => match SectorMap::decode(p) {
                Some(map) => Payload::SectorMap(map),
                None => return Err(bad_len("sector map")),
            },
            Opcode::EraseBlocks => {
                if p.len() != 8 {
                    return Err(bad_len("erase blocks"));
                }
                Payload::EraseBlocks {
                    offset: LittleEndian::read_u32(&p[0..4]),
                    size: LittleEndian::read_u32(&p[4..8]),
                }
            }
            Opcode::WriteBlocks => {
                if p.len() < 8 {
                    return Err(bad_len("write blocks"));
                }
                Payload::WriteBlocks {
                    offset: LittleEndian::read_u32(&p[0..4]),
                    flags: LittleEndian::read_u32(&p[4..8]),
                    data: p[8..].to_vec(),
                }
            }
            Opcode::UnregisterDevice => {
                if p.len() != 1 {
                    return Err(bad_len("unregister device"));
                }
                Payload::UnregisterDevice { handle: p[0] }
            }
            Opcode::Unknown(tag) => Payload::Unknown { tag, len: p.len() },
        };

        Ok(payload)
    }
}

/// Memory bank registration as carried in a register device record
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Registration {
    pub handle: u8,
    pub base_address: u32,
    pub num_banks: u8,
    pub bank_size: u32,
    pub bank_algorithm: u8,
}

impl Registration {
    pub const LEN: usize = 11;

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            handle: buf[0],
            base_address: LittleEndian::read_u32(&buf[1..5]),
            num_banks: buf[5],
            bank_size: LittleEndian::read_u32(&buf[6..10]),
            bank_algorithm: buf[10],
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.handle;
        LittleEndian::write_u32(&mut buf[1..5], self.base_address);
        buf[5] = self.num_banks;
        LittleEndian::write_u32(&mut buf[6..10], self.bank_size);
        buf[10] = self.bank_algorithm;
        buf
    }
}

/// Typed record payloads
#[derive(Clone, PartialEq, Debug)]
pub enum Payload {
    TargetPlatform { platform_id: [u8; 4] },
    RegisterDevice(Registration),
    SelectDevice { handle: u8, bank: u8 },
    SectorMap(SectorMap),
    EraseBlocks { offset: u32, size: u32 },
    WriteBlocks { offset: u32, flags: u32, data: Vec<u8> },
    UnregisterDevice { handle: u8 },
    Unknown { tag: u8, len: usize },
}

/// Pulls records one at a time from a UWF byte stream
pub struct RecordReader<R> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next record, `None` at a clean end of stream
    pub fn next_record<E>(&mut self) -> Result<Option<Record>, Error<E>> {
        let mut header = [0u8; HEADER_LEN];
        let n = self.fill::<E>(&mut header)?;
        if n == 0 {
            return Ok(None);
        }
        if n < HEADER_LEN {
            return Err(Error::Truncated { expected: HEADER_LEN, got: n });
        }

        let tag = header[0];
        let len = LittleEndian::read_u32(&header[2..6]) as usize;

        let mut payload = Vec::new();
        (&mut self.inner)
            .take(len as u64)
            .read_to_end(&mut payload)
            .map_err(|e| Error::Io(e.kind()))?;
        if payload.len() < len {
            return Err(Error::Truncated { expected: len, got: payload.len() });
        }

        Ok(Some(Record { tag, payload }))
    }

    /// Read until `buf` is full or the stream ends
    fn fill<E>(&mut self, buf: &mut [u8]) -> Result<usize, Error<E>> {
        let mut n = 0;
        while n < buf.len() {
            match self.inner.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(c) => n += c,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e.kind())),
            }
        }
        Ok(n)
    }
}
