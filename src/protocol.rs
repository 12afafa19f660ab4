//! Bootloader wire protocol
//!
//! Every request is a single ASCII opcode followed by a fixed little-endian
//! argument layout, answered by a single acknowledge byte.

use byteorder::{ByteOrder, LittleEndian};

/// Application command that drops a running module into its bootloader
pub const ENTER_BOOTLOADER: &[u8] = b"AT+FUP\r";

/// Synchronisation byte, answered with a fixed length banner
pub const SYNC: u8 = 0x80;
pub const SYNC_RESPONSE_LEN: usize = 14;

pub const ACK: u8 = b'a';
pub const NACK: u8 = b'f';

/// Largest data block the bootloader accepts in one data command
pub const MAX_BLOCK_SIZE: usize = 252;
pub const MIN_BLOCK_SIZE: usize = 16;

#[derive(Debug, PartialEq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Checks the 4 byte platform id against the bootloader's own
    PlatformCheck = b'p',

    /// Erases the sector starting at the given absolute address
    Erase = b'e',

    /// Opens a write of up to 252 bytes at an absolute address
    Write = b'w',

    /// Carries the data for the preceding write, with an 8 bit checksum
    Data = b'd',

    /// Verifies a range of written data against a 32 bit checksum
    Verify = b'v',

    /// Leaves the bootloader and restarts the module
    Reboot = b'z',
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

/// Arithmetic sum of all bytes, wrapping at 32 bits
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, b| sum.wrapping_add(*b as u32))
}

pub fn platform_check(platform_id: &[u8; 4]) -> [u8; 5] {
    let mut buf = [Command::PlatformCheck.opcode(), 0, 0, 0, 0];
    buf[1..].copy_from_slice(platform_id);
    buf
}

pub fn erase(address: u32) -> [u8; 5] {
    let mut buf = [Command::Erase.opcode(), 0, 0, 0, 0];
    LittleEndian::write_u32(&mut buf[1..5], address);
    buf
}

pub fn write(address: u32, len: u8) -> [u8; 6] {
    let mut buf = [Command::Write.opcode(), 0, 0, 0, 0, len];
    LittleEndian::write_u32(&mut buf[1..5], address);
    buf
}

/// Data frame: opcode, the block, then the low byte of its checksum
pub fn data(block: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(block.len() + 2);
    buf.push(Command::Data.opcode());
    buf.extend_from_slice(block);
    buf.push(checksum(block) as u8);
    buf
}

pub fn verify(address: u32, len: u32, checksum: u32) -> [u8; 13] {
    let mut buf = [0u8; 13];
    buf[0] = Command::Verify.opcode();
    LittleEndian::write_u32(&mut buf[1..5], address);
    LittleEndian::write_u32(&mut buf[5..9], len);
    LittleEndian::write_u32(&mut buf[9..13], checksum);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_wraps_and_data_carries_lsb() {
        let block = [0xffu8; 3];
        assert_eq!(checksum(&block), 0x2fd);

        let frame = data(&block);
        assert_eq!(frame, vec![b'd', 0xff, 0xff, 0xff, 0xfd]);
    }

    #[test]
    fn address_layout_is_little_endian() {
        assert_eq!(erase(0x0001_2000), [b'e', 0x00, 0x20, 0x01, 0x00]);
        assert_eq!(write(0x1000, 252), [b'w', 0x00, 0x10, 0x00, 0x00, 252]);

        let v = verify(0x10, 600, 0x0102_0304);
        assert_eq!(v[0], b'v');
        assert_eq!(&v[1..5], &[0x10, 0, 0, 0]);
        assert_eq!(&v[5..9], &[0x58, 0x02, 0, 0]);
        assert_eq!(&v[9..13], &[0x04, 0x03, 0x02, 0x01]);
    }
}
