use std::fmt;

use thiserror::Error;

/// Individual request/acknowledge exchange within a bootloader command
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Step {
    Sync,
    SyncAck,
    PlatformCheck,
    Erase,
    WriteCommand,
    WriteData,
    Verify,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Sync => "bootloader sync",
            Step::SyncAck => "sync acknowledge",
            Step::PlatformCheck => "platform check",
            Step::Erase => "erase command",
            Step::WriteCommand => "write command",
            Step::WriteData => "data write",
            Step::Verify => "verify command",
        };
        f.write_str(s)
    }
}

/// Coarse classification used to pick a process exit status
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ErrorKind {
    /// Local file could not be opened or read
    File,
    /// The serial port itself failed
    Transport,
    /// The device or the firmware file misbehaved
    Protocol,
    /// Bad arguments
    Usage,
}

impl ErrorKind {
    /// Process exit status for this class of failure
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::File => 2,
            ErrorKind::Transport => 101,
            ErrorKind::Protocol => 1,
            ErrorKind::Usage => 22,
        }
    }
}

#[derive(Error, Clone, PartialEq, Debug)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("IO error reading firmware file: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("truncated record: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("no response to {0}")]
    Timeout(Step),

    #[error("{0} rejected by bootloader")]
    Rejected(Step),

    #[error("unexpected response 0x{value:02x} to {step}")]
    UnexpectedResponse { step: Step, value: u8 },

    #[error("{0}")]
    Precondition(&'static str),

    #[error("malformed record: {0}")]
    Format(String),

    #[error("sector map covers {mapped} bytes but bank {handle} is {bank_size} bytes")]
    SectorMapMismatch {
        handle: u8,
        mapped: u64,
        bank_size: u32,
    },

    #[error("erase range 0x{offset:x}+0x{size:x} is not sector aligned")]
    MisalignedErase { offset: u32, size: u32 },

    #[error("{what} 0x{offset:x}+0x{size:x} exceeds bank size 0x{bank_size:x}")]
    OutOfBank {
        what: &'static str,
        offset: u32,
        size: u32,
        bank_size: u32,
    },

    #[error("unexpected registration data for {model}: {field} is {got}, expected {expected}")]
    RegistrationMismatch {
        model: &'static str,
        field: &'static str,
        got: u32,
        expected: u32,
    },

    #[error("failed to enter bootloader: {0}")]
    EnterBootloader(String),

    #[error("boot mode service failed: {0}")]
    BootService(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError> Error<SerialError> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Serial(_) => ErrorKind::Transport,
            Error::Io(_) => ErrorKind::File,
            Error::InvalidOption(_) => ErrorKind::Usage,
            _ => ErrorKind::Protocol,
        }
    }
}
