//! Module models and how each one enters and leaves its bootloader
//!
//! The models differ only in timing, in whether a hardware reset is used,
//! and in whether boot mode is switched by a host service instead of the
//! serial line. Each is described by a [`Profile`] in a lookup table.

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{self, Command};
use crate::record::Registration;
use crate::{Error, Link, SerialPort};

/// Time to wait after the enter command before checking for a reply
const ENTER_SETTLE_MS: u32 = 500;

/// DTR/break reset timing
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Reset {
    pub break_ms: u32,
    pub settle_ms: u32,
}

/// How the module is switched between application and bootloader
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Entry {
    /// `AT+FUP` over the serial port, optionally after a hardware reset
    Serial { reset: Option<Reset> },
    /// A privileged host service toggles the module's boot mode
    HostService,
}

/// How the module is returned to normal operation
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Exit {
    /// Ask the bootloader to reboot
    Reboot,
    /// Reset the module over DTR/break
    Reset(Reset),
    /// Restore application mode via the host service
    HostService,
}

/// Registration values a model's firmware file must declare
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct ExpectedRegistration {
    pub handle: u8,
    pub num_banks: u8,
    pub bank_algorithm: u8,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Profile {
    pub name: &'static str,
    pub entry: Entry,
    pub exit: Exit,
    pub expected: Option<ExpectedRegistration>,
}

const fn reset(settle_ms: u32) -> Reset {
    Reset { break_ms: 100, settle_ms }
}

pub const GENERIC: Profile = Profile {
    name: "GENERIC",
    entry: Entry::Serial { reset: None },
    exit: Exit::Reboot,
    expected: None,
};

pub const PROFILES: &[Profile] = &[
    GENERIC,
    Profile {
        name: "BL652",
        entry: Entry::Serial { reset: Some(reset(500)) },
        exit: Exit::Reset(reset(500)),
        expected: None,
    },
    Profile {
        name: "BL653",
        entry: Entry::Serial { reset: Some(reset(500)) },
        exit: Exit::Reset(reset(500)),
        expected: None,
    },
    Profile {
        name: "BL654",
        entry: Entry::Serial { reset: None },
        exit: Exit::Reset(reset(500)),
        expected: None,
    },
    Profile {
        name: "BL654IG",
        entry: Entry::HostService,
        exit: Exit::HostService,
        expected: Some(ExpectedRegistration {
            handle: 0,
            num_banks: 1,
            bank_algorithm: 1,
        }),
    },
    Profile {
        name: "RM1XX",
        entry: Entry::Serial { reset: Some(reset(2000)) },
        exit: Exit::Reset(reset(2000)),
        expected: None,
    },
    Profile {
        name: "BT900",
        entry: Entry::Serial { reset: Some(reset(2500)) },
        exit: Exit::Reset(reset(500)),
        expected: None,
    },
];

/// Find a model by name, ignoring case
pub fn lookup(name: &str) -> Option<&'static Profile> {
    PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

impl Profile {
    pub fn uses_host_service(&self) -> bool {
        self.entry == Entry::HostService || self.exit == Exit::HostService
    }

    /// Reject registrations that do not match the attached module type
    pub fn check_registration<E>(&self, reg: &Registration) -> Result<(), Error<E>> {
        let expected = match &self.expected {
            Some(e) => e,
            None => return Ok(()),
        };

        let checks = [
            ("handle", reg.handle as u32, expected.handle as u32),
            ("bank count", reg.num_banks as u32, expected.num_banks as u32),
            ("bank algorithm", reg.bank_algorithm as u32, expected.bank_algorithm as u32),
        ];
        for (field, got, expected) in checks.iter() {
            if got != expected {
                return Err(Error::RegistrationMismatch {
                    model: self.name,
                    field: *field,
                    got: *got,
                    expected: *expected,
                });
            }
        }
        if reg.bank_size == 0 {
            return Err(Error::RegistrationMismatch {
                model: self.name,
                field: "bank size",
                got: 0,
                expected: 1,
            });
        }
        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BootMode {
    Bootloader = 0,
    Application = 1,
}

/// Host capability that switches the module's boot mode directly
pub trait BootModeService {
    fn set_boot_mode(&mut self, mode: BootMode) -> anyhow::Result<()>;
}

/// Enter/exit strategy for one model
pub struct BootEntry {
    profile: &'static Profile,
    service: Option<Box<dyn BootModeService>>,
}

impl BootEntry {
    pub fn new(profile: &'static Profile) -> Self {
        Self { profile, service: None }
    }

    /// Attach the host service used by models that switch boot mode through it
    pub fn with_service(mut self, service: Box<dyn BootModeService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn profile(&self) -> &'static Profile {
        self.profile
    }

    /// Place the module in bootloader mode
    pub fn enter<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: core::fmt::Debug,
    {
        info!("Entering bootloader ({})", self.profile.name);

        match self.profile.entry {
            Entry::HostService => {
                self.set_boot_mode::<E>(BootMode::Bootloader)?;
                // Clear the serial line before starting
                link.read_line()?;
            }
            Entry::Serial { reset } => {
                if let Some(r) = reset {
                    reset_via_break(link, r)?;
                }
                link.drain()?;
                link.write(protocol::ENTER_BOOTLOADER)?;
                link.delay_ms(ENTER_SETTLE_MS);

                let response = link.read_line()?;
                if !response.is_empty() {
                    return Err(Error::EnterBootloader(format!(
                        "module replied {:?}",
                        String::from_utf8_lossy(&response)
                    )));
                }
            }
        }

        info!("In bootloader");
        Ok(())
    }

    /// Return the module to normal operation
    pub fn exit<P, D, E>(&mut self, link: &mut Link<P, D, E>) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        E: core::fmt::Debug,
    {
        info!("Rebooting module");

        match self.profile.exit {
            Exit::Reboot => link.write(&[Command::Reboot.opcode()]),
            Exit::Reset(r) => reset_via_break(link, r),
            Exit::HostService => {
                self.set_boot_mode::<E>(BootMode::Application)?;
                link.read_line()?;
                Ok(())
            }
        }
    }

    fn set_boot_mode<E>(&mut self, mode: BootMode) -> Result<(), Error<E>> {
        let service = self
            .service
            .as_mut()
            .ok_or_else(|| Error::BootService("no boot mode service available".into()))?;
        debug!("Setting boot mode {:?}", mode);
        service
            .set_boot_mode(mode)
            .map_err(|e| Error::BootService(format!("{:#}", e)))
    }
}

/// Deassert DTR, pulse a break condition, then reassert DTR and let the module start
fn reset_via_break<P, D, E>(link: &mut Link<P, D, E>, r: Reset) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    debug!("Resetting via DTR and UART break");

    link.set_dtr(false)?;
    link.set_break(true)?;
    link.delay_ms(r.break_ms);
    link.set_break(false)?;
    link.set_dtr(true)?;
    link.delay_ms(r.settle_ms);

    Ok(())
}
