use std::io::{self, ErrorKind as IoErrorKind};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::model::{BootMode, BootModeService};
use crate::{Link, Options, SerialPort};

fn kind(e: SerialError) -> IoErrorKind {
    io::Error::from(e).kind()
}

// Start and stop a UART break condition (tty_ioctl(4))
nix::ioctl_none_bad!(tiocsbrk, libc::TIOCSBRK);
nix::ioctl_none_bad!(tioccbrk, libc::TIOCCBRK);

impl SerialPort<IoErrorKind> for Serial {
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(kind)
    }

    fn set_break(&mut self, level: bool) -> Result<(), IoErrorKind> {
        let fd = self.0.as_raw_fd();

        // SAFETY: the descriptor is owned by the open port and neither
        // request takes an argument
        let res = unsafe {
            if level {
                tiocsbrk(fd)
            } else {
                tioccbrk(fd)
            }
        };

        res.map(|_| ()).map_err(|e| io::Error::from(e).kind())
    }
}

impl Link<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port link
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads return at once; the link's poll delay is the only wait it counts
        port.0.set_timeout(Duration::from_millis(0))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

const DEVICE_SERVICE: &str = "com.lairdtech.device.DeviceService";
const DEVICE_PATH: &str = "/com/lairdtech/device/DeviceService";
const DEVICE_INTERFACE: &str = "com.lairdtech.device.public.DeviceInterface";

/// Gateway device service that switches the integrated module's boot mode,
/// reached over the system bus with `busctl`
#[derive(Clone, Debug, Default)]
pub struct DeviceService;

impl BootModeService for DeviceService {
    fn set_boot_mode(&mut self, mode: BootMode) -> anyhow::Result<()> {
        let arg = (mode as i32).to_string();
        let output = Command::new("busctl")
            .args(&[
                "--system",
                "call",
                DEVICE_SERVICE,
                DEVICE_PATH,
                DEVICE_INTERFACE,
                "SetBtBootMode",
                "i",
                &arg,
            ])
            .output()
            .context("failed to run busctl")?;

        if !output.status.success() {
            bail!(
                "SetBtBootMode call failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        // Reply is printed as "<signature> <value>", e.g. "i 0"
        let reply = String::from_utf8_lossy(&output.stdout);
        let status: i32 = reply
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow!("unexpected SetBtBootMode reply: {:?}", reply.trim()))?;

        if status != 0 {
            bail!("SetBtBootMode({:?}) returned {}", mode, status);
        }
        Ok(())
    }
}
