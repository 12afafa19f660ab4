#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs::File;
use std::io::{self, BufReader, ErrorKind as IoErrorKind};
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};

use uwf_loader::linux::DeviceService;
use uwf_loader::model::{lookup, GENERIC};
use uwf_loader::{BootEntry, Driver, Error, Link, Options, RecordReader, Summary};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// Module model, selects how the bootloader is entered and left
    #[structopt(long, default_value = "BL654")]
    model: String,

    /// UWF firmware file to load
    #[structopt(parse(from_os_str))]
    file: PathBuf,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    match run(o) {
        Ok(s) => info!(
            "Update complete: {} records, {} sectors erased, {} written",
            s.records,
            s.sectors_erased,
            bytefmt::format(s.bytes_written as u64)
        ),
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.kind().exit_code());
        }
    }
}

fn run(o: Args) -> Result<Summary, Error<IoErrorKind>> {
    let profile = match lookup(&o.model) {
        Some(p) => p,
        None => {
            warn!("Unknown model '{}', using {}", o.model, GENERIC.name);
            &GENERIC
        }
    };

    let file = File::open(&o.file).map_err(|e| Error::Io(e.kind()))?;
    let len = file.metadata().map_err(|e| Error::Io(e.kind()))?.len();

    info!(
        "Loading {} ({}) onto {} via {}",
        o.file.display(),
        bytefmt::format(len),
        profile.name,
        o.port
    );

    info!("Connecting to serial port");

    let link = Link::linux(&o.port, o.baud, o.options)
        .map_err(|e| Error::Serial(io::Error::from(e).kind()))?;

    let mut entry = BootEntry::new(profile);
    if profile.uses_host_service() {
        entry = entry.with_service(Box::new(DeviceService));
    }

    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} {eta}  ")
            .progress_chars("#>-"),
    );

    let mut driver = Driver::new(link, entry);
    let mut reader = RecordReader::new(BufReader::new(file));

    let res = driver.run(&mut reader, |record| bar.inc(record.stored_len() as u64));

    match &res {
        Ok(_) => bar.finish(),
        Err(_) => bar.abandon(),
    }

    res
}
