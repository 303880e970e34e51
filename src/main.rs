#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use indicatif::ProgressBar;

use msp430_bsl_loader::ihex;
use msp430_bsl_loader::memory::{MemoryMap, Region};
use msp430_bsl_loader::{MemorySections, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate before the BSL switches to high speed
    #[structopt(long, default_value = "9600")]
    baud: usize,

    /// BSL password as 64 hex digits, the contents of the interrupt vector table
    #[structopt(long)]
    password: Option<String>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Connect to the BSL and report the chip ID and BSL version
    Info,

    /// Read a memory range and print it as a hex dump, or save it to a file
    Read {
        /// Start address
        #[structopt(parse(try_from_str = parse_address))]
        address: u16,

        /// Number of bytes to read
        length: usize,

        /// Write the raw bytes to a file instead of dumping them
        #[structopt(long)]
        out: Option<PathBuf>,
    },

    /// Program a firmware image from an Intel-HEX file
    Flash {
        /// Firmware image in Intel-HEX format
        file: PathBuf,

        /// Do not erase before programming
        #[structopt(long)]
        no_erase: bool,

        /// Mass erase first, wiping the information memory including segment A
        #[structopt(long)]
        erase_all: bool,

        /// Read the image back after programming and compare
        #[structopt(long)]
        verify: bool,
    },

    /// Erase the selected memory sections
    Erase {
        /// Erase the main memory
        #[structopt(long)]
        main: bool,

        /// Erase the information memory
        #[structopt(long)]
        information: bool,

        /// Also erase segment A, which usually holds calibration data
        #[structopt(long)]
        segment_a: bool,
    },

    /// Print an Intel-HEX file with resolved absolute addresses
    Print {
        /// Intel-HEX file to inspect
        file: PathBuf,
    },
}

fn main() {
    // Parse out arguments
    let args = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(args.log_level, Config::default());

    if let Err(e) = run(&args) {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    // Inspecting a hex file needs no device.
    if let Command::Print { file } = &args.command {
        let records = ihex::read_file(file)
            .with_context(|| format!("failed to read {}", file.display()))?;

        for (address, data) in ihex::resolve_addresses(&records) {
            let bytes: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
            println!("{:08x}: {}", address, bytes.join(" "));
        }
        return Ok(());
    }

    let password = match &args.password {
        Some(text) => Some(hex::decode(text).context("password is not valid hex")?),
        None => None,
    };
    if let Some(password) = &password {
        if password.len() != 32 {
            bail!("password must be exactly 32 bytes, got {}", password.len());
        }
    }

    info!("Connecting to serial port {}", args.port);

    let mut programmer = Programmer::linux(&args.port, args.baud, args.options.clone())
        .context("failed to open serial port")?;

    info!("Connecting to the BSL");

    programmer
        .init(password.as_deref())
        .context("bootstrap loader bring-up failed")?;

    info!(
        "Connected, chip ID 0x{:04x}, BSL version 0x{:04x}",
        programmer.chip_id(),
        programmer.bsl_version()
    );

    match &args.command {
        Command::Info => {
            println!("Chip ID:     0x{:04x}", programmer.chip_id());
            println!("BSL version: 0x{:04x}", programmer.bsl_version());
        }

        Command::Read {
            address,
            length,
            out,
        } => {
            let mut data = vec![0u8; *length];
            programmer
                .read_mem(*address, &mut data)
                .context("memory read failed")?;

            match out {
                Some(path) => {
                    std::fs::write(path, &data)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(
                        "Wrote {} to {}",
                        bytefmt::format(data.len() as u64),
                        path.display()
                    );
                }
                None => hex_dump(*address, &data),
            }
        }

        Command::Flash {
            file,
            no_erase,
            erase_all,
            verify,
        } => {
            let records = ihex::read_file(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let image = image_from_records(&records)?;

            if image.is_empty() {
                bail!("{} contains no data records", file.display());
            }

            if !*no_erase {
                let sections = if *erase_all {
                    MemorySections::ALL
                } else {
                    MemorySections {
                        main_memory: true,
                        information_memory: false,
                        segment_a: false,
                    }
                };

                info!("Erasing");
                programmer.erase_mem(sections).context("erase failed")?;
            }

            let total: u64 = image.iter().map(|r| r.len() as u64).sum();
            info!(
                "Programming {} in {} regions",
                bytefmt::format(total),
                image.len()
            );

            let progress = ProgressBar::new(total);
            for region in &image {
                programmer
                    .write_mem(region.address(), region.data())
                    .with_context(|| format!("write failed at 0x{:04x}", region.address()))?;
                progress.inc(region.len() as u64);
            }
            progress.finish();

            if *verify {
                info!("Verifying");

                for region in &image {
                    let mut readback = vec![0u8; region.len()];
                    programmer
                        .read_mem(region.address(), &mut readback)
                        .context("verification read failed")?;

                    if readback != region.data() {
                        bail!(
                            "verification mismatch in region at 0x{:04x}",
                            region.address()
                        );
                    }
                }

                info!("Verification passed");
            }
        }

        Command::Erase {
            main,
            information,
            segment_a,
        } => {
            if !*main && !*information {
                bail!("nothing selected, pass --main and/or --information");
            }

            programmer
                .erase_mem(MemorySections {
                    main_memory: *main,
                    information_memory: *information,
                    segment_a: *segment_a,
                })
                .context("erase failed")?;

            info!("Erase complete");
        }

        Command::Print { .. } => unreachable!(),
    }

    programmer
        .terminate()
        .context("failed to release the device")?;

    Ok(())
}

/// Coalesce the data records of an image into contiguous regions.
///
/// Runs with an odd byte count are padded to even length with 0xFF, the
/// erased state of flash, so they fit the block size rules.
fn image_from_records(records: &[ihex::Record]) -> Result<MemoryMap> {
    let mut runs: Vec<(u32, Vec<u8>)> = Vec::new();

    for (address, data) in ihex::resolve_addresses(records) {
        match runs.last_mut() {
            Some((start, bytes)) if *start + bytes.len() as u32 == address => {
                bytes.extend_from_slice(data)
            }
            _ => runs.push((address, data.to_vec())),
        }
    }

    let mut map = MemoryMap::new();

    for (address, mut bytes) in runs {
        if bytes.is_empty() {
            continue;
        }
        if bytes.len() % 2 != 0 {
            bytes.push(0xFF);
        }

        if address % 2 != 0 {
            bail!("image region at 0x{:08x} is not word aligned", address);
        }
        if address + bytes.len() as u32 > 0x1_0000 {
            bail!(
                "image region at 0x{:08x} does not fit 16-bit device memory",
                address
            );
        }

        map.add_region(Region::new(address as u16, bytes))?;
    }

    Ok(map)
}

fn hex_dump(start: u16, data: &[u8]) {
    for (row, chunk) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:04x}: {}", usize::from(start) + row * 16, bytes.join(" "));
    }
}

fn parse_address(s: &str) -> Result<u16, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}
