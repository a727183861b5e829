use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use anastasia_loader::usb::UsbOptions;
use anastasia_loader::{BootInfo, FirmwareImage, FlashEvent, Flasher, Options, Session};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Command,

    #[structopt(flatten)]
    usb: UsbOptions,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Write a firmware image to the device
    Write {
        /// Firmware image to flash
        #[structopt(short, long, default_value = "main.bin")]
        file: PathBuf,

        /// Don't check the firmware signature
        #[structopt(short = "d", long)]
        dont_check: bool,
    },
    /// Display bootloader information
    Bootinfo,
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    match &o.command {
        Command::Bootinfo => {
            let mut s = connect(&o)?;
            let info = s.get_info().context("Error fetching boot info")?;
            print_info(&info, o.options.bootloader_size);
        }
        Command::Write { file, dont_check } => {
            let image = FirmwareImage::open(file)
                .with_context(|| format!("Couldn't open file \"{}\"", file.display()))?;

            if !dont_check {
                match image.find_signature() {
                    Some(sig) => info!("Detected firmware: {} v{}", sig.name, sig.version),
                    None => return Err(anyhow!("This is not an Anastasia firmware image")),
                }
            }

            let mut s = connect(&o)?;
            let info = s.get_info().context("Error fetching boot info")?;
            print_info(&info, o.options.bootloader_size);

            let flasher = Flasher::new(o.options.bootloader_size);
            let pages = flasher.preflight(&image, &info)?;

            info!(
                "File contains {} pages ({})",
                pages,
                bytefmt::format(image.len() as u64)
            );

            let pb = ProgressBar::new(pages as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .progress_chars("#>-"),
            );

            let report = flasher.flash(&mut s, &image, &info, |evt| match evt {
                FlashEvent::Started { .. } => pb.set_message("unlocked"),
                FlashEvent::Addressed { address, .. } => {
                    pb.set_message(&format!("0x{:08x} erase", address))
                }
                FlashEvent::Erased { address, .. } => {
                    pb.set_message(&format!("0x{:08x} write", address))
                }
                FlashEvent::Written { address, .. } => {
                    pb.set_message(&format!("0x{:08x} verify", address))
                }
                FlashEvent::Verified { .. } => pb.inc(1),
            });

            let report = match report {
                Ok(r) => r,
                Err(e) => {
                    pb.abandon();
                    return Err(e).context("Flashing failed");
                }
            };

            pb.finish_with_message("done");

            let failed: Vec<_> = report
                .mismatches()
                .map(|p| format!("0x{:08x}", p.address))
                .collect();
            if !failed.is_empty() {
                return Err(anyhow!(
                    "CRC32 check failed for {} page(s): {}",
                    failed.len(),
                    failed.join(", ")
                ));
            }

            info!("Flashed and verified {} pages", report.pages.len());
        }
    }

    Ok(())
}

fn connect(o: &Args) -> anyhow::Result<Session<anastasia_loader::usb::UsbTransport>> {
    info!("Connecting to bootloader");

    let s = Session::usb(&o.usb, o.options.clone()).context("Error connecting to bootloader")?;

    info!("Bootloader connected ({} protocol)", o.options.protocol);

    Ok(s)
}

fn print_info(info: &BootInfo, bootloader_size: u32) {
    let name = info.name();
    let name = if name.chars().all(|c| !c.is_control()) {
        name
    } else {
        hex::encode(&info.name)
    };

    let (start, end) = info.app_range(bootloader_size);

    println!("Bootloader: \t\t{} v{}", name, info.version);
    println!(
        "Flash size: \t\t{} ({} KiB)",
        bytefmt::format(info.flash_size_bytes() as u64),
        info.flash_size_kib
    );
    println!("Page size: \t\t{}b", info.page_size);
    println!(
        "Pages: \t\t\t{} ({} for bootloader)",
        info.total_pages(),
        info.reserved_pages(bootloader_size)
    );
    println!(
        "Available pages: \t{}: 0x{:08x} - 0x{:08x}",
        info.available_pages(bootloader_size),
        start,
        end
    );
    println!("Application address: \t0x{:08x}", info.app_addr);
}
