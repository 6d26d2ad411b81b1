//! Types and functions for the command-line interface
//!
//! The tool works on flash dumps rather than on a device: an image file is
//! staged into the dump exactly as the device would stage it, and the command
//! left for the bootloader is written next to it.

use std::{
    fs::{self, File},
    num::ParseIntError,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Args;
use embedded_io_adapters::std::FromStd;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use miette::{miette, IntoDiagnostic, Result, WrapErr};

use self::config::Config;
use crate::{
    command::{CommandStore, StagingCommand},
    error::{Error, FlashError},
    flash::{FlashMode, FlashSize, MemoryFlash},
    layout::UpdateTarget,
    progress::UpdateObserver,
    stream::IoSource,
    system::HostSystem,
    updater::Updater,
};

pub mod config;

/// Stage an image file into a flash dump
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct StageArgs {
    /// Image file to stage
    pub image: PathBuf,
    /// Flash dump to stage into; created fully erased if it does not exist
    #[arg(long, short = 'f')]
    pub flash: PathBuf,
    /// Size of a newly created flash dump
    #[arg(long, default_value = "1MB")]
    pub flash_size: FlashSize,
    /// SPI mode the device runs its flash in
    #[arg(long, default_value = "dio")]
    pub flash_mode: FlashMode,
    /// Size of the application currently running from the start of flash
    #[arg(long, default_value = "0", value_parser = parse_u32)]
    pub sketch_size: u32,
    /// Region of flash the image replaces
    #[arg(long, short = 't', default_value = "application")]
    pub target: UpdateTarget,
    /// Expected MD5 digest of the image, as 32 hex characters
    #[arg(long)]
    pub md5: Option<String>,
    /// Allow an application image to extend into the filesystem region
    #[arg(long)]
    pub overwrite_fs: bool,
    /// File receiving the command for the bootloader
    #[arg(long, default_value = "eboot_command.bin")]
    pub command_out: PathBuf,
    /// Give up when the image file stalls for this many milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Decode a command written by `stage`
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct InspectCommandArgs {
    /// File holding the command record
    pub command: PathBuf,
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer
pub fn parse_u32(input: &str) -> Result<u32, ParseIntError> {
    match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => input.replace('_', "").parse(),
    }
}

/// Stage `args.image` into the flash dump at `args.flash`
pub fn stage(args: StageArgs, config: &Config) -> Result<()> {
    let flash = open_flash(&args.flash, args.flash_size)?
        .with_mode(args.flash_mode)
        .with_sketch_size(args.sketch_size);

    let image = File::open(&args.image)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open image {}", args.image.display()))?;
    let len = image.metadata().into_diagnostic()?.len();
    let size = u32::try_from(len).map_err(|_| miette!("Image of {} bytes is too large", len))?;

    let commands = FileCommandStore::new(&args.command_out);
    let mut updater = Updater::with_config(flash, HostSystem::new(), commands, config.updater);
    updater.set_observer(Box::new(ProgressBarObserver::default()));

    updater.begin(size, args.target, None, args.overwrite_fs)?;
    if let Some(md5) = &args.md5 {
        updater.set_md5(md5)?;
    }

    let timeout = args
        .timeout
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.updater.stream.timeout());
    let mut source = IoSource::new(FromStd::new(image));
    updater.write_stream(&mut source, timeout)?;

    let outcome = updater.end(false)?;
    info!(
        "Staged {} bytes at {:#010x}, MD5 {}",
        outcome.size,
        outcome.start,
        updater.md5_string()
    );
    match &outcome.command {
        Some(command) => info!("Bootloader command: {}", command),
        None => warn!("Filesystem was written in place, no bootloader command needed"),
    }

    let (flash, _, _) = updater.into_parts();
    fs::write(&args.flash, flash.into_bytes())
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write flash dump {}", args.flash.display()))?;

    Ok(())
}

/// Print the command record at `args.command`
pub fn inspect_command(args: InspectCommandArgs) -> Result<()> {
    let bytes = fs::read(&args.command)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", args.command.display()))?;
    let command = StagingCommand::from_bytes(&bytes)?;

    println!("{command}");
    println!("{command:#?}");

    Ok(())
}

fn open_flash(path: &Path, size: FlashSize) -> Result<MemoryFlash> {
    if path.exists() {
        let data = fs::read(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to read flash dump {}", path.display()))?;
        Ok(MemoryFlash::from_bytes(data))
    } else {
        info!("Creating erased flash dump of {:#x} bytes", size.size());
        Ok(MemoryFlash::new(size))
    }
}

/// [CommandStore] writing the command record to a file
#[derive(Debug, Clone)]
pub struct FileCommandStore {
    path: PathBuf,
}

impl FileCommandStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCommandStore { path: path.into() }
    }
}

impl CommandStore for FileCommandStore {
    fn write_command(&mut self, command: &StagingCommand) -> Result<(), FlashError> {
        fs::write(&self.path, command.as_bytes()).map_err(|err| {
            warn!("Failed to write {}: {}", self.path.display(), err);
            FlashError::Write {
                addr: 0,
                len: StagingCommand::LEN,
            }
        })
    }
}

/// Progress bar following an update session
#[derive(Default)]
pub struct ProgressBarObserver {
    bar: Option<ProgressBar>,
}

impl UpdateObserver for ProgressBarObserver {
    fn on_progress(&mut self, progress: u32, total: u32) {
        let bar = self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(total.into());
            if let Ok(style) = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar.set_message("staging");
            bar
        });

        bar.set_position(progress.into());
    }

    fn on_error(&mut self, error: &Error) {
        if let Some(bar) = &self.bar {
            bar.abandon_with_message(format!("failed: {error}"));
        }
    }

    fn on_end(&mut self) {
        if let Some(bar) = self.bar.take() {
            if !bar.is_finished() {
                bar.finish_with_message("done");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_parse_in_both_radixes() {
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert_eq!(parse_u32("0x4_0000"), Ok(0x4_0000));
        assert_eq!(parse_u32("0XfB000"), Ok(0xF_B000));
        assert!(parse_u32("0x").is_err());
        assert!(parse_u32("eb000").is_err());
    }

    #[test]
    fn file_store_writes_the_record() {
        let path = std::env::temp_dir().join(format!("esp-updater-{}.cmd", std::process::id()));
        let command = StagingCommand::copy_raw(0xE_8000, 0, 0x1234);

        FileCommandStore::new(&path).write_command(&command).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(StagingCommand::from_bytes(&bytes), Ok(command));
    }
}
