//! Over-the-air update staging for ESP8266-class devices
//!
//! An update is written into an unused region of flash while the current
//! application keeps running from its own. Only once the staged image has
//! been verified, against an MD5 digest or a detached signature, is a
//! [StagingCommand] left for the second-stage bootloader, which copies the
//! image into place on the next restart. A failure at any point leaves the
//! running image untouched.
//!
//! ```no_run
//! use esp_updater::{
//!     flash::{FlashSize, MemoryFlash},
//!     MemoryCommandStore,
//!     UpdateTarget,
//!     Updater,
//!     VirtualSystem,
//! };
//!
//! # fn main() -> Result<(), esp_updater::Error> {
//! # let image = vec![0xE9u8; 1024];
//! let flash = MemoryFlash::new(FlashSize::_1Mb).with_sketch_size(0x4_0000);
//! let mut updater = Updater::new(flash, VirtualSystem::new(), MemoryCommandStore::new());
//!
//! updater.begin(image.len() as u32, UpdateTarget::Application, None, false)?;
//! updater.write(&image)?;
//! updater.end(false)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Cargo Features
//!
//! - `cli`: the `esp-updater` command-line tool, which stages image files
//!   into flash dumps
//! - `std`: `std::io` adapters for byte sources

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use self::{
    command::{CommandStore, MemoryCommandStore, StagingCommand},
    config::UpdaterConfig,
    error::{Error, ErrorCode},
    layout::{FlashLayout, UpdateTarget},
    progress::UpdateObserver,
    system::{HostSystem, Led, System, VirtualSystem},
    updater::{StagingOutcome, Updater},
};

pub mod buffer;
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod flash;
pub mod image;
pub mod layout;
pub mod progress;
pub mod stream;
pub mod system;
pub mod verify;

mod updater;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
