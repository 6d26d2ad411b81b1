//! Placement of the staging window in flash
//!
//! A new image is never written over the running one. The [Planner] picks a
//! window high up in the free flash area for an application image, and
//! either the filesystem region itself or a window below it for a filesystem
//! image.

use log::debug;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{error::Error, flash::Flash, system::BootMode};

/// Command code of an application update
pub const U_FLASH: u32 = 0;
/// Command code of a filesystem update
pub const U_FS: u32 = 100;

/// Region of flash an update replaces
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UpdateTarget {
    /// The application image at the start of flash
    #[default]
    #[cfg_attr(feature = "cli", value(alias = "app"))]
    Application,
    /// The filesystem region
    #[cfg_attr(feature = "cli", value(alias = "fs"))]
    Filesystem,
}

impl UpdateTarget {
    /// Numeric command code of the target
    pub const fn code(self) -> u32 {
        match self {
            UpdateTarget::Application => U_FLASH,
            UpdateTarget::Filesystem => U_FS,
        }
    }
}

impl TryFrom<u32> for UpdateTarget {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            U_FLASH => Ok(UpdateTarget::Application),
            U_FS => Ok(UpdateTarget::Filesystem),
            other => Err(Error::UnknownTarget(other)),
        }
    }
}

/// Static partitioning of the flash, as laid out by the linker script
///
/// All addresses are relative to [crate::flash::FLASH_MAPPED_BASE].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashLayout {
    /// First byte of the filesystem region
    pub fs_start: u32,
    /// One past the last byte of the filesystem region
    pub fs_end: u32,
    /// Highest address an application update may reach when it is allowed to
    /// overwrite the filesystem
    pub app_ceiling: u32,
    /// Stage filesystem images below the filesystem and let the bootloader
    /// copy them into place
    pub atomic_fs: bool,
    /// The flash size is mapped at runtime, so the size declared in an image
    /// header is meaningless
    pub flash_map_support: bool,
}

impl Default for FlashLayout {
    /// 1 MB flash with a 64 KB filesystem
    fn default() -> Self {
        FlashLayout {
            fs_start: 0xE_B000,
            fs_end: 0xF_B000,
            app_ceiling: 0xF_B000,
            atomic_fs: false,
            flash_map_support: false,
        }
    }
}

/// Flash area reserved for an update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingWindow {
    pub target: UpdateTarget,
    /// Address the image is written to
    pub start: u32,
    /// Declared image size
    pub size: u32,
}

impl StagingWindow {
    /// One past the last byte of the image
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.size)
    }

    /// Whether the window intersects `[0, len)`
    pub fn overlaps_prefix(&self, len: u32) -> bool {
        self.size > 0 && self.start < len
    }
}

/// Computes staging windows from the state of the device
#[derive(Clone, Copy, Debug)]
pub struct Planner {
    layout: FlashLayout,
    sector_size: u32,
    sketch_size: u32,
    real_size: u32,
    configured_size: u32,
    config_ok: bool,
    boot_mode: BootMode,
}

impl Planner {
    pub fn new<F: Flash + ?Sized>(layout: FlashLayout, flash: &F, boot_mode: BootMode) -> Self {
        Planner {
            layout,
            sector_size: flash.sector_size(),
            sketch_size: flash.sketch_size(),
            real_size: flash.real_size(),
            configured_size: flash.configured_size(),
            config_ok: flash.check_config(),
            boot_mode,
        }
    }

    /// Reserve a window for an image of `size` bytes
    pub fn plan(
        &self,
        size: u32,
        target: UpdateTarget,
        overwrite_fs: bool,
    ) -> Result<StagingWindow, Error> {
        // A device strapped into download mode cannot restart into the staged
        // image, so there is no point in receiving it.
        if !self.boot_mode.can_restart_into_app() {
            return Err(Error::InvalidBootstrap);
        }

        if size == 0 {
            return Err(Error::BadSize);
        }

        if !self.config_ok || self.sector_size == 0 {
            return Err(Error::FlashConfig {
                real: self.real_size,
                configured: self.configured_size,
            });
        }

        let sketch_size = self.round_up(self.sketch_size)?;
        let rounded = self.round_up(size)?;

        let start = match target {
            UpdateTarget::Application => {
                let end = if overwrite_fs {
                    self.layout.app_ceiling
                } else {
                    self.layout.fs_start
                };

                self.below(end, rounded, sketch_size)?
            }
            UpdateTarget::Filesystem => {
                let fs_start = self.round_down(self.layout.fs_start);
                let fits = fs_start
                    .checked_add(rounded)
                    .is_some_and(|end| end <= self.layout.fs_end);
                if !fits {
                    return Err(Error::NoSpace);
                }

                if self.layout.atomic_fs {
                    self.below(fs_start, rounded, sketch_size)?
                } else {
                    fs_start
                }
            }
        };

        debug!("[begin] roundedSize:       {:#010x} ({})", rounded, rounded);
        debug!("[begin] currentSketchSize: {:#010x} ({})", sketch_size, sketch_size);
        debug!("[begin] startAddress:      {:#010x} ({})", start, start);

        Ok(StagingWindow {
            target,
            start,
            size,
        })
    }

    /// Place `rounded` bytes so that they end at `end`, above the running
    /// image
    fn below(&self, end: u32, rounded: u32, sketch_size: u32) -> Result<u32, Error> {
        let end = self.round_down(end);
        let start = end.saturating_sub(rounded);
        debug!("[begin] updateEndAddress:  {:#010x} ({})", end, end);

        // Also rejects images larger than the whole region, which saturate
        // to zero above.
        if start < sketch_size || start.checked_add(rounded).is_none_or(|e| e > end) {
            return Err(Error::NoSpace);
        }

        Ok(start)
    }

    fn round_up(&self, value: u32) -> Result<u32, Error> {
        value
            .div_ceil(self.sector_size)
            .checked_mul(self.sector_size)
            .ok_or(Error::NoSpace)
    }

    fn round_down(&self, value: u32) -> u32 {
        value - value % self.sector_size
    }
}
