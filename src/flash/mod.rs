//! Flash primitives and geometry
//!
//! The [Flash] trait abstracts over the SPI flash attached to the device. The
//! updater only ever erases whole sectors, writes into freshly erased sectors,
//! and reads back staged data for verification.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr, VariantNames};

pub use self::memory::MemoryFlash;
use crate::error::FlashError;

mod memory;

/// Minimum erasable unit of the flash
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;
/// Address at which the flash is memory-mapped; all flash addresses used by
/// the updater are relative to it
pub const FLASH_MAPPED_BASE: u32 = 0x4020_0000;

/// Operations on the attached flash chip
pub trait Flash {
    /// Erase the sector with the given index
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError>;

    /// Write `data` at `addr`, which must lie in erased flash
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Fill `buf` with the flash content starting at `addr`
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Size of the attached chip, as detected from its ID
    fn real_size(&self) -> u32;

    /// Size the firmware was built for
    fn configured_size(&self) -> u32;

    /// Size of an erase sector
    fn sector_size(&self) -> u32 {
        FLASH_SECTOR_SIZE
    }

    /// SPI mode the chip is currently operating in
    fn mode(&self) -> FlashMode;

    /// Size of the currently running application image
    fn sketch_size(&self) -> u32;

    /// Whether the configured flash size is backed by real flash
    fn check_config(&self) -> bool {
        self.real_size() >= self.configured_size()
    }
}

/// Supported flash modes
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Display, VariantNames, FromRepr, Serialize, Deserialize,
)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio = 0,
    /// Quad Output (4 pins used for data)
    Qout = 1,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio = 2,
    /// Dual Output (2 pins used for data)
    Dout = 3,
}

impl FlashMode {
    /// Decode the mode byte of an image header, `None` if unrecognized
    pub fn from_header_byte(value: u8) -> Option<FlashMode> {
        FlashMode::from_repr(value)
    }
}

/// Flash sizes an ESP8266 image header can declare
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Display,
    VariantNames,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FlashSize {
    /// 256 KB
    #[serde(rename = "256KB")]
    #[cfg_attr(feature = "cli", value(name = "256KB"))]
    _256Kb,
    /// 512 KB
    #[serde(rename = "512KB")]
    #[cfg_attr(feature = "cli", value(name = "512KB"))]
    _512Kb,
    /// 1 MB
    #[default]
    #[serde(rename = "1MB")]
    #[cfg_attr(feature = "cli", value(name = "1MB"))]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    #[cfg_attr(feature = "cli", value(name = "2MB"))]
    _2Mb,
    /// 4 MB
    #[serde(rename = "4MB")]
    #[cfg_attr(feature = "cli", value(name = "4MB"))]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    #[cfg_attr(feature = "cli", value(name = "8MB"))]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    #[cfg_attr(feature = "cli", value(name = "16MB"))]
    _16Mb,
}

impl FlashSize {
    /// Decode the size nibble stored in the upper half of the fourth header
    /// byte
    ///
    /// ## Values:
    ///
    /// * <https://docs.espressif.com/projects/esptool/en/latest/esp8266/advanced-topics/firmware-image-format.html#file-header>
    pub const fn from_header_nibble(value: u8) -> Option<FlashSize> {
        match value {
            0x0 => Some(FlashSize::_512Kb),
            0x1 => Some(FlashSize::_256Kb),
            0x2 => Some(FlashSize::_1Mb),
            0x3 => Some(FlashSize::_2Mb),
            0x4 => Some(FlashSize::_4Mb),
            0x8 => Some(FlashSize::_8Mb),
            0x9 => Some(FlashSize::_16Mb),
            _ => None,
        }
    }

    /// Encode into the header nibble, inverse of
    /// [FlashSize::from_header_nibble]
    pub const fn header_nibble(self) -> u8 {
        match self {
            FlashSize::_512Kb => 0x0,
            FlashSize::_256Kb => 0x1,
            FlashSize::_1Mb => 0x2,
            FlashSize::_2Mb => 0x3,
            FlashSize::_4Mb => 0x4,
            FlashSize::_8Mb => 0x8,
            FlashSize::_16Mb => 0x9,
        }
    }

    /// Size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_256Kb => 0x0004_0000,
            FlashSize::_512Kb => 0x0008_0000,
            FlashSize::_1Mb => 0x0010_0000,
            FlashSize::_2Mb => 0x0020_0000,
            FlashSize::_4Mb => 0x0040_0000,
            FlashSize::_8Mb => 0x0080_0000,
            FlashSize::_16Mb => 0x0100_0000,
        }
    }
}
