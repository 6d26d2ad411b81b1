//! Sanity checks on the leading bytes of an update image

use bytemuck::{Pod, Zeroable};
use log::{debug, warn};

use crate::{
    error::Error,
    flash::{FlashMode, FlashSize},
    layout::UpdateTarget,
};

/// First byte of every ESP8266 application image
pub const ESP_MAGIC: u8 = 0xE9;
/// Leading bytes of a gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
/// Offset of the flash mode byte in the image header
pub const FLASH_MODE_OFFSET: usize = 2;

/// The common, 4-byte prefix of an application image header
#[derive(Copy, Clone, Zeroable, Pod, Debug, PartialEq, Eq)]
#[repr(C, packed)]
pub struct ImageHeader {
    pub magic: u8,
    pub segment_count: u8,
    pub flash_mode: u8,
    /// Flash size in the upper nibble, flash frequency in the lower
    pub flash_config: u8,
}

impl ImageHeader {
    pub const LEN: usize = std::mem::size_of::<ImageHeader>();

    pub fn new(segment_count: u8, mode: FlashMode, size: FlashSize, frequency: u8) -> Self {
        ImageHeader {
            magic: ESP_MAGIC,
            segment_count,
            flash_mode: mode as u8,
            flash_config: (size.header_nibble() << 4) | (frequency & 0xf),
        }
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        bytemuck::cast(bytes)
    }

    /// Whether these bytes start a gzip stream rather than an image
    pub fn is_gzip(&self) -> bool {
        [self.magic, self.segment_count] == GZIP_MAGIC
    }

    /// Flash size the image was built for, `None` if unrecognized
    pub fn flash_size(&self) -> Option<FlashSize> {
        FlashSize::from_header_nibble(self.flash_config >> 4)
    }
}

/// Check the first byte received for an update
pub fn check_first_byte(target: UpdateTarget, byte: Option<u8>) -> Result<(), Error> {
    match target {
        UpdateTarget::Application => match byte {
            Some(ESP_MAGIC) => Ok(()),
            Some(b) if b == GZIP_MAGIC[0] => Ok(()),
            _ => Err(Error::MagicByte),
        },
        // Nothing to check before a filesystem image is complete
        UpdateTarget::Filesystem => Ok(()),
    }
}

/// Check the header of a completely staged image
pub fn check_staged_header(
    target: UpdateTarget,
    header: ImageHeader,
    real_size: u32,
    flash_map_support: bool,
) -> Result<(), Error> {
    if target == UpdateTarget::Filesystem {
        return Ok(());
    }

    // The flash size of a compressed image is hidden inside the stream
    if header.is_gzip() {
        debug!("Staged image is gzip compressed");
        return Ok(());
    }

    if header.magic != ESP_MAGIC {
        return Err(Error::MagicByte);
    }

    // With a runtime flash map the header does not describe the chip
    if flash_map_support {
        return Ok(());
    }

    let declared = header.flash_size().map(FlashSize::size).unwrap_or(0);
    if declared > real_size {
        return Err(Error::NewFlashConfig { real: real_size });
    }

    Ok(())
}

/// Flash mode byte to write instead of the one in the image, if any
///
/// `first_chunk` is the first chunk of an application image. Gzip streams are
/// left alone.
pub fn flash_mode_override(first_chunk: &[u8], chip_mode: FlashMode) -> Option<u8> {
    if first_chunk.first() == Some(&GZIP_MAGIC[0]) {
        return None;
    }

    let raw = *first_chunk.get(FLASH_MODE_OFFSET)?;
    if FlashMode::from_header_byte(raw) == Some(chip_mode) {
        return None;
    }

    warn!("Set flash mode from {:#x} to {:#x}", raw, chip_mode as u8);
    Some(chip_mode as u8)
}

#[cfg(test)]
mod tests {
    use bytemuck::bytes_of;

    use super::*;

    const ONE_MB: u32 = 0x10_0000;

    #[test]
    fn header_layout() {
        let header = ImageHeader::new(3, FlashMode::Dout, FlashSize::_4Mb, 0xf);

        assert_eq!(bytes_of(&header), &[0xE9, 3, 3, 0x4f]);
        assert_eq!(header.flash_size(), Some(FlashSize::_4Mb));
    }

    #[test]
    fn first_byte_of_application() {
        let app = UpdateTarget::Application;

        assert!(check_first_byte(app, Some(0xE9)).is_ok());
        assert!(check_first_byte(app, Some(0x1F)).is_ok());
        assert_eq!(check_first_byte(app, Some(0x00)), Err(Error::MagicByte));
        assert_eq!(check_first_byte(app, None), Err(Error::MagicByte));
        assert!(check_first_byte(UpdateTarget::Filesystem, Some(0x00)).is_ok());
    }

    #[test]
    fn staged_header_must_fit_the_chip() {
        let app = UpdateTarget::Application;
        let fits = ImageHeader::new(1, FlashMode::Dio, FlashSize::_1Mb, 0);
        let too_big = ImageHeader::new(1, FlashMode::Dio, FlashSize::_4Mb, 0);

        assert!(check_staged_header(app, fits, ONE_MB, false).is_ok());
        assert_eq!(
            check_staged_header(app, too_big, ONE_MB, false),
            Err(Error::NewFlashConfig { real: ONE_MB })
        );
        assert!(check_staged_header(app, too_big, ONE_MB, true).is_ok());
    }

    #[test]
    fn staged_gzip_is_accepted() {
        let header = ImageHeader::from_bytes([0x1F, 0x8B, 0x08, 0x00]);

        assert!(check_staged_header(UpdateTarget::Application, header, ONE_MB, false).is_ok());
    }

    #[test]
    fn staged_garbage_is_rejected() {
        let header = ImageHeader::from_bytes([0x1F, 0x00, 0x00, 0x00]);

        assert_eq!(
            check_staged_header(UpdateTarget::Application, header, ONE_MB, false),
            Err(Error::MagicByte)
        );
        assert!(check_staged_header(UpdateTarget::Filesystem, header, ONE_MB, false).is_ok());
    }

    #[test]
    fn flash_mode_is_overridden_when_it_differs() {
        let image = [0xE9, 1, FlashMode::Qio as u8, 0x20];

        assert_eq!(flash_mode_override(&image, FlashMode::Dout), Some(3));
        assert_eq!(flash_mode_override(&image, FlashMode::Qio), None);
        assert_eq!(flash_mode_override(&[0xE9, 1, 0x7f], FlashMode::Qio), Some(0));
        assert_eq!(flash_mode_override(&[0x1F, 0x8B, 0x08], FlashMode::Dout), None);
        assert_eq!(flash_mode_override(&[0xE9, 1], FlashMode::Dout), None);
    }
}
