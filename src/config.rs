use serde::{Deserialize, Serialize};

use crate::{
    buffer::FALLBACK_BUFFER_SIZE,
    flash::FLASH_SECTOR_SIZE,
    layout::FlashLayout,
    stream::RetryPolicy,
};

/// Static configuration of an [crate::Updater]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Partitioning of the flash
    pub layout: FlashLayout,
    /// Waiting on stalled streams
    pub stream: RetryPolicy,
    /// Size of the staging buffer when the heap allows it
    pub buffer_size: usize,
    /// Size of the staging buffer when the heap is short
    pub fallback_buffer_size: usize,
    /// Do not yield to other tasks while staging
    pub run_async: bool,
}

impl UpdaterConfig {
    /// Buffer size to use given the free heap
    ///
    /// A full buffer is only taken when more than twice its size is free.
    /// Every flush must start either on a sector boundary or inside a sector
    /// erased by an earlier flush, so sizes that do not divide the sector
    /// size are replaced by the sector size.
    pub fn buffer_size_for(&self, free_heap: usize, sector_size: u32) -> usize {
        let size = if free_heap > self.buffer_size.saturating_mul(2) {
            self.buffer_size
        } else {
            self.fallback_buffer_size
        };

        let sector_size = sector_size as usize;
        if size == 0 || sector_size % size != 0 {
            sector_size
        } else {
            size
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            layout: FlashLayout::default(),
            stream: RetryPolicy::default(),
            buffer_size: FLASH_SECTOR_SIZE as usize,
            fallback_buffer_size: FALLBACK_BUFFER_SIZE,
            run_async: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_falls_back_when_heap_is_short() {
        let config = UpdaterConfig::default();

        assert_eq!(config.buffer_size_for(64 * 1024, 4096), 4096);
        assert_eq!(config.buffer_size_for(8192, 4096), 256);
        assert_eq!(config.buffer_size_for(0, 4096), 256);
    }

    #[test]
    fn buffer_must_divide_the_sector() {
        let config = UpdaterConfig {
            buffer_size: 3000,
            ..UpdaterConfig::default()
        };

        assert_eq!(config.buffer_size_for(64 * 1024, 4096), 4096);
        assert_eq!(config.buffer_size_for(64 * 1024, 0x2000), 0x2000);
    }
}
