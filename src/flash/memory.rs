use log::trace;

use super::{Flash, FlashMode, FlashSize, FLASH_SECTOR_SIZE};
use crate::error::FlashError;

const ERASED: u8 = 0xff;

/// A NOR flash held in memory
///
/// Erasing sets a sector to `0xFF`, writing can only clear bits. Every erase
/// and write is logged so callers can check what the updater did to the
/// device, and faults can be injected at a given sector or address.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    data: Vec<u8>,
    sector_size: u32,
    configured_size: u32,
    mode: FlashMode,
    sketch_size: u32,
    erase_log: Vec<u32>,
    write_log: Vec<(u32, usize)>,
    fail_erase: Option<u32>,
    fail_write: Option<u32>,
    fail_read: bool,
}

impl MemoryFlash {
    /// A fully erased flash of the given size
    pub fn new(size: FlashSize) -> Self {
        Self::from_bytes(vec![ERASED; size.size() as usize])
    }

    /// Wrap an existing flash dump
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);

        MemoryFlash {
            data,
            sector_size: FLASH_SECTOR_SIZE,
            configured_size: size,
            mode: FlashMode::default(),
            sketch_size: 0,
            erase_log: Vec::new(),
            write_log: Vec::new(),
            fail_erase: None,
            fail_write: None,
            fail_read: false,
        }
    }

    pub fn with_mode(mut self, mode: FlashMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sketch_size(mut self, sketch_size: u32) -> Self {
        self.sketch_size = sketch_size;
        self
    }

    pub fn with_configured_size(mut self, configured_size: u32) -> Self {
        self.configured_size = configured_size;
        self
    }

    /// Make erasing the given sector fail
    pub fn fail_erase_at(&mut self, sector: u32) {
        self.fail_erase = Some(sector);
    }

    /// Make any write touching the given address fail
    pub fn fail_write_at(&mut self, addr: u32) {
        self.fail_write = Some(addr);
    }

    /// Make every read fail
    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_read = fail;
    }

    /// Indexes of all sectors erased so far, in order
    pub fn erased_sectors(&self) -> &[u32] {
        &self.erase_log
    }

    /// Address and length of every write so far, in order
    pub fn writes(&self) -> &[(u32, usize)] {
        &self.write_log
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(FlashError::OutOfRange { addr, len })?;

        Ok(start..end)
    }
}

impl Flash for MemoryFlash {
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        trace!("Erasing sector {}", sector);

        if self.fail_erase == Some(sector) {
            return Err(FlashError::Erase(sector));
        }

        let addr = sector
            .checked_mul(self.sector_size)
            .ok_or(FlashError::Erase(sector))?;
        let range = self
            .range(addr, self.sector_size as usize)
            .map_err(|_| FlashError::Erase(sector))?;

        self.data[range].fill(ERASED);
        self.erase_log.push(sector);

        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        trace!("Writing {} bytes at {:#x}", data.len(), addr);

        let range = self.range(addr, data.len())?;
        if let Some(fail) = self.fail_write {
            if range.contains(&(fail as usize)) {
                return Err(FlashError::Write {
                    addr,
                    len: data.len(),
                });
            }
        }

        for (cell, byte) in self.data[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.write_log.push((addr, data.len()));

        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if self.fail_read {
            return Err(FlashError::Read {
                addr,
                len: buf.len(),
            });
        }

        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);

        Ok(())
    }

    fn real_size(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    fn configured_size(&self) -> u32 {
        self.configured_size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn mode(&self) -> FlashMode {
        self.mode
    }

    fn sketch_size(&self) -> u32 {
        self.sketch_size
    }
}
