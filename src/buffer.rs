//! Sector-sized staging buffer
//!
//! Incoming bytes are collected here until a whole sector (or the tail of the
//! image) is available, so every flash write lands in a sector that was
//! erased just before.

use std::{borrow::Cow, collections::TryReserveError};

/// Buffer size used when the heap cannot spare a whole sector
pub const FALLBACK_BUFFER_SIZE: usize = 256;

#[derive(Debug)]
pub struct SectorBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl SectorBuffer {
    /// Allocate a buffer, failing instead of aborting when memory is short
    pub fn try_with_capacity(capacity: usize) -> Result<Self, TryReserveError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;

        Ok(SectorBuffer { data, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    /// Bytes that still fit
    pub fn spare(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append as much of `src` as fits, returning the number of bytes taken
    pub fn fill(&mut self, src: &[u8]) -> usize {
        let taken = src.len().min(self.spare());
        self.data.extend_from_slice(&src[..taken]);
        taken
    }

    /// Let `read` write up to `max` bytes directly into the buffer
    ///
    /// `read` returns how many bytes it produced; anything beyond the slice it
    /// was given is ignored.
    pub fn read_with(&mut self, max: usize, read: impl FnOnce(&mut [u8]) -> usize) -> usize {
        let len = self.data.len();
        let want = max.min(self.spare());

        self.data.resize(len + want, 0);
        let produced = read(&mut self.data[len..]).min(want);
        self.data.truncate(len + produced);

        produced
    }

    /// The bytes to put into flash, with one byte optionally replaced
    ///
    /// The buffer itself is left untouched so it can still be hashed as
    /// received.
    pub fn persisted(&self, patch: Option<(usize, u8)>) -> Cow<'_, [u8]> {
        match patch {
            Some((offset, value)) if self.data.get(offset).is_some_and(|&b| b != value) => {
                let mut owned = self.data.clone();
                owned[offset] = value;
                Cow::Owned(owned)
            }
            _ => Cow::Borrowed(&self.data),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
