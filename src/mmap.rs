//! Thin wrapper over a single memory-mapped backing file.
//!
//! Segments, indexes and blocks are all, at the byte level, one `MmapFile`
//! each. This module owns only the file/mapping lifecycle; layout and
//! concurrency live in [`crate::segment`].

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

const PAGE: usize = 4096;

pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Creates (truncating if present) and maps `path` at exactly `len` bytes.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::CorruptMetadata("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Creates `path` only if it does not already exist, failing otherwise.
    /// Used when publishing a segment under a temporary name that must not
    /// collide with a concurrent initializer's own temporary file.
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::CorruptMetadata("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::CorruptMetadata("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::CorruptMetadata("range overflow"))?;
        if end > self.len {
            return Err(Error::CorruptMetadata("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Touches every page once so the kernel resolves page faults up front
    /// rather than during the first latency-sensitive write-lease critical
    /// section.
    pub fn prefault(&mut self) {
        let slice = self.map.as_mut();
        let mut off = 0;
        while off < slice.len() {
            slice[off] = 0;
            off += PAGE;
        }
    }
}

/// Rounds `len` up to the nearest multiple of `align` (both in bytes).
pub fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) / align * align
}
