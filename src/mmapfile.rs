//! Memory-mapped segment file primitives.
//!
//! Segment files are written once through a writable mapping, synced, and
//! published by rename; after that they are only ever opened read-only.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{Error, Result};

/// Writable mapping used while building a segment file, before publish.
pub(crate) struct MmapFileMut {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFileMut {
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Corrupt("mmap length must be non-zero"));
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

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    /// Flushes the mapping and syncs the file so the contents survive a
    /// crash once the file is published.
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read-only mapping of a published segment file.
pub(crate) struct MmapFile {
    map: Mmap,
}

impl MmapFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Corrupt("segment file is empty"));
        }
        let map = unsafe { MmapOptions::new().len(len).map(&file)? };
        Ok(Self { map })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
