//! Memory-mapped access to a raw flash dump.

use std::fs::File;
use std::path::Path;

use crate::error::{Result, UbiftError};

enum Backing {
    Mmap(memmap2::Mmap),
    Owned(Vec<u8>),
}

/// A raw NAND/NOR dump, mapped read-only.
///
/// The sole physical input of the toolkit. Every higher layer addresses it by
/// absolute byte offset and borrows slices out of it; nothing is ever written
/// back.
pub struct Image {
    backing: Backing,
}

impl Image {
    /// Map an image file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| UbiftError::Input {
            path: path.to_path_buf(),
            source,
        })?;
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .map_err(|source| UbiftError::Input {
                    path: path.to_path_buf(),
                    source,
                })?
        };
        tracing::info!("mapped image {} ({} bytes)", path.display(), mmap.len());
        Ok(Image {
            backing: Backing::Mmap(mmap),
        })
    }

    /// Wrap an in-memory buffer. Used by fixtures and by callers that already
    /// hold the dump in memory.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Image {
            backing: Backing::Owned(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mmap(m) => m,
            Backing::Owned(v) => v,
        }
    }

    pub fn len(&self) -> u64 {
        self.data().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Borrow `len` bytes starting at `offset`, bounds-checked.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let end = offset.checked_add(len).ok_or(UbiftError::OutOfBounds {
            offset,
            len,
            image_len: self.len(),
        })?;
        if end > self.len() {
            return Err(UbiftError::OutOfBounds {
                offset,
                len,
                image_len: self.len(),
            });
        }
        Ok(&self.data()[offset as usize..end as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_bounds() {
        let img = Image::from_bytes(vec![0u8; 16]);
        assert_eq!(img.slice(0, 16).unwrap().len(), 16);
        assert_eq!(img.slice(8, 8).unwrap().len(), 8);
        assert!(img.slice(8, 9).is_err());
        assert!(img.slice(u64::MAX, 2).is_err());
    }

    #[test]
    fn empty_image() {
        let img = Image::from_bytes(Vec::new());
        assert!(img.is_empty());
        assert_eq!(img.len(), 0);
    }
}
