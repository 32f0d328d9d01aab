//! Partition discovery over a raw MTD-like dump.
//!
//! UBI leaves a recognizable fingerprint: every in-use physical erase block
//! starts with an erase-counter header whose magic is `"UBI#"`. Contiguous
//! runs of those headers, spaced at a constant power-of-two stride, form one
//! UBI partition; everything in between is reported as unknown space.

use serde::{Deserialize, Serialize};

use crate::image::Image;
use crate::ubi::headers::UBI_EC_MAGIC;

/// PEB sizes the scanner will consider, 32 KiB through 1 MiB.
pub const CANDIDATE_PEB_SIZES: [u64; 6] = [
    1 << 15,
    1 << 16,
    1 << 17,
    1 << 18,
    1 << 19,
    1 << 20,
];

pub const DESC_UBI: &str = "UBI";
pub const DESC_UNKNOWN: &str = "Unknown";

/// Explicit flash geometry supplied by the user, bypassing detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub peb_size: u64,
    pub min_io_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtdPartition {
    pub offset: u64,
    pub len: u64,
    pub description: String,
    /// Detected PEB stride; `None` for unknown partitions.
    pub peb_size: Option<u64>,
}

impl MtdPartition {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn is_ubi(&self) -> bool {
        self.description == DESC_UBI
    }

    pub fn peb_count(&self) -> u64 {
        match self.peb_size {
            Some(s) if s > 0 => self.len / s,
            _ => 0,
        }
    }
}

fn has_ec_magic(data: &[u8], offset: u64) -> bool {
    let offset = offset as usize;
    data.len() >= offset + 4 && &data[offset..offset + 4] == UBI_EC_MAGIC
}

fn find_ec_magic(data: &[u8], from: u64) -> Option<u64> {
    let from = from as usize;
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(4)
        .position(|w| w == UBI_EC_MAGIC)
        .map(|p| (from + p) as u64)
}

/// Pick the stride of the run starting at `start`: the smallest candidate
/// size at which the next EC header appears. A lone trailing PEB cannot be
/// measured; it falls back to the smallest candidate.
fn detect_stride(data: &[u8], start: u64) -> u64 {
    for size in CANDIDATE_PEB_SIZES {
        if has_ec_magic(data, start + size) {
            return size;
        }
    }
    CANDIDATE_PEB_SIZES[0]
}

/// Split the image into partitions.
///
/// With an explicit [`Geometry`] the whole image from `offset` onward is
/// trusted to be one UBI partition. Otherwise the image is scanned for
/// EC-header runs; gaps between runs become unknown partitions so that the
/// partitions always tile the full image.
pub fn scan_partitions(image: &Image, geometry: Option<(u64, Geometry)>) -> Vec<MtdPartition> {
    if image.is_empty() {
        return vec![MtdPartition {
            offset: 0,
            len: 0,
            description: DESC_UNKNOWN.to_string(),
            peb_size: None,
        }];
    }

    if let Some((offset, geo)) = geometry {
        let offset = offset.min(image.len());
        let peb_size = geo.peb_size.max(1);
        let len = (image.len() - offset) / peb_size * peb_size;
        let mut parts = Vec::new();
        if offset > 0 {
            parts.push(MtdPartition {
                offset: 0,
                len: offset,
                description: DESC_UNKNOWN.to_string(),
                peb_size: None,
            });
        }
        parts.push(MtdPartition {
            offset,
            len,
            description: DESC_UBI.to_string(),
            peb_size: Some(geo.peb_size),
        });
        let covered = offset + len;
        if covered < image.len() {
            parts.push(MtdPartition {
                offset: covered,
                len: image.len() - covered,
                description: DESC_UNKNOWN.to_string(),
                peb_size: None,
            });
        }
        return parts;
    }

    let data = image.data();
    let mut ubi_runs = Vec::new();
    let mut pos = 0u64;
    while let Some(start) = find_ec_magic(data, pos) {
        let stride = detect_stride(data, start);
        let mut end = start;
        while has_ec_magic(data, end) {
            end += stride;
        }
        let end = end.min(image.len());
        tracing::info!(
            "UBI run at {:#x}..{:#x} ({} PEBs of {} bytes)",
            start,
            end,
            (end - start) / stride,
            stride
        );
        ubi_runs.push(MtdPartition {
            offset: start,
            len: end - start,
            description: DESC_UBI.to_string(),
            peb_size: Some(stride),
        });
        pos = end;
    }

    if ubi_runs.is_empty() {
        return vec![MtdPartition {
            offset: 0,
            len: image.len(),
            description: DESC_UNKNOWN.to_string(),
            peb_size: None,
        }];
    }

    // Fill the gaps so the partition list tiles the image.
    let mut parts = Vec::new();
    let mut cursor = 0u64;
    for run in ubi_runs {
        if run.offset > cursor {
            parts.push(MtdPartition {
                offset: cursor,
                len: run.offset - cursor,
                description: DESC_UNKNOWN.to_string(),
                peb_size: None,
            });
        }
        cursor = run.end();
        parts.push(run);
    }
    if cursor < image.len() {
        parts.push(MtdPartition {
            offset: cursor,
            len: image.len() - cursor,
            description: DESC_UNKNOWN.to_string(),
            peb_size: None,
        });
    }
    parts
}

/// Locate the UBI partition that starts at `offset`, if any.
pub fn partition_at<'a>(parts: &'a [MtdPartition], offset: u64) -> Option<&'a MtdPartition> {
    parts.iter().find(|p| p.offset == offset && p.is_ubi())
}
