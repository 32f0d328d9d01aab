//! Forensic reconstruction of UBI volumes and UBIFS file systems from raw
//! NAND/NOR dumps.
//!
//! The crate is a stack of four read-only layers:
//!
//! 1. [`mtd`]: partition discovery over the raw image
//! 2. [`ubi`]: PEB headers, LEB→PEB mapping, volume table
//! 3. [`ubifs`]: node parsing, index traversal, journal replay
//! 4. [`recovery`]: deleted-object scanning, correlation and extraction
//!
//! Each query builds a fresh view stack (`Image` → `UbiInstance` →
//! `UbiVolume` → `UbifsInstance`) and nothing survives a command; the input
//! image is never written.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod image;
pub mod mtd;
pub mod recovery;
pub mod ubi;
pub mod ubifs;

pub use error::{Result, UbiftError};
pub use image::Image;
pub use mtd::{scan_partitions, Geometry, MtdPartition};
pub use recovery::extract::{extract_volume, ExtractReport};
pub use recovery::{RecoveredFile, RecoveryEngine, VolumeRecoveryReport};
pub use ubi::{UbiInstance, UbiVolume, VolumeInfo};
pub use ubifs::{UbifsInstance, ROOT_INO};

/// Cooperative cancellation for long-running scans, observed at LEB
/// granularity. Clone it into whatever thread or signal handler needs to
/// stop a scan.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Aggregate recoverability statistics across a whole image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageSurvey {
    pub partitions: Vec<MtdPartition>,
    pub ubi_instances: u32,
    pub volumes: Vec<VolumeRecoveryReport>,
    /// Volumes that exist at the UBI layer but do not mount as UBIFS.
    pub unmountable_volumes: Vec<String>,
}

/// Walk every UBI instance and UBIFS volume in the image, collecting the
/// recoverability report the `info` command prints.
pub fn survey_image(
    image: &Image,
    geometry: Option<(u64, Geometry)>,
    cancel: &CancelToken,
) -> Result<ImageSurvey> {
    let partitions = scan_partitions(image, geometry);
    let mut survey = ImageSurvey {
        partitions: partitions.clone(),
        ..Default::default()
    };

    for part in partitions.iter().filter(|p| p.is_ubi()) {
        let ubi = match UbiInstance::attach(image, part, geometry.map(|(_, g)| g)) {
            Ok(ubi) => ubi,
            Err(e) => {
                tracing::warn!("partition at {:#x}: {e}", part.offset);
                continue;
            }
        };
        survey.ubi_instances += 1;
        for info in ubi.volumes().to_vec() {
            let Some(vol) = ubi.volume(info.id) else {
                continue;
            };
            match UbifsInstance::mount(vol) {
                Ok(fs_inst) => {
                    let engine = RecoveryEngine::scan(&fs_inst, cancel);
                    survey.volumes.push(engine.report()?);
                }
                Err(e) => {
                    tracing::info!("volume '{}' does not mount as UBIFS: {e}", info.name);
                    survey.unmountable_volumes.push(info.name.clone());
                }
            }
        }
    }
    Ok(survey)
}

/// Recover every UBIFS volume of the image into `out_root`, one directory
/// per volume, with a `deleted/` subtree per volume when `deleted` is set.
pub fn recover_image(
    image: &Image,
    geometry: Option<(u64, Geometry)>,
    out_root: &Path,
    deleted: bool,
    cancel: &CancelToken,
) -> Result<Vec<(String, ExtractReport)>> {
    let partitions = scan_partitions(image, geometry);
    let mut reports = Vec::new();

    for part in partitions.iter().filter(|p| p.is_ubi()) {
        let ubi = UbiInstance::attach(image, part, geometry.map(|(_, g)| g))?;
        for info in ubi.volumes().to_vec() {
            let Some(vol) = ubi.volume(info.id) else {
                continue;
            };
            let fs_inst = match UbifsInstance::mount(vol) {
                Ok(fs_inst) => fs_inst,
                Err(e) => {
                    tracing::warn!("skipping volume '{}': {e}", info.name);
                    continue;
                }
            };
            let out_dir = recovery::extract::volume_dir(out_root, &info.name);
            let report = if deleted {
                let engine = RecoveryEngine::scan(&fs_inst, cancel);
                extract_volume(&fs_inst, Some(&engine), &out_dir, cancel)?
            } else {
                extract_volume(&fs_inst, None, &out_dir, cancel)?
            };
            reports.push((info.name.clone(), report));
        }
    }
    Ok(reports)
}

/// Parse a decimal or `0x`-prefixed hexadecimal offset.
pub fn parse_offset(raw: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_parse_decimal_and_hex() {
        assert_eq!(parse_offset("0").unwrap(), 0);
        assert_eq!(parse_offset("1048576").unwrap(), 1 << 20);
        assert_eq!(parse_offset("0x100000").unwrap(), 1 << 20);
        assert_eq!(parse_offset("0X20").unwrap(), 32);
        assert!(parse_offset("zzz").is_err());
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
