//! Writing reconstructed trees to disk.
//!
//! The only part of the toolkit that persists anything, and it writes solely
//! under the caller-supplied output directory: the live tree per volume, and
//! a `deleted/` sibling subtree when deleted-mode recovery is on. Per-object
//! failures are recorded and skipped; extraction always runs to completion.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ubifs::node::InodeType;
use crate::ubifs::{UbifsInstance, ROOT_INO};
use crate::CancelToken;

use super::RecoveryEngine;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractReport {
    pub directories_created: u32,
    pub files_written: u32,
    pub deleted_files_written: u32,
    pub symlinks_skipped: u32,
    pub special_skipped: u32,
    pub bytes_written: u64,
    pub partial_decompressions: u32,
    /// Per-object failures, recorded and skipped.
    pub errors: Vec<String>,
}

impl ExtractReport {
    fn record_error(&mut self, context: impl std::fmt::Display) {
        tracing::warn!("{context}");
        self.errors.push(context.to_string());
    }
}

/// Extract the live tree of a mounted UBIFS volume into `out_dir`, and the
/// deleted view next to it when `engine` is provided.
pub fn extract_volume(
    fs_inst: &UbifsInstance<'_>,
    engine: Option<&RecoveryEngine<'_, '_>>,
    out_dir: &Path,
    cancel: &CancelToken,
) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();
    fs::create_dir_all(out_dir).map_err(|e| crate::error::UbiftError::Input {
        path: out_dir.to_path_buf(),
        source: e,
    })?;

    walk_live_dir(fs_inst, ROOT_INO, out_dir, cancel, &mut report, 0);

    if let Some(engine) = engine {
        extract_deleted(engine, &out_dir.join("deleted"), cancel, &mut report);
    }

    tracing::info!(
        "extracted {} files, {} directories, {} deleted objects into {}",
        report.files_written,
        report.directories_created,
        report.deleted_files_written,
        out_dir.display()
    );
    Ok(report)
}

fn walk_live_dir(
    fs_inst: &UbifsInstance<'_>,
    dir_ino: u32,
    dir_path: &Path,
    cancel: &CancelToken,
    report: &mut ExtractReport,
    depth: u32,
) {
    if cancel.is_cancelled() || depth > 64 {
        return;
    }
    let entries = match fs_inst.list_dir(dir_ino) {
        Ok(entries) => entries,
        Err(e) => {
            report.record_error(format!("cannot list directory inode {dir_ino}: {e}"));
            return;
        }
    };
    for entry in entries {
        let name = sanitize_name(&entry.dent.name_lossy());
        let child = entry.dent.inum as u32;
        let path = dir_path.join(&name);
        match entry.dent.dtype {
            Some(InodeType::Directory) => {
                if let Err(e) = fs::create_dir_all(&path) {
                    report.record_error(format!("mkdir {}: {e}", path.display()));
                    continue;
                }
                report.directories_created += 1;
                restore_metadata(fs_inst, child, &path);
                walk_live_dir(fs_inst, child, &path, cancel, report, depth + 1);
            }
            Some(InodeType::Regular) => match fs_inst.read_inode(child) {
                Ok(data) => match fs::write(&path, &data) {
                    Ok(()) => {
                        report.files_written += 1;
                        report.bytes_written += data.len() as u64;
                        restore_metadata(fs_inst, child, &path);
                    }
                    Err(e) => report.record_error(format!("write {}: {e}", path.display())),
                },
                Err(e) => report.record_error(format!("read inode {child} ({name}): {e}")),
            },
            Some(InodeType::Symlink) => {
                report.symlinks_skipped += 1;
                tracing::debug!("skipping symlink {}", name);
            }
            _ => {
                report.special_skipped += 1;
                tracing::debug!("skipping special entry {}", name);
            }
        }
    }
}

fn extract_deleted(
    engine: &RecoveryEngine<'_, '_>,
    deleted_dir: &Path,
    cancel: &CancelToken,
    report: &mut ExtractReport,
) {
    let recovered = match engine.recovered_files() {
        Ok(recovered) => recovered,
        Err(e) => {
            report.record_error(format!("building deleted view: {e}"));
            return;
        }
    };
    if recovered.is_empty() {
        return;
    }
    if let Err(e) = fs::create_dir_all(deleted_dir) {
        report.record_error(format!("mkdir {}: {e}", deleted_dir.display()));
        return;
    }
    for file in recovered {
        if cancel.is_cancelled() {
            return;
        }
        if file.itype != InodeType::Regular {
            continue;
        }
        if !file.is_recoverable() {
            report.record_error(format!(
                "inode {} ({}): no data blocks survive",
                file.inum,
                file.display_name()
            ));
            continue;
        }
        let mut path = deleted_dir.join(sanitize_name(&file.display_name()));
        if path.exists() {
            path = deleted_dir.join(format!("{}_{}", sanitize_name(&file.display_name()), file.inum));
        }
        let (data, failures) = engine.read_recovered(&file);
        report.partial_decompressions += failures;
        match fs::write(&path, &data) {
            Ok(()) => {
                report.deleted_files_written += 1;
                report.bytes_written += data.len() as u64;
            }
            Err(e) => report.record_error(format!("write {}: {e}", path.display())),
        }
    }
}

/// Apply mode and mtime from the inode, best effort.
fn restore_metadata(fs_inst: &UbifsInstance<'_>, inum: u32, path: &Path) {
    let Ok(stat) = fs_inst.stat_inode(inum) else {
        return;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(stat.node.mode & 0o7777));
    }
    if let Ok(file) = fs::File::options().write(true).open(path) {
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(stat.node.mtime_sec);
        let _ = file.set_times(fs::FileTimes::new().set_modified(mtime));
    }
}

/// Keep recovered names from escaping the output directory.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Output directory name for one volume, as created by the recover command.
pub fn volume_dir(out_root: &Path, volume_name: &str) -> PathBuf {
    out_root.join(sanitize_name(volume_name))
}
