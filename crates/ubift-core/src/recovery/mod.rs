//! Deleted-object recovery.
//!
//! The live index only answers for the current state of the file system.
//! Unlinked inodes, tombstoned names and blocks orphaned by wear-levelling
//! still sit in flash until garbage collection reclaims them. This module
//! scans every LEB of a volume (and every stale PEB the UBI layer kept
//! aside) for well-formed nodes and correlates them into a "deleted" shadow
//! view of the file system.

pub mod extract;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ubifs::key::Key;
use crate::ubifs::node::{
    parse_node, DataNode, DentNode, InodeNode, InodeType, NodeBody, ParseError,
    UBIFS_BLOCK_SIZE, UBIFS_NODE_MAGIC_BYTES,
};
use crate::ubifs::{compress, UbifsInstance};
use crate::CancelToken;

/// Where a recovered node was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverySource {
    /// A mapped LEB of the volume, outside the reach of the index.
    VolumeScan,
    /// A stale PEB replaced in the live LEB map.
    StalePeb,
    /// Listed in the on-disk orphan area.
    OrphanArea,
}

/// Everything the raw scan turned up, grouped for correlation.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Every inode-node version seen, per inode number.
    pub inodes: BTreeMap<u32, Vec<(u64, InodeNode)>>,
    /// Every dentry version seen, grouped by key (parent, name hash).
    pub dents: BTreeMap<Key, Vec<(u64, DentNode)>>,
    /// Newest data node per (inode, block).
    pub data: BTreeMap<(u32, u32), (u64, DataNode)>,
    pub crc_failures: u32,
    pub scanned_lebs: u32,
    pub scanned_stale_pebs: u32,
    /// Scan stopped early by the cancellation token.
    pub cancelled: bool,
}

impl ScanOutcome {
    fn record(&mut self, sqnum: u64, body: NodeBody) {
        match body {
            NodeBody::Inode(node) => {
                self.inodes.entry(node.inum).or_default().push((sqnum, node));
            }
            NodeBody::Dent(node) if !node.xattr => {
                self.dents.entry(node.key).or_default().push((sqnum, node));
            }
            NodeBody::Data(node) => {
                let slot = (node.key.inum, node.block());
                let newer = self
                    .data
                    .get(&slot)
                    .map(|(existing, _)| sqnum >= *existing)
                    .unwrap_or(true);
                if newer {
                    self.data.insert(slot, (sqnum, node));
                }
            }
            _ => {}
        }
    }

    fn scan_region(&mut self, data: &[u8]) {
        // Nodes are 8-byte aligned; probe each boundary for the header magic.
        let mut offs = 0usize;
        while offs + 4 <= data.len() {
            if data[offs..offs + 4] == UBIFS_NODE_MAGIC_BYTES {
                match parse_node(data, offs) {
                    Ok(parsed) => self.record(parsed.header.sqnum, parsed.body),
                    Err(ParseError::BadCrc { .. }) => self.crc_failures += 1,
                    Err(_) => {}
                }
            }
            offs += 8;
        }
    }

    /// Dentry versions newest-first for one key.
    fn dent_versions(&self, key: &Key) -> Vec<&(u64, DentNode)> {
        let mut versions: Vec<&(u64, DentNode)> = self
            .dents
            .get(key)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        versions.sort_by_key(|(sqnum, _)| std::cmp::Reverse(*sqnum));
        versions
    }
}

/// A file (or directory) reconstructed from non-live sources.
#[derive(Debug, Clone)]
pub struct RecoveredFile {
    pub inum: u32,
    /// Name from a correlated dentry or tombstone, when one survives.
    pub name: Option<String>,
    pub parent: Option<u32>,
    pub sqnum: u64,
    pub size: u64,
    pub itype: InodeType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: u64,
    pub source: RecoverySource,
    /// Data blocks actually present out of the count the size implies.
    pub blocks_present: u32,
    pub blocks_expected: u32,
}

impl RecoveredFile {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("inode_{}", self.inum))
    }

    pub fn is_recoverable(&self) -> bool {
        self.size == 0 || self.blocks_present > 0
    }
}

/// A name whose newest dentry version is a deletion tombstone.
#[derive(Debug, Clone)]
pub struct TombstonedName {
    pub parent: u32,
    pub name: String,
    pub former_inum: u32,
    pub tombstone_sqnum: u64,
}

/// Scan results plus the correlated deleted view for one UBIFS instance.
pub struct RecoveryEngine<'f, 'u> {
    fs: &'f UbifsInstance<'u>,
    scan: ScanOutcome,
}

impl<'f, 'u> RecoveryEngine<'f, 'u> {
    /// Scan every LEB of the volume and every stale PEB carrying its volume
    /// id. The token is observed between LEBs.
    pub fn scan(fs: &'f UbifsInstance<'u>, cancel: &CancelToken) -> Self {
        let vol = fs.volume();
        let mut scan = ScanOutcome::default();

        for lnum in 0..vol.leb_count() {
            if cancel.is_cancelled() {
                scan.cancelled = true;
                break;
            }
            if !vol.is_mapped(lnum) {
                continue;
            }
            scan.scan_region(&vol.leb(lnum));
            scan.scanned_lebs += 1;
        }

        let data_offset = (vol.ubi().peb_size() - vol.leb_size()) as usize;
        for (peb, _) in vol.ubi().stale_pebs_for(vol.info().id) {
            if cancel.is_cancelled() {
                scan.cancelled = true;
                break;
            }
            if let Some(raw) = vol.ubi().peb_bytes(peb) {
                scan.scan_region(&raw[data_offset..]);
                scan.scanned_stale_pebs += 1;
            }
        }

        tracing::info!(
            "recovery scan: {} LEBs, {} stale PEBs, {} inode numbers, {} dentry keys, {} CRC failures",
            scan.scanned_lebs,
            scan.scanned_stale_pebs,
            scan.inodes.len(),
            scan.dents.len(),
            scan.crc_failures
        );
        RecoveryEngine { fs, scan }
    }

    pub fn outcome(&self) -> &ScanOutcome {
        &self.scan
    }

    /// Names deleted from directories: keys whose newest version is a
    /// tombstone, with the former child inode taken from the newest older
    /// version that still carries one.
    pub fn tombstoned_names(&self) -> Vec<TombstonedName> {
        let mut out = Vec::new();
        for key in self.scan.dents.keys() {
            let versions = self.scan.dent_versions(key);
            let Some((tomb_sqnum, newest)) = versions.first().map(|(s, d)| (*s, d)) else {
                continue;
            };
            if !newest.is_tombstone() {
                continue;
            }
            let Some((_, prior)) = versions.iter().find(|(_, d)| !d.is_tombstone()) else {
                continue;
            };
            out.push(TombstonedName {
                parent: prior.parent(),
                name: prior.name_lossy(),
                former_inum: prior.inum as u32,
                tombstone_sqnum: tomb_sqnum,
            });
        }
        out
    }

    /// The deleted shadow view: every inode recoverable from the scan that
    /// the live index no longer answers for, every unlinked inode, and every
    /// orphan-area inode.
    pub fn recovered_files(&self) -> Result<Vec<RecoveredFile>> {
        let live: BTreeSet<u32> = self.fs.list_inodes()?.into_iter().collect();
        let orphan_listed: BTreeSet<u32> =
            self.fs.orphans().iter().map(|i| *i as u32).collect();
        let tombstones = self.tombstoned_names();

        let mut out = Vec::new();
        for (&inum, versions) in &self.scan.inodes {
            let orphaned = orphan_listed.contains(&inum);
            let unlinked = versions
                .iter()
                .max_by_key(|(sqnum, _)| *sqnum)
                .map(|(_, node)| node.is_unlinked())
                .unwrap_or(false);
            if live.contains(&inum) && !orphaned && !unlinked {
                continue;
            }
            if let Some(file) = self.build_recovered(inum, versions, &tombstones, orphaned) {
                out.push(file);
            }
        }
        Ok(out)
    }

    /// Build the recovered view of one inode regardless of its live status,
    /// e.g. to read pre-truncation content of a file that still exists.
    pub fn recovered_file_for(&self, inum: u32) -> Option<RecoveredFile> {
        let versions = self.scan.inodes.get(&inum)?;
        let orphaned = self.fs.orphans().contains(&u64::from(inum));
        self.build_recovered(inum, versions, &self.tombstoned_names(), orphaned)
    }

    fn build_recovered(
        &self,
        inum: u32,
        versions: &[(u64, InodeNode)],
        tombstones: &[TombstonedName],
        orphaned: bool,
    ) -> Option<RecoveredFile> {
        let tombstone = tombstones.iter().find(|t| t.former_inum == inum);
        let (sqnum, node) = pick_inode_version(versions, tombstone)?;

        let (name, parent) = match tombstone {
            Some(t) => (Some(t.name.clone()), Some(t.parent)),
            None => {
                // Any surviving non-tombstone dentry still naming this
                // inode, e.g. from a stale PEB.
                let dent = self
                    .scan
                    .dents
                    .values()
                    .flatten()
                    .filter(|(_, d)| d.inum == u64::from(inum) && !d.is_tombstone())
                    .max_by_key(|(s, _)| *s);
                match dent {
                    Some((_, d)) => (Some(d.name_lossy()), Some(d.parent())),
                    None => (None, None),
                }
            }
        };

        let blocks_expected = node.size.div_ceil(UBIFS_BLOCK_SIZE as u64) as u32;
        let blocks_present = self
            .scan
            .data
            .range((inum, 0)..=(inum, u32::MAX))
            .count() as u32;

        let source = if orphaned {
            RecoverySource::OrphanArea
        } else {
            RecoverySource::VolumeScan
        };

        Some(RecoveredFile {
            inum,
            name,
            parent,
            sqnum,
            size: node.size,
            itype: node.itype(),
            mode: node.mode,
            uid: node.uid,
            gid: node.gid,
            mtime_sec: node.mtime_sec,
            source,
            blocks_present,
            blocks_expected,
        })
    }

    /// Reassemble content for a recovered inode from scanned data nodes,
    /// sized by the chosen inode version. Decompression failures keep the
    /// partial prefix and are counted, never fatal.
    pub fn read_recovered(&self, file: &RecoveredFile) -> (Vec<u8>, u32) {
        let size = file.size as usize;
        let mut out = vec![0u8; size];
        let mut failures = 0u32;

        if size == 0 {
            return (out, failures);
        }
        for ((_, block), (_, data_node)) in
            self.scan.data.range((file.inum, 0)..=(file.inum, u32::MAX))
        {
            let offset = *block as usize * UBIFS_BLOCK_SIZE;
            if offset >= size {
                continue;
            }
            match compress::decompress(&data_node.data, data_node.compr_type, data_node.size as usize)
            {
                Ok(plain) => {
                    let n = plain.len().min(size - offset);
                    out[offset..offset + n].copy_from_slice(&plain[..n]);
                }
                Err(e) => {
                    tracing::warn!(
                        "inode {} block {}: partial recovery ({e:#})",
                        file.inum,
                        block
                    );
                    failures += 1;
                }
            }
        }
        (out, failures)
    }
}

/// Choose which inode-node version speaks for a recovered file.
///
/// With a tombstone the freshest version at or before the deletion wins.
/// Without one, prefer the version with the largest size (a truncation or
/// unlink rewrite shrinks the inode; the content of interest predates it),
/// breaking ties on sequence number.
fn pick_inode_version<'a>(
    versions: &'a [(u64, InodeNode)],
    tombstone: Option<&TombstonedName>,
) -> Option<(u64, &'a InodeNode)> {
    if let Some(t) = tombstone {
        if let Some((sqnum, node)) = versions
            .iter()
            .filter(|(sqnum, _)| *sqnum <= t.tombstone_sqnum)
            .max_by_key(|(sqnum, _)| *sqnum)
        {
            return Some((*sqnum, node));
        }
    }
    versions
        .iter()
        .max_by_key(|(sqnum, node)| (node.size, *sqnum))
        .map(|(sqnum, node)| (*sqnum, node))
}

/// Aggregate recoverability statistics for one UBIFS volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecoveryReport {
    pub volume: String,
    pub live_inodes: u32,
    pub scanned_inodes: u32,
    pub deleted_inodes: u32,
    pub recoverable_deleted: u32,
    pub tombstoned_names: u32,
    pub orphan_inodes: Vec<u64>,
    pub stale_pebs: u32,
    pub crc_failures: u32,
}

impl<'f, 'u> RecoveryEngine<'f, 'u> {
    pub fn report(&self) -> Result<VolumeRecoveryReport> {
        let recovered = self.recovered_files()?;
        Ok(VolumeRecoveryReport {
            volume: self.fs.volume().info().name.clone(),
            live_inodes: self.fs.list_inodes()?.len() as u32,
            scanned_inodes: self.scan.inodes.len() as u32,
            deleted_inodes: recovered.len() as u32,
            recoverable_deleted: recovered.iter().filter(|f| f.is_recoverable()).count() as u32,
            tombstoned_names: self.tombstoned_names().len() as u32,
            orphan_inodes: self.fs.orphans().to_vec(),
            stale_pebs: self.scan.scanned_stale_pebs,
            crc_failures: self.scan.crc_failures,
        })
    }
}
