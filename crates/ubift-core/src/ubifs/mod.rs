//! UBIFS parsing: superblock and master bootstrap, index queries, journal
//! replay, payload decompression.

pub mod compress;
pub mod index;
pub mod journal;
pub mod key;
pub mod lzo;
pub mod node;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UbiftError};
use crate::ubi::UbiVolume;

use index::Tnc;
use journal::{Journal, OverlayEntry, Truncation};
use key::{Key, KeyKind};
use node::{
    parse_node, DentNode, InodeNode, MasterNode, NodeBody, ParsedNode, SuperblockNode,
    UBIFS_BLOCK_SIZE,
};

/// Inode number of the root directory.
pub const ROOT_INO: u32 = 1;

/// Health counters accumulated while bootstrapping and querying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsDiagnostics {
    /// Master-node copies that failed magic/CRC validation.
    pub corrupt_master_copies: u32,
    /// Damaged nodes skipped while scanning journal buds.
    pub damaged_journal_nodes: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Replay the journal into the overlay. Disabled only to inspect the
    /// committed state in isolation.
    pub replay_journal: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            replay_journal: true,
        }
    }
}

/// An inode as reported to callers: payload of the newest inode node for
/// this number, with `size` already clamped by any newer truncation.
#[derive(Debug, Clone)]
pub struct InodeRecord {
    pub sqnum: u64,
    pub node: InodeNode,
}

/// A live directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryRecord {
    pub sqnum: u64,
    pub dent: DentNode,
}

/// A UBIFS file system occupying one UBI volume.
pub struct UbifsInstance<'u> {
    vol: UbiVolume<'u>,
    sb: SuperblockNode,
    master: MasterNode,
    master_sqnum: u64,
    journal: Journal,
    overlay: BTreeMap<Key, OverlayEntry>,
    truncations: BTreeMap<u32, Truncation>,
    orphans: Vec<u64>,
    diagnostics: FsDiagnostics,
}

impl<'u> UbifsInstance<'u> {
    pub fn mount(vol: UbiVolume<'u>) -> Result<Self> {
        Self::mount_with(vol, MountOptions::default())
    }

    pub fn mount_with(vol: UbiVolume<'u>, options: MountOptions) -> Result<Self> {
        let mut diagnostics = FsDiagnostics::default();

        let sb = Self::parse_superblock(&vol)?;
        let (master, master_sqnum) = Self::pick_master(&vol, &sb, &mut diagnostics)?;
        tracing::info!(
            "mounted UBIFS: fmt {}, {} LEBs of {}, commit {}, root index at {}:{}",
            sb.fmt_version,
            sb.leb_cnt,
            sb.leb_size,
            master.cmt_no,
            master.root_lnum,
            master.root_offs
        );

        let orphans = Self::parse_orphans(&vol, &sb);

        let (journal, overlay, truncations) = if options.replay_journal {
            let journal = Journal::replay(&vol, master.log_lnum);
            diagnostics.damaged_journal_nodes = journal.damaged_nodes;
            let (overlay, truncations) = journal.build_overlay();
            (journal, overlay, truncations)
        } else {
            (Journal::default(), BTreeMap::new(), BTreeMap::new())
        };

        Ok(UbifsInstance {
            vol,
            sb,
            master,
            master_sqnum,
            journal,
            overlay,
            truncations,
            orphans,
            diagnostics,
        })
    }

    fn parse_superblock(vol: &UbiVolume<'u>) -> Result<SuperblockNode> {
        let leb = vol.leb(0);
        let parsed = parse_node(&leb, 0).map_err(|e| UbiftError::Integrity {
            structure: "superblock node",
            peb: vol.backing_peb(0).unwrap_or(0),
            offset: 0,
            reason: e.to_string(),
        })?;
        match parsed.body {
            NodeBody::Superblock(sb) => Ok(sb),
            other => Err(UbiftError::Integrity {
                structure: "superblock node",
                peb: vol.backing_peb(0).unwrap_or(0),
                offset: 0,
                reason: format!("LEB 0 starts with a {} node", other.type_name()),
            }),
        }
    }

    /// Master nodes are appended to LEBs 1 and 2; each LEB's newest copy is
    /// a candidate and the higher commit number wins. One damaged copy is a
    /// diagnostic, not an error.
    fn pick_master(
        vol: &UbiVolume<'u>,
        sb: &SuperblockNode,
        diagnostics: &mut FsDiagnostics,
    ) -> Result<(MasterNode, u64)> {
        let min_io = sb.min_io_size.max(8);
        let mut candidates = Vec::new();
        for lnum in [1u32, 2u32] {
            match Self::newest_master_in_leb(vol, lnum, min_io) {
                Some(found) => candidates.push(found),
                None => {
                    tracing::warn!("no intact master node in LEB {}", lnum);
                    diagnostics.corrupt_master_copies += 1;
                }
            }
        }
        candidates
            .into_iter()
            .max_by_key(|(m, sqnum)| (m.cmt_no, *sqnum))
            .ok_or_else(|| UbiftError::Integrity {
                structure: "master node",
                peb: vol.backing_peb(1).unwrap_or(1),
                offset: 0,
                reason: "both master copies are corrupt".into(),
            })
    }

    fn newest_master_in_leb(
        vol: &UbiVolume<'u>,
        lnum: u32,
        min_io: u32,
    ) -> Option<(MasterNode, u64)> {
        let leb = vol.leb(lnum);
        let mut best: Option<(MasterNode, u64)> = None;
        let mut offs = 0usize;
        while offs + node::COMMON_HEADER_SIZE <= leb.len() {
            match parse_node(&leb, offs) {
                Ok(parsed) => {
                    let advance = node::align_node_len(parsed.header.len);
                    if let NodeBody::Master(m) = parsed.body {
                        let sqnum = parsed.header.sqnum;
                        if best.map(|(_, s)| sqnum >= s).unwrap_or(true) {
                            best = Some((m, sqnum));
                        }
                    }
                    offs += advance;
                }
                Err(_) => {
                    // Skip to the next write-unit boundary; successive master
                    // copies start on min-I/O alignment.
                    let next = (offs / min_io as usize + 1) * min_io as usize;
                    if next <= offs {
                        break;
                    }
                    offs = next;
                }
            }
        }
        best
    }

    fn parse_orphans(vol: &UbiVolume<'u>, sb: &SuperblockNode) -> Vec<u64> {
        let mut orphans = Vec::new();
        let start = sb.orphan_area_start();
        for lnum in start..start + sb.orph_lebs {
            if !vol.is_mapped(lnum) {
                continue;
            }
            let leb = vol.leb(lnum);
            let mut offs = 0usize;
            while offs + node::COMMON_HEADER_SIZE <= leb.len() {
                match parse_node(&leb, offs) {
                    Ok(parsed) => {
                        let advance = node::align_node_len(parsed.header.len);
                        if let NodeBody::Orphan(orph) = parsed.body {
                            orphans.extend(&orph.inums);
                        }
                        offs += advance;
                    }
                    Err(_) => break,
                }
            }
        }
        if !orphans.is_empty() {
            tracing::info!("orphan area lists {} unlinked inodes", orphans.len());
        }
        orphans.sort_unstable();
        orphans.dedup();
        orphans
    }

    pub fn superblock(&self) -> &SuperblockNode {
        &self.sb
    }

    pub fn master(&self) -> &MasterNode {
        &self.master
    }

    pub fn master_sqnum(&self) -> u64 {
        self.master_sqnum
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn orphans(&self) -> &[u64] {
        &self.orphans
    }

    pub fn diagnostics(&self) -> &FsDiagnostics {
        &self.diagnostics
    }

    pub fn volume(&self) -> &UbiVolume<'u> {
        &self.vol
    }

    fn tnc(&self) -> Tnc<'u, '_> {
        let root = (self.master.root_len > 0)
            .then_some((self.master.root_lnum, self.master.root_offs));
        Tnc::new(&self.vol, root)
    }

    /// Overlay-first point lookup.
    fn lookup(&self, key: Key) -> Result<Option<(u64, ParsedNode)>> {
        if let Some(entry) = self.overlay.get(&key) {
            return Ok(Some((entry.sqnum, entry.node.clone())));
        }
        Ok(self
            .tnc()
            .lookup(key)?
            .map(|node| (node.header.sqnum, node)))
    }

    /// Overlay-merged range scan: on-disk leaves first, then overlay entries
    /// for the same range shadow them key by key.
    fn range(&self, min: Key, max: Key) -> Result<BTreeMap<Key, (u64, ParsedNode)>> {
        let mut merged: BTreeMap<Key, (u64, ParsedNode)> = BTreeMap::new();
        for (branch, node) in self.tnc().range(min, max)? {
            merged.insert(branch.key, (node.header.sqnum, node));
        }
        for (key, entry) in self.overlay.range(min..max) {
            let newer = merged
                .get(key)
                .map(|(sqnum, _)| entry.sqnum >= *sqnum)
                .unwrap_or(true);
            if newer {
                merged.insert(*key, (entry.sqnum, entry.node.clone()));
            }
        }
        Ok(merged)
    }

    /// Every inode number for which an inode node exists.
    pub fn list_inodes(&self) -> Result<Vec<u32>> {
        let mut inums = BTreeSet::new();
        for leaf in self.tnc().leaves() {
            let (branch, _) = leaf?;
            if branch.key.kind == KeyKind::Inode {
                inums.insert(branch.key.inum);
            }
        }
        for key in self.overlay.keys() {
            if key.kind == KeyKind::Inode {
                inums.insert(key.inum);
            }
        }
        Ok(inums.into_iter().collect())
    }

    /// Metadata of the inode, size clamped by any newer truncation node.
    pub fn stat_inode(&self, inum: u32) -> Result<InodeRecord> {
        let (sqnum, parsed) = self
            .lookup(Key::inode(inum))?
            .ok_or_else(|| UbiftError::Decoding {
                node: "inode node",
                leb: self.master.root_lnum,
                offset: self.master.root_offs,
                reason: format!("inode {inum} is not in the index"),
            })?;
        let mut node = match parsed.body {
            NodeBody::Inode(n) => n,
            other => {
                return Err(UbiftError::Decoding {
                    node: "inode node",
                    leb: self.master.root_lnum,
                    offset: self.master.root_offs,
                    reason: format!("key for inode {inum} resolves to a {} node", other.type_name()),
                })
            }
        };
        if let Some(trunc) = self.truncations.get(&inum) {
            if trunc.sqnum > sqnum {
                node.size = node.size.min(trunc.new_size);
            }
        }
        Ok(InodeRecord { sqnum, node })
    }

    /// File content: every data block in offset order, holes zero-filled,
    /// exactly `stat_inode(inum).node.size` bytes.
    pub fn read_inode(&self, inum: u32) -> Result<Vec<u8>> {
        let stat = self.stat_inode(inum)?;
        let size = stat.node.size as usize;
        let mut out = vec![0u8; size];

        // Fast symlinks and inline data live in the inode node itself.
        if !stat.node.data.is_empty() {
            let n = stat.node.data.len().min(size);
            out[..n].copy_from_slice(&stat.node.data[..n]);
            return Ok(out);
        }

        let blocks = self.range(
            Key::range_start(inum, KeyKind::Data),
            Key::range_end(inum, KeyKind::Data),
        )?;
        for (key, (sqnum, parsed)) in blocks {
            let NodeBody::Data(data_node) = parsed.body else {
                continue;
            };
            if let Some(trunc) = self.truncations.get(&inum) {
                // Blocks written before a newer truncation no longer extend
                // past its cut-off.
                if trunc.sqnum > sqnum
                    && u64::from(key.payload) * UBIFS_BLOCK_SIZE as u64 >= trunc.new_size
                {
                    continue;
                }
            }
            let offset = key.payload as usize * UBIFS_BLOCK_SIZE;
            if offset >= size {
                continue;
            }
            let plain = compress::decompress(
                &data_node.data,
                data_node.compr_type,
                data_node.size as usize,
            )
            .map_err(|e| UbiftError::Decoding {
                node: "data node",
                leb: 0,
                offset: 0,
                reason: format!("inode {inum} block {}: {e:#}", key.payload),
            })?;
            let n = plain.len().min(size - offset);
            out[offset..offset + n].copy_from_slice(&plain[..n]);
        }
        Ok(out)
    }

    /// Directory entries of `parent`, tombstones and xattr entries excluded.
    pub fn list_dir(&self, parent: u32) -> Result<Vec<DirEntryRecord>> {
        let merged = self.range(
            Key::range_start(parent, KeyKind::Dentry),
            Key::range_end(parent, KeyKind::Dentry),
        )?;
        let mut entries = Vec::new();
        for (_, (sqnum, parsed)) in merged {
            if let NodeBody::Dent(dent) = parsed.body {
                if !dent.is_tombstone() {
                    entries.push(DirEntryRecord { sqnum, dent });
                }
            }
        }
        entries.sort_by(|a, b| a.dent.name.cmp(&b.dent.name));
        Ok(entries)
    }

    /// Extended-attribute entries hosted by `inum`.
    pub fn list_xattr_entries(&self, inum: u32) -> Result<Vec<DirEntryRecord>> {
        let merged = self.range(
            Key::range_start(inum, KeyKind::Xattr),
            Key::range_end(inum, KeyKind::Xattr),
        )?;
        Ok(merged
            .into_values()
            .filter_map(|(sqnum, parsed)| match parsed.body {
                NodeBody::Dent(dent) => Some(DirEntryRecord { sqnum, dent }),
                _ => None,
            })
            .collect())
    }

    /// Every dentry in the tree whose child inode is `inum`. The key alone
    /// cannot answer this, so the whole dentry key space is walked.
    pub fn find_dentries_for(&self, inum: u32) -> Result<Vec<DirEntryRecord>> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();
        for leaf in self.tnc().leaves() {
            let (branch, parsed) = leaf?;
            if branch.key.kind != KeyKind::Dentry {
                continue;
            }
            // Overlay entries shadow this key; handled below.
            if self.overlay.contains_key(&branch.key) {
                continue;
            }
            if let NodeBody::Dent(dent) = parsed.body {
                if dent.inum == u64::from(inum) {
                    seen.insert(branch.key);
                    found.push(DirEntryRecord {
                        sqnum: parsed.header.sqnum,
                        dent,
                    });
                }
            }
        }
        for (key, entry) in &self.overlay {
            if key.kind != KeyKind::Dentry || seen.contains(key) {
                continue;
            }
            if let NodeBody::Dent(dent) = &entry.node.body {
                if dent.inum == u64::from(inum) {
                    found.push(DirEntryRecord {
                        sqnum: entry.sqnum,
                        dent: dent.clone(),
                    });
                }
            }
        }
        Ok(found)
    }

    /// Walk dentries upward to the root to rebuild a path. Falls back to the
    /// bare name when a parent link is missing.
    pub fn path_of(&self, dent: &DentNode) -> String {
        let mut segments = vec![dent.name_lossy()];
        let mut parent = dent.parent();
        let mut hops = 0;
        while parent != ROOT_INO && hops < 64 {
            match self.find_dentries_for(parent) {
                Ok(parents) if !parents.is_empty() => {
                    segments.push(parents[0].dent.name_lossy());
                    parent = parents[0].dent.parent();
                }
                _ => break,
            }
            hops += 1;
        }
        segments.reverse();
        segments.join("/")
    }

    /// The truncation overlay entry for an inode, if the journal holds one.
    pub fn truncation_for(&self, inum: u32) -> Option<Truncation> {
        self.truncations.get(&inum).copied()
    }
}
