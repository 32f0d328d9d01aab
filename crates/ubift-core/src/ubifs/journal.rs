//! Journal discovery and replay.
//!
//! Writes newer than the last commit live outside the index, in *bud* LEBs.
//! The log area names them: walking the log LEB yields a commit-start node
//! and one reference node per journal head, each pointing at a bud. Replay
//! linearly scans every bud, orders what it finds by sequence number and
//! folds it into an in-memory overlay that shadows the on-flash index.

use std::collections::BTreeMap;

use crate::ubi::UbiVolume;

use super::key::Key;
use super::node::{
    align_node_len, parse_node, CsNode, NodeBody, ParsedNode, RefNode, PAD_NODE_SIZE,
};

/// One node recovered from a bud, with its location for diagnostics.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub lnum: u32,
    pub offs: u32,
    pub node: ParsedNode,
}

/// A value in the replay overlay: the freshest journal node for its key.
#[derive(Debug, Clone)]
pub struct OverlayEntry {
    pub sqnum: u64,
    pub node: ParsedNode,
}

/// The newest truncation seen for an inode.
#[derive(Debug, Clone, Copy)]
pub struct Truncation {
    pub sqnum: u64,
    pub new_size: u64,
}

#[derive(Debug, Default)]
pub struct Journal {
    pub cs: Option<CsNode>,
    pub refs: Vec<RefNode>,
    /// Bud contents in sequence-number order.
    pub entries: Vec<JournalEntry>,
    /// Nodes whose header failed to parse during the scan.
    pub damaged_nodes: u32,
}

impl Journal {
    /// Walk the log from `log_lnum` and scan every referenced bud.
    pub fn replay(vol: &UbiVolume<'_>, log_lnum: u32) -> Self {
        let mut journal = Journal::default();

        if !vol.is_mapped(log_lnum) {
            tracing::info!("log LEB {} is unmapped; nothing to replay", log_lnum);
            return journal;
        }
        journal.parse_log(vol, log_lnum);

        for r in journal.refs.clone() {
            journal.parse_bud(vol, r);
        }
        journal
            .entries
            .sort_by_key(|entry| entry.node.header.sqnum);
        tracing::info!(
            "journal replay: {} reference nodes, {} bud nodes",
            journal.refs.len(),
            journal.entries.len()
        );
        journal
    }

    fn parse_log(&mut self, vol: &UbiVolume<'_>, log_lnum: u32) {
        let leb = vol.leb(log_lnum);
        let mut offs = 0usize;
        while offs + PAD_NODE_SIZE <= leb.len() {
            let node = match parse_node(&leb, offs) {
                Ok(n) => n,
                // Erased tail or damage: the log ends here.
                Err(_) => break,
            };
            let advance = align_node_len(node.header.len);
            match node.body {
                NodeBody::Cs(cs) => {
                    tracing::debug!("commit-start node, commit {}", cs.cmt_no);
                    self.cs = Some(cs);
                }
                NodeBody::Ref(r) => {
                    tracing::debug!("reference node: bud LEB {} offset {}", r.lnum, r.offs);
                    self.refs.push(r);
                }
                NodeBody::Pad(p) => {
                    offs += PAD_NODE_SIZE + p.pad_len as usize;
                    continue;
                }
                ref other => {
                    tracing::warn!(
                        "unexpected {} node in log LEB {}; stopping log walk",
                        other.type_name(),
                        log_lnum
                    );
                    break;
                }
            }
            offs += advance;
        }
    }

    fn parse_bud(&mut self, vol: &UbiVolume<'_>, r: RefNode) {
        if !vol.is_mapped(r.lnum) {
            tracing::warn!("bud LEB {} is unmapped", r.lnum);
            return;
        }
        let leb = vol.leb(r.lnum);
        let mut offs = r.offs as usize;
        let mut count = 0usize;
        while offs + PAD_NODE_SIZE <= leb.len() {
            // An erased tail means the end of the written area.
            if leb[offs..].iter().take(8).all(|b| *b == 0xFF) {
                break;
            }
            let node = match parse_node(&leb, offs) {
                Ok(n) => n,
                Err(_) => {
                    self.damaged_nodes += 1;
                    break;
                }
            };
            let advance = align_node_len(node.header.len);
            if let NodeBody::Pad(p) = &node.body {
                offs += PAD_NODE_SIZE + p.pad_len as usize;
                continue;
            }
            self.entries.push(JournalEntry {
                lnum: r.lnum,
                offs: offs as u32,
                node,
            });
            count += 1;
            offs += advance;
        }
        tracing::debug!("bud LEB {}: {} nodes", r.lnum, count);
    }

    /// Fold the replayed nodes into the overlay consulted ahead of the index.
    /// Later sequence numbers win; truncations are tracked per inode.
    pub fn build_overlay(
        &self,
    ) -> (BTreeMap<Key, OverlayEntry>, BTreeMap<u32, Truncation>) {
        let mut overlay: BTreeMap<Key, OverlayEntry> = BTreeMap::new();
        let mut truncations: BTreeMap<u32, Truncation> = BTreeMap::new();
        for entry in &self.entries {
            let sqnum = entry.node.header.sqnum;
            if let NodeBody::Trun(t) = &entry.node.body {
                let slot = truncations.entry(t.inum).or_insert(Truncation {
                    sqnum,
                    new_size: t.new_size,
                });
                if sqnum >= slot.sqnum {
                    *slot = Truncation {
                        sqnum,
                        new_size: t.new_size,
                    };
                }
                continue;
            }
            let Some(key) = entry.node.key() else {
                continue;
            };
            let newer = overlay
                .get(&key)
                .map(|existing| sqnum >= existing.sqnum)
                .unwrap_or(true);
            if newer {
                overlay.insert(
                    key,
                    OverlayEntry {
                        sqnum,
                        node: entry.node.clone(),
                    },
                );
            }
        }
        (overlay, truncations)
    }
}
