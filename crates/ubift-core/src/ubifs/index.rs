//! The on-flash index tree (TNC).
//!
//! A B+-tree keyed by [`Key`]: internal nodes are index nodes whose branches
//! carry (key, target LEB, target offset, target length); level-0 branches
//! point at inode, data and directory-entry nodes. Branches resolve lazily:
//! nothing is read until a lookup or traversal touches it.

use crate::error::{Result, UbiftError};
use crate::ubi::UbiVolume;

use super::key::Key;
use super::node::{parse_node, Branch, IndexNode, NodeBody, ParsedNode};

pub struct Tnc<'u, 'v> {
    vol: &'v UbiVolume<'u>,
    root: Option<(u32, u32)>,
}

impl<'u, 'v> Tnc<'u, 'v> {
    pub fn new(vol: &'v UbiVolume<'u>, root: Option<(u32, u32)>) -> Self {
        Tnc { vol, root }
    }

    /// Parse the node a branch (or the master's root pointer) targets.
    pub fn load(&self, lnum: u32, offs: u32) -> Result<ParsedNode> {
        let leb = self.vol.leb(lnum);
        parse_node(&leb, offs as usize).map_err(|e| UbiftError::Decoding {
            node: "index target",
            leb: lnum,
            offset: offs,
            reason: e.to_string(),
        })
    }

    fn load_index(&self, lnum: u32, offs: u32) -> Result<(IndexNode, ParsedNode)> {
        let node = self.load(lnum, offs)?;
        match &node.body {
            NodeBody::Index(idx) => Ok((idx.clone(), node)),
            other => Err(UbiftError::Decoding {
                node: "index node",
                leb: lnum,
                offset: offs,
                reason: format!("expected an index node, found {}", other.type_name()),
            }),
        }
    }

    /// Point lookup. `Ok(None)` when no leaf carries `key`.
    pub fn lookup(&self, key: Key) -> Result<Option<ParsedNode>> {
        let Some((mut lnum, mut offs)) = self.root else {
            return Ok(None);
        };
        loop {
            let (idx, _) = self.load_index(lnum, offs)?;
            if idx.branches.is_empty() {
                return Ok(None);
            }
            // Last branch whose key is <= the lookup key; keys below the
            // first branch can only live in the leftmost subtree.
            let pos = idx.branches.partition_point(|b| b.key <= key);
            let branch = &idx.branches[pos.saturating_sub(1)];
            if idx.level == 0 {
                if branch.key != key {
                    return Ok(None);
                }
                return self.load(branch.lnum, branch.offs).map(Some);
            }
            lnum = branch.lnum;
            offs = branch.offs;
        }
    }

    /// Collect every leaf with `min <= key < max`, in key order.
    pub fn range(&self, min: Key, max: Key) -> Result<Vec<(Branch, ParsedNode)>> {
        let mut out = Vec::new();
        if let Some((lnum, offs)) = self.root {
            self.range_walk(lnum, offs, min, max, &mut out)?;
        }
        Ok(out)
    }

    fn range_walk(
        &self,
        lnum: u32,
        offs: u32,
        min: Key,
        max: Key,
        out: &mut Vec<(Branch, ParsedNode)>,
    ) -> Result<()> {
        let (idx, _) = self.load_index(lnum, offs)?;
        if idx.level == 0 {
            for branch in &idx.branches {
                if branch.key >= min && branch.key < max {
                    out.push((*branch, self.load(branch.lnum, branch.offs)?));
                }
            }
            return Ok(());
        }
        // A child can hold keys from its branch key up to the next branch
        // key, so start one branch before the first key past `min`.
        let start = idx.branches.partition_point(|b| b.key <= min).saturating_sub(1);
        for branch in &idx.branches[start..] {
            if branch.key >= max {
                break;
            }
            self.range_walk(branch.lnum, branch.offs, min, max, out)?;
        }
        Ok(())
    }

    /// Lazy in-order iteration over every leaf of the tree.
    pub fn leaves(&self) -> LeafIter<'_, 'u, 'v> {
        let mut iter = LeafIter {
            tnc: self,
            stack: Vec::new(),
            failed: false,
        };
        if let Some((lnum, offs)) = self.root {
            match self.load_index(lnum, offs) {
                Ok((idx, _)) => iter.stack.push((idx, 0)),
                Err(_) => iter.failed = true,
            }
        }
        iter
    }
}

/// Depth-first leaf iterator; the stack holds (index node, next branch).
pub struct LeafIter<'t, 'u, 'v> {
    tnc: &'t Tnc<'u, 'v>,
    stack: Vec<(IndexNode, usize)>,
    failed: bool,
}

impl Iterator for LeafIter<'_, '_, '_> {
    type Item = Result<(Branch, ParsedNode)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let (idx, pos) = self.stack.last_mut()?;
            if *pos >= idx.branches.len() {
                self.stack.pop();
                continue;
            }
            let branch = idx.branches[*pos];
            *pos += 1;
            if idx.level == 0 {
                return Some(self.tnc.load(branch.lnum, branch.offs).map(|n| (branch, n)));
            }
            match self.tnc.load_index(branch.lnum, branch.offs) {
                Ok((child, _)) => self.stack.push((child, 0)),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
