//! On-flash UBIFS node structures.
//!
//! Every node starts with a 24-byte common header: magic, a CRC-32 over the
//! rest of the node, a global sequence number, the node length and a type
//! tag. Parsing dispatches on the tag once and hands back a concrete
//! variant; downstream code never re-inspects raw bytes.
//!
//! Layouts follow `ubifs-media.h`; all fields little-endian.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_32_JAMCRC};
use serde::{Deserialize, Serialize};

use super::key::Key;

pub const UBIFS_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

pub const UBIFS_NODE_MAGIC: u32 = 0x0610_1831;
/// The magic as it appears in a byte stream, for signature scans.
pub const UBIFS_NODE_MAGIC_BYTES: [u8; 4] = UBIFS_NODE_MAGIC.to_le_bytes();

pub const COMMON_HEADER_SIZE: usize = 24;
pub const KEY_FIELD_SIZE: usize = 16;
pub const INO_NODE_SIZE: usize = 160;
pub const DATA_NODE_SIZE: usize = 48;
pub const DENT_NODE_SIZE: usize = 56;
pub const TRUN_NODE_SIZE: usize = 56;
pub const PAD_NODE_SIZE: usize = 28;
pub const REF_NODE_SIZE: usize = 64;
pub const CS_NODE_SIZE: usize = 32;
pub const IDX_NODE_HDR_SIZE: usize = 28;
pub const BRANCH_SIZE: usize = 20;
pub const MST_NODE_SIZE: usize = 512;
pub const SB_NODE_SIZE: usize = 4096;

/// Data nodes carry at most one block of uncompressed payload.
pub const UBIFS_BLOCK_SIZE: usize = 4096;

// node_type values of the common header
pub const NODE_INO: u8 = 0;
pub const NODE_DATA: u8 = 1;
pub const NODE_DENT: u8 = 2;
pub const NODE_XENT: u8 = 3;
pub const NODE_TRUN: u8 = 4;
pub const NODE_PAD: u8 = 5;
pub const NODE_SB: u8 = 6;
pub const NODE_MST: u8 = 7;
pub const NODE_REF: u8 = 8;
pub const NODE_IDX: u8 = 9;
pub const NODE_CS: u8 = 10;
pub const NODE_ORPH: u8 = 11;

/// File types recorded in directory entries and inode modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeType {
    Regular,
    Directory,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
}

impl InodeType {
    pub fn from_dent_type(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(InodeType::Regular),
            1 => Some(InodeType::Directory),
            2 => Some(InodeType::Symlink),
            3 => Some(InodeType::BlockDev),
            4 => Some(InodeType::CharDev),
            5 => Some(InodeType::Fifo),
            6 => Some(InodeType::Socket),
            _ => None,
        }
    }

    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => InodeType::Directory,
            0o120000 => InodeType::Symlink,
            0o060000 => InodeType::BlockDev,
            0o020000 => InodeType::CharDev,
            0o010000 => InodeType::Fifo,
            0o140000 => InodeType::Socket,
            _ => InodeType::Regular,
        }
    }

    pub fn short_tag(&self) -> &'static str {
        match self {
            InodeType::Regular => "r",
            InodeType::Directory => "d",
            InodeType::Symlink => "l",
            InodeType::BlockDev => "b",
            InodeType::CharDev => "c",
            InodeType::Fifo => "p",
            InodeType::Socket => "s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lzo,
    Zlib,
    Zstd,
}

impl Compression {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Compression::None),
            1 => Some(Compression::Lzo),
            2 => Some(Compression::Zlib),
            3 => Some(Compression::Zstd),
            _ => None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Lzo => write!(f, "lzo"),
            Compression::Zlib => write!(f, "zlib"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

/// The 24-byte header shared by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub crc: u32,
    pub sqnum: u64,
    pub len: u32,
    pub node_type: u8,
    pub group_type: u8,
}

#[derive(Debug)]
pub enum ParseError {
    BadMagic,
    Truncated,
    BadCrc { expected: u32, actual: u32 },
    BadLength(u32),
    Malformed(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::BadMagic => write!(f, "common header magic mismatch"),
            ParseError::Truncated => write!(f, "node extends past the end of the LEB"),
            ParseError::BadCrc { expected, actual } => {
                write!(f, "CRC mismatch (stored {expected:#010x}, computed {actual:#010x})")
            }
            ParseError::BadLength(len) => write!(f, "implausible node length {len}"),
            ParseError::Malformed(what) => write!(f, "malformed node: {what}"),
        }
    }
}

impl From<std::io::Error> for ParseError {
    fn from(_: std::io::Error) -> Self {
        // Cursor reads only fail by running off the end of the node.
        ParseError::Truncated
    }
}

impl CommonHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < COMMON_HEADER_SIZE {
            return Err(ParseError::Truncated);
        }
        let mut cur = Cursor::new(buf);
        let magic = cur.read_u32::<LittleEndian>()?;
        if magic != UBIFS_NODE_MAGIC {
            return Err(ParseError::BadMagic);
        }
        let crc = cur.read_u32::<LittleEndian>()?;
        let sqnum = cur.read_u64::<LittleEndian>()?;
        let len = cur.read_u32::<LittleEndian>()?;
        let node_type = cur.read_u8()?;
        let group_type = cur.read_u8()?;
        if (len as usize) < COMMON_HEADER_SIZE {
            return Err(ParseError::BadLength(len));
        }
        Ok(CommonHeader {
            crc,
            sqnum,
            len,
            node_type,
            group_type,
        })
    }
}

// ============================================================================
// Node variants
// ============================================================================

#[derive(Debug, Clone)]
pub struct InodeNode {
    pub inum: u32,
    pub creat_sqnum: u64,
    pub size: u64,
    pub atime_sec: u64,
    pub ctime_sec: u64,
    pub mtime_sec: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub flags: u32,
    pub compr_type: Compression,
    /// Inline payload: symlink target or inline file data.
    pub data: Vec<u8>,
}

impl InodeNode {
    pub fn itype(&self) -> InodeType {
        InodeType::from_mode(self.mode)
    }

    pub fn is_unlinked(&self) -> bool {
        self.nlink == 0
    }
}

#[derive(Debug, Clone)]
pub struct DataNode {
    pub key: Key,
    /// Uncompressed length, authoritative.
    pub size: u32,
    pub compr_type: Compression,
    pub data: Vec<u8>,
}

impl DataNode {
    pub fn block(&self) -> u32 {
        self.key.payload
    }
}

#[derive(Debug, Clone)]
pub struct DentNode {
    pub key: Key,
    /// Child inode; 0 marks a deletion tombstone.
    pub inum: u64,
    pub dtype: Option<InodeType>,
    pub name: Vec<u8>,
    /// Extended-attribute entry rather than a directory child.
    pub xattr: bool,
}

impl DentNode {
    pub fn parent(&self) -> u32 {
        self.key.inum
    }

    pub fn is_tombstone(&self) -> bool {
        self.inum == 0
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TruncNode {
    pub inum: u32,
    pub old_size: u64,
    pub new_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PadNode {
    pub pad_len: u32,
}

#[derive(Debug, Clone)]
pub struct SuperblockNode {
    pub key_hash: u8,
    pub key_fmt: u8,
    pub flags: u32,
    pub min_io_size: u32,
    pub leb_size: u32,
    pub leb_cnt: u32,
    pub max_leb_cnt: u32,
    pub log_lebs: u32,
    pub lpt_lebs: u32,
    pub orph_lebs: u32,
    pub jhead_cnt: u32,
    pub fanout: u32,
    pub fmt_version: u32,
    pub default_compr: Compression,
    pub uuid: [u8; 16],
}

impl SuperblockNode {
    /// First LEB of the orphan area: superblock, both master LEBs, the log
    /// and the LPT come first.
    pub fn orphan_area_start(&self) -> u32 {
        3 + self.log_lebs + self.lpt_lebs
    }

    /// First LEB of the main area (index and data).
    pub fn main_area_start(&self) -> u32 {
        self.orphan_area_start() + self.orph_lebs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MasterNode {
    pub highest_inum: u64,
    pub cmt_no: u64,
    pub flags: u32,
    pub log_lnum: u32,
    pub root_lnum: u32,
    pub root_offs: u32,
    pub root_len: u32,
    pub index_size: u64,
    pub total_free: u64,
    pub total_dirty: u64,
    pub total_used: u64,
    pub leb_cnt: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Branch {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub key: Key,
}

#[derive(Debug, Clone)]
pub struct IndexNode {
    pub level: u16,
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, Copy)]
pub struct RefNode {
    pub lnum: u32,
    pub offs: u32,
    pub jhead: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CsNode {
    pub cmt_no: u64,
}

#[derive(Debug, Clone)]
pub struct OrphanNode {
    pub cmt_no: u64,
    pub inums: Vec<u64>,
}

impl OrphanNode {
    /// The top bit of `cmt_no` flags the last orphan node of a commit.
    pub fn is_commit_end(&self) -> bool {
        self.cmt_no >> 63 != 0
    }

    pub fn commit_number(&self) -> u64 {
        self.cmt_no & 0x7FFF_FFFF_FFFF_FFFF
    }
}

/// A parsed node: common header plus the type-specific payload.
#[derive(Debug, Clone)]
pub struct ParsedNode {
    pub header: CommonHeader,
    pub body: NodeBody,
}

#[derive(Debug, Clone)]
pub enum NodeBody {
    Inode(InodeNode),
    Data(DataNode),
    Dent(DentNode),
    Trun(TruncNode),
    Pad(PadNode),
    Superblock(SuperblockNode),
    Master(MasterNode),
    Index(IndexNode),
    Ref(RefNode),
    Cs(CsNode),
    Orphan(OrphanNode),
    /// Recognized header, node type we do not decode (auth, sig, ...).
    Unknown(u8),
}

impl NodeBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeBody::Inode(_) => "inode",
            NodeBody::Data(_) => "data",
            NodeBody::Dent(d) if d.xattr => "xentry",
            NodeBody::Dent(_) => "dentry",
            NodeBody::Trun(_) => "truncation",
            NodeBody::Pad(_) => "pad",
            NodeBody::Superblock(_) => "superblock",
            NodeBody::Master(_) => "master",
            NodeBody::Index(_) => "index",
            NodeBody::Ref(_) => "reference",
            NodeBody::Cs(_) => "commit-start",
            NodeBody::Orphan(_) => "orphan",
            NodeBody::Unknown(_) => "unknown",
        }
    }
}

impl ParsedNode {
    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }

    /// The index key this node lives under, if it has one.
    pub fn key(&self) -> Option<Key> {
        match &self.body {
            NodeBody::Inode(n) => Some(Key::inode(n.inum)),
            NodeBody::Data(n) => Some(n.key),
            NodeBody::Dent(n) => Some(n.key),
            _ => None,
        }
    }
}

/// Parse the node starting at `offset`, verifying magic, length and CRC.
pub fn parse_node(data: &[u8], offset: usize) -> Result<ParsedNode, ParseError> {
    let buf = data.get(offset..).ok_or(ParseError::Truncated)?;
    let header = CommonHeader::parse(buf)?;
    let len = header.len as usize;
    if len > buf.len() {
        return Err(ParseError::Truncated);
    }
    let node = &buf[..len];
    let actual = UBIFS_CRC.checksum(&node[8..]);
    if actual != header.crc {
        return Err(ParseError::BadCrc {
            expected: header.crc,
            actual,
        });
    }
    let body = parse_body(header, node)?;
    Ok(ParsedNode { header, body })
}

fn key_at(node: &[u8], offset: usize) -> Result<Key, ParseError> {
    Key::from_bytes(&node[offset..offset + 8]).ok_or(ParseError::Malformed("bad key"))
}

fn parse_body(header: CommonHeader, node: &[u8]) -> Result<NodeBody, ParseError> {
    let len = node.len();
    match header.node_type {
        NODE_INO => {
            if len < INO_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let key = key_at(node, COMMON_HEADER_SIZE)?;
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE + KEY_FIELD_SIZE..]);
            let creat_sqnum = cur.read_u64::<LittleEndian>()?;
            let size = cur.read_u64::<LittleEndian>()?;
            let atime_sec = cur.read_u64::<LittleEndian>()?;
            let ctime_sec = cur.read_u64::<LittleEndian>()?;
            let mtime_sec = cur.read_u64::<LittleEndian>()?;
            cur.set_position(cur.position() + 12); // nsec triple
            let nlink = cur.read_u32::<LittleEndian>()?;
            let uid = cur.read_u32::<LittleEndian>()?;
            let gid = cur.read_u32::<LittleEndian>()?;
            let mode = cur.read_u32::<LittleEndian>()?;
            let flags = cur.read_u32::<LittleEndian>()?;
            let data_len = cur.read_u32::<LittleEndian>()? as usize;
            cur.set_position(cur.position() + 8 + 4 + 4); // xattr counters, padding1, xattr_names
            let compr_raw = cur.read_u16::<LittleEndian>()?;
            let compr_type =
                Compression::from_raw(compr_raw).ok_or(ParseError::Malformed("compression type"))?;
            if INO_NODE_SIZE + data_len > len {
                return Err(ParseError::Malformed("inline data overruns node"));
            }
            let data = node[INO_NODE_SIZE..INO_NODE_SIZE + data_len].to_vec();
            Ok(NodeBody::Inode(InodeNode {
                inum: key.inum,
                creat_sqnum,
                size,
                atime_sec,
                ctime_sec,
                mtime_sec,
                nlink,
                uid,
                gid,
                mode,
                flags,
                compr_type,
                data,
            }))
        }
        NODE_DATA => {
            if len < DATA_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let key = key_at(node, COMMON_HEADER_SIZE)?;
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE + KEY_FIELD_SIZE..]);
            let size = cur.read_u32::<LittleEndian>()?;
            let compr_raw = cur.read_u16::<LittleEndian>()?;
            let compr_type =
                Compression::from_raw(compr_raw).ok_or(ParseError::Malformed("compression type"))?;
            if size as usize > UBIFS_BLOCK_SIZE {
                return Err(ParseError::Malformed("data node exceeds block size"));
            }
            let data = node[DATA_NODE_SIZE..].to_vec();
            Ok(NodeBody::Data(DataNode {
                key,
                size,
                compr_type,
                data,
            }))
        }
        NODE_DENT | NODE_XENT => {
            if len < DENT_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let key = key_at(node, COMMON_HEADER_SIZE)?;
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE + KEY_FIELD_SIZE..]);
            let inum = cur.read_u64::<LittleEndian>()?;
            let _padding = cur.read_u8()?;
            let dtype = InodeType::from_dent_type(cur.read_u8()?);
            let nlen = cur.read_u16::<LittleEndian>()? as usize;
            if DENT_NODE_SIZE + nlen > len {
                return Err(ParseError::Malformed("entry name overruns node"));
            }
            let name = node[DENT_NODE_SIZE..DENT_NODE_SIZE + nlen].to_vec();
            Ok(NodeBody::Dent(DentNode {
                key,
                inum,
                dtype,
                name,
                xattr: header.node_type == NODE_XENT,
            }))
        }
        NODE_TRUN => {
            if len < TRUN_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE..]);
            let inum = cur.read_u32::<LittleEndian>()?;
            cur.set_position(cur.position() + 12);
            let old_size = cur.read_u64::<LittleEndian>()?;
            let new_size = cur.read_u64::<LittleEndian>()?;
            Ok(NodeBody::Trun(TruncNode {
                inum,
                old_size,
                new_size,
            }))
        }
        NODE_PAD => {
            if len < PAD_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let pad_len = u32::from_le_bytes(node[COMMON_HEADER_SIZE..PAD_NODE_SIZE].try_into().unwrap());
            Ok(NodeBody::Pad(PadNode { pad_len }))
        }
        NODE_SB => {
            if len < 128 {
                return Err(ParseError::BadLength(header.len));
            }
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE..]);
            cur.set_position(2); // padding
            let key_hash = cur.read_u8()?;
            let key_fmt = cur.read_u8()?;
            let flags = cur.read_u32::<LittleEndian>()?;
            let min_io_size = cur.read_u32::<LittleEndian>()?;
            let leb_size = cur.read_u32::<LittleEndian>()?;
            let leb_cnt = cur.read_u32::<LittleEndian>()?;
            let max_leb_cnt = cur.read_u32::<LittleEndian>()?;
            let _max_bud_bytes = cur.read_u64::<LittleEndian>()?;
            let log_lebs = cur.read_u32::<LittleEndian>()?;
            let lpt_lebs = cur.read_u32::<LittleEndian>()?;
            let orph_lebs = cur.read_u32::<LittleEndian>()?;
            let jhead_cnt = cur.read_u32::<LittleEndian>()?;
            let fanout = cur.read_u32::<LittleEndian>()?;
            let _lsave_cnt = cur.read_u32::<LittleEndian>()?;
            let fmt_version = cur.read_u32::<LittleEndian>()?;
            let compr_raw = cur.read_u16::<LittleEndian>()?;
            let default_compr =
                Compression::from_raw(compr_raw).ok_or(ParseError::Malformed("compression type"))?;
            cur.set_position(cur.position() + 2 + 4 + 4 + 8 + 4); // padding, rp fields, time_gran
            let mut uuid = [0u8; 16];
            let uuid_off = COMMON_HEADER_SIZE + cur.position() as usize;
            uuid.copy_from_slice(&node[uuid_off..uuid_off + 16]);
            Ok(NodeBody::Superblock(SuperblockNode {
                key_hash,
                key_fmt,
                flags,
                min_io_size,
                leb_size,
                leb_cnt,
                max_leb_cnt,
                log_lebs,
                lpt_lebs,
                orph_lebs,
                jhead_cnt,
                fanout,
                fmt_version,
                default_compr,
                uuid,
            }))
        }
        NODE_MST => {
            if len < 168 {
                return Err(ParseError::BadLength(header.len));
            }
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE..]);
            let highest_inum = cur.read_u64::<LittleEndian>()?;
            let cmt_no = cur.read_u64::<LittleEndian>()?;
            let flags = cur.read_u32::<LittleEndian>()?;
            let log_lnum = cur.read_u32::<LittleEndian>()?;
            let root_lnum = cur.read_u32::<LittleEndian>()?;
            let root_offs = cur.read_u32::<LittleEndian>()?;
            let root_len = cur.read_u32::<LittleEndian>()?;
            let _gc_lnum = cur.read_u32::<LittleEndian>()?;
            let _ihead_lnum = cur.read_u32::<LittleEndian>()?;
            let _ihead_offs = cur.read_u32::<LittleEndian>()?;
            let index_size = cur.read_u64::<LittleEndian>()?;
            let total_free = cur.read_u64::<LittleEndian>()?;
            let total_dirty = cur.read_u64::<LittleEndian>()?;
            let total_used = cur.read_u64::<LittleEndian>()?;
            let _total_dead = cur.read_u64::<LittleEndian>()?;
            let _total_dark = cur.read_u64::<LittleEndian>()?;
            // lpt, nhead, ltab and lsave lnum/offs pairs, lscan_lnum,
            // empty_lebs, idx_lebs
            cur.set_position(cur.position() + 11 * 4);
            let leb_cnt = cur.read_u32::<LittleEndian>()?;
            Ok(NodeBody::Master(MasterNode {
                highest_inum,
                cmt_no,
                flags,
                log_lnum,
                root_lnum,
                root_offs,
                root_len,
                index_size,
                total_free,
                total_dirty,
                total_used,
                leb_cnt,
            }))
        }
        NODE_IDX => {
            if len < IDX_NODE_HDR_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE..]);
            let child_cnt = cur.read_u16::<LittleEndian>()? as usize;
            let level = cur.read_u16::<LittleEndian>()?;
            if IDX_NODE_HDR_SIZE + child_cnt * BRANCH_SIZE > len {
                return Err(ParseError::Malformed("branch array overruns node"));
            }
            let mut branches = Vec::with_capacity(child_cnt);
            for i in 0..child_cnt {
                let off = IDX_NODE_HDR_SIZE + i * BRANCH_SIZE;
                let mut bcur = Cursor::new(&node[off..off + BRANCH_SIZE]);
                let lnum = bcur.read_u32::<LittleEndian>()?;
                let offs = bcur.read_u32::<LittleEndian>()?;
                let blen = bcur.read_u32::<LittleEndian>()?;
                let key = key_at(node, off + 12)?;
                branches.push(Branch {
                    lnum,
                    offs,
                    len: blen,
                    key,
                });
            }
            Ok(NodeBody::Index(IndexNode { level, branches }))
        }
        NODE_REF => {
            if len < REF_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let mut cur = Cursor::new(&node[COMMON_HEADER_SIZE..]);
            let lnum = cur.read_u32::<LittleEndian>()?;
            let offs = cur.read_u32::<LittleEndian>()?;
            let jhead = cur.read_u32::<LittleEndian>()?;
            Ok(NodeBody::Ref(RefNode { lnum, offs, jhead }))
        }
        NODE_CS => {
            if len < CS_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let cmt_no = u64::from_le_bytes(node[COMMON_HEADER_SIZE..CS_NODE_SIZE].try_into().unwrap());
            Ok(NodeBody::Cs(CsNode { cmt_no }))
        }
        NODE_ORPH => {
            if len < CS_NODE_SIZE {
                return Err(ParseError::BadLength(header.len));
            }
            let cmt_no =
                u64::from_le_bytes(node[COMMON_HEADER_SIZE..COMMON_HEADER_SIZE + 8].try_into().unwrap());
            let count = (len - COMMON_HEADER_SIZE - 8) / 8;
            let mut inums = Vec::with_capacity(count);
            for i in 0..count {
                let off = COMMON_HEADER_SIZE + 8 + i * 8;
                inums.push(u64::from_le_bytes(node[off..off + 8].try_into().unwrap()));
            }
            if inums == [0] {
                inums.clear();
            }
            Ok(NodeBody::Orphan(OrphanNode { cmt_no, inums }))
        }
        other => Ok(NodeBody::Unknown(other)),
    }
}

/// Journal and log nodes are written back to back at 8-byte alignment.
pub fn align_node_len(len: u32) -> usize {
    ((len as usize) + 7) & !7
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Byte-level encoders mirroring `parse_body`, for unit tests.

    use super::*;

    pub fn finish(node_type: u8, sqnum: u64, mut body: Vec<u8>) -> Vec<u8> {
        let len = COMMON_HEADER_SIZE + body.len();
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&UBIFS_NODE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]); // crc placeholder
        buf.extend_from_slice(&sqnum.to_le_bytes());
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.push(node_type);
        buf.push(0);
        buf.extend_from_slice(&[0u8; 2]);
        buf.append(&mut body);
        let crc = UBIFS_CRC.checksum(&buf[8..]);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn encode_data_node(key: Key, size: u32, compr: u16, payload: &[u8], sqnum: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&key.to_bytes());
        body.extend_from_slice(&[0u8; 8]); // key field padding
        body.extend_from_slice(&size.to_le_bytes());
        body.extend_from_slice(&compr.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(payload);
        finish(NODE_DATA, sqnum, body)
    }

    pub fn encode_dent_node(key: Key, inum: u64, dtype: u8, name: &[u8], sqnum: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&key.to_bytes());
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&inum.to_le_bytes());
        body.push(0);
        body.push(dtype);
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // cookie
        body.extend_from_slice(name);
        body.push(0); // trailing NUL
        finish(NODE_DENT, sqnum, body)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::ubifs::key::KeyKind;

    #[test]
    fn data_node_roundtrip() {
        let key = Key::data(7, 2);
        let buf = encode_data_node(key, 5, 0, b"hello", 99);
        let parsed = parse_node(&buf, 0).unwrap();
        assert_eq!(parsed.header.sqnum, 99);
        match parsed.body {
            NodeBody::Data(d) => {
                assert_eq!(d.key, key);
                assert_eq!(d.block(), 2);
                assert_eq!(d.size, 5);
                assert_eq!(d.data, b"hello");
                assert_eq!(d.compr_type, Compression::None);
            }
            other => panic!("expected data node, got {other:?}"),
        }
    }

    #[test]
    fn dent_node_roundtrip() {
        let key = Key::dentry(1, b"a.txt");
        let buf = encode_dent_node(key, 2, 0, b"a.txt", 5);
        let parsed = parse_node(&buf, 0).unwrap();
        match parsed.body {
            NodeBody::Dent(d) => {
                assert_eq!(d.parent(), 1);
                assert_eq!(d.inum, 2);
                assert_eq!(d.name, b"a.txt");
                assert_eq!(d.dtype, Some(InodeType::Regular));
                assert_eq!(d.key.kind, KeyKind::Dentry);
                assert!(!d.is_tombstone());
            }
            other => panic!("expected dentry node, got {other:?}"),
        }
    }

    #[test]
    fn tombstone_detected() {
        let key = Key::dentry(1, b"gone.txt");
        let buf = encode_dent_node(key, 0, 0, b"gone.txt", 500);
        match parse_node(&buf, 0).unwrap().body {
            NodeBody::Dent(d) => assert!(d.is_tombstone()),
            other => panic!("expected dentry node, got {other:?}"),
        }
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let mut buf = encode_data_node(Key::data(7, 0), 5, 0, b"hello", 1);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            parse_node(&buf, 0),
            Err(ParseError::BadCrc { .. })
        ));
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let mut buf = encode_data_node(Key::data(7, 0), 5, 0, b"hello", 1);
        buf[0] ^= 0xFF;
        assert!(matches!(parse_node(&buf, 0), Err(ParseError::BadMagic)));
    }

    #[test]
    fn truncated_node_is_rejected() {
        let buf = encode_data_node(Key::data(7, 0), 5, 0, b"hello", 1);
        assert!(matches!(
            parse_node(&buf[..buf.len() - 3], 0),
            Err(ParseError::Truncated)
        ));
    }

    #[test]
    fn alignment_rounds_to_eight() {
        assert_eq!(align_node_len(24), 24);
        assert_eq!(align_node_len(25), 32);
        assert_eq!(align_node_len(56), 56);
        assert_eq!(align_node_len(61), 64);
    }
}
