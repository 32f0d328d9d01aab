//! End-to-end tests over synthesized flash images.
//!
//! The builder below assembles a complete dump from the bottom up: UBIFS
//! nodes into LEBs, LEBs into PEBs with EC/VID headers, PEBs into an image.
//! Everything goes through the public API afterwards, the same way the CLI
//! consumes it.

use std::borrow::Cow;

use ubift_core::recovery::{extract, RecoveryEngine, RecoverySource};
use ubift_core::ubi::headers::{
    UBI_CRC, UBI_EC_MAGIC, UBI_LAYOUT_VOLUME_ID, UBI_VID_MAGIC, VTBL_RECORD_SIZE,
};
use ubift_core::ubifs::key::{r5_hash, Key, KeyKind};
use ubift_core::ubifs::node::{
    align_node_len, InodeType, COMMON_HEADER_SIZE, NODE_CS, NODE_DATA, NODE_DENT, NODE_INO,
    NODE_MST, NODE_ORPH, NODE_REF, NODE_SB, NODE_TRUN, NODE_XENT, UBIFS_CRC, UBIFS_NODE_MAGIC,
};
use ubift_core::ubifs::{MountOptions, UbifsInstance};
use ubift_core::{scan_partitions, CancelToken, Image, UbiInstance};

const PEB_SIZE: usize = 1 << 16;
const VID_OFF: u32 = 64;
const DATA_OFF: u32 = 128;
const LEB_SIZE: usize = PEB_SIZE - DATA_OFF as usize;
const VOL_DATA: u32 = 0;

// ---------------------------------------------------------------------------
// On-flash encoders (kept in lockstep with the parsers by the tests below)
// ---------------------------------------------------------------------------

fn ec_header(ec: u64) -> [u8; 64] {
    let mut buf = [0u8; 64];
    buf[..4].copy_from_slice(UBI_EC_MAGIC);
    buf[4] = 1;
    buf[8..16].copy_from_slice(&ec.to_be_bytes());
    buf[16..20].copy_from_slice(&VID_OFF.to_be_bytes());
    buf[20..24].copy_from_slice(&DATA_OFF.to_be_bytes());
    let crc = UBI_CRC.checksum(&buf[..60]);
    buf[60..64].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn vid_header(vol_id: u32, lnum: u32, sqnum: u64) -> [u8; 64] {
    let mut buf = [0u8; 64];
    buf[..4].copy_from_slice(UBI_VID_MAGIC);
    buf[4] = 1;
    buf[5] = 1; // dynamic
    buf[8..12].copy_from_slice(&vol_id.to_be_bytes());
    buf[12..16].copy_from_slice(&lnum.to_be_bytes());
    buf[40..48].copy_from_slice(&sqnum.to_be_bytes());
    let crc = UBI_CRC.checksum(&buf[..60]);
    buf[60..64].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn vtbl_leb(volumes: &[(u32, &str, u32)]) -> Vec<u8> {
    let mut leb = vec![0u8; LEB_SIZE];
    for slot in 0..128 {
        let base = slot * VTBL_RECORD_SIZE;
        if let Some((_, name, reserved)) = volumes.iter().find(|(id, _, _)| *id == slot as u32) {
            leb[base..base + 4].copy_from_slice(&reserved.to_be_bytes());
            leb[base + 4..base + 8].copy_from_slice(&1u32.to_be_bytes()); // alignment
            leb[base + 12] = 1; // dynamic
            leb[base + 14..base + 16].copy_from_slice(&(name.len() as u16).to_be_bytes());
            leb[base + 16..base + 16 + name.len()].copy_from_slice(name.as_bytes());
        }
        let crc = UBI_CRC.checksum(&leb[base..base + 168]);
        leb[base + 168..base + 172].copy_from_slice(&crc.to_be_bytes());
    }
    leb
}

fn node(node_type: u8, sqnum: u64, body: &[u8]) -> Vec<u8> {
    let len = COMMON_HEADER_SIZE + body.len();
    let mut buf = Vec::with_capacity(len);
    buf.extend_from_slice(&UBIFS_NODE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&sqnum.to_le_bytes());
    buf.extend_from_slice(&(len as u32).to_le_bytes());
    buf.push(node_type);
    buf.push(0);
    buf.extend_from_slice(&[0u8; 2]);
    buf.extend_from_slice(body);
    let crc = UBIFS_CRC.checksum(&buf[8..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

struct InoSpec {
    inum: u32,
    size: u64,
    nlink: u32,
    mode: u32,
    sqnum: u64,
}

fn ino_node(spec: &InoSpec) -> (Key, Vec<u8>) {
    let key = Key::inode(spec.inum);
    let mut body = vec![0u8; 136];
    body[0..8].copy_from_slice(&key.to_bytes());
    body[24..32].copy_from_slice(&spec.size.to_le_bytes());
    body[48..56].copy_from_slice(&1_700_000_000u64.to_le_bytes()); // mtime
    body[68..72].copy_from_slice(&spec.nlink.to_le_bytes());
    body[72..76].copy_from_slice(&1000u32.to_le_bytes()); // uid
    body[76..80].copy_from_slice(&1000u32.to_le_bytes()); // gid
    body[80..84].copy_from_slice(&spec.mode.to_le_bytes());
    (key, node(NODE_INO, spec.sqnum, &body))
}

fn file_ino(inum: u32, size: u64, sqnum: u64) -> (Key, Vec<u8>) {
    ino_node(&InoSpec {
        inum,
        size,
        nlink: 1,
        mode: 0o100644,
        sqnum,
    })
}

fn dir_ino(inum: u32, sqnum: u64) -> (Key, Vec<u8>) {
    ino_node(&InoSpec {
        inum,
        size: 4096,
        nlink: 2,
        mode: 0o040755,
        sqnum,
    })
}

fn dent_node(parent: u32, name: &[u8], child: u64, dtype: u8, sqnum: u64) -> (Key, Vec<u8>) {
    let key = Key::dentry(parent, name);
    let mut body = Vec::new();
    body.extend_from_slice(&key.to_bytes());
    body.extend_from_slice(&child.to_le_bytes());
    body.push(0);
    body.push(dtype);
    body.extend_from_slice(&(name.len() as u16).to_le_bytes());
    body.extend_from_slice(&[0u8; 4]); // cookie
    body.extend_from_slice(name);
    body.push(0);
    (key, node(NODE_DENT, sqnum, &body))
}

fn xent_node(host: u32, name: &[u8], xattr_inum: u64, sqnum: u64) -> (Key, Vec<u8>) {
    let key = Key::new(host, KeyKind::Xattr, r5_hash(name));
    let mut body = Vec::new();
    body.extend_from_slice(&key.to_bytes());
    body.extend_from_slice(&xattr_inum.to_le_bytes());
    body.push(0);
    body.push(0); // regular
    body.extend_from_slice(&(name.len() as u16).to_le_bytes());
    body.extend_from_slice(&[0u8; 4]); // cookie
    body.extend_from_slice(name);
    body.push(0);
    (key, node(NODE_XENT, sqnum, &body))
}

fn data_node(inum: u32, block: u32, payload: &[u8], sqnum: u64) -> (Key, Vec<u8>) {
    let key = Key::data(inum, block);
    let mut body = Vec::new();
    body.extend_from_slice(&key.to_bytes());
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    body.extend_from_slice(&[0u8; 4]); // compr_type none, compr_size
    body.extend_from_slice(payload);
    (key, node(NODE_DATA, sqnum, &body))
}

fn trun_node(inum: u32, old_size: u64, new_size: u64, sqnum: u64) -> Vec<u8> {
    let mut body = vec![0u8; 32];
    body[0..4].copy_from_slice(&inum.to_le_bytes());
    body[16..24].copy_from_slice(&old_size.to_le_bytes());
    body[24..32].copy_from_slice(&new_size.to_le_bytes());
    node(NODE_TRUN, sqnum, &body)
}

fn sb_node(leb_cnt: u32) -> Vec<u8> {
    let mut body = vec![0u8; 4096 - COMMON_HEADER_SIZE];
    body[8..12].copy_from_slice(&8u32.to_le_bytes()); // min_io_size
    body[12..16].copy_from_slice(&(LEB_SIZE as u32).to_le_bytes());
    body[16..20].copy_from_slice(&leb_cnt.to_le_bytes());
    body[20..24].copy_from_slice(&leb_cnt.to_le_bytes()); // max_leb_cnt
    body[32..36].copy_from_slice(&1u32.to_le_bytes()); // log_lebs
    body[36..40].copy_from_slice(&1u32.to_le_bytes()); // lpt_lebs
    body[40..44].copy_from_slice(&1u32.to_le_bytes()); // orph_lebs
    body[44..48].copy_from_slice(&1u32.to_le_bytes()); // jhead_cnt
    body[48..52].copy_from_slice(&8u32.to_le_bytes()); // fanout
    body[56..60].copy_from_slice(&5u32.to_le_bytes()); // fmt_version
    node(NODE_SB, 1, &body)
}

fn mst_node(cmt_no: u64, root: (u32, u32, u32), sqnum: u64) -> Vec<u8> {
    let mut body = vec![0u8; 512 - COMMON_HEADER_SIZE];
    body[0..8].copy_from_slice(&1000u64.to_le_bytes()); // highest_inum
    body[8..16].copy_from_slice(&cmt_no.to_le_bytes());
    body[20..24].copy_from_slice(&3u32.to_le_bytes()); // log_lnum
    body[24..28].copy_from_slice(&root.0.to_le_bytes());
    body[28..32].copy_from_slice(&root.1.to_le_bytes());
    body[32..36].copy_from_slice(&root.2.to_le_bytes());
    node(NODE_MST, sqnum, &body)
}

fn cs_node(cmt_no: u64, sqnum: u64) -> Vec<u8> {
    node(NODE_CS, sqnum, &cmt_no.to_le_bytes())
}

fn ref_node(lnum: u32, offs: u32, sqnum: u64) -> Vec<u8> {
    let mut body = vec![0u8; 40];
    body[0..4].copy_from_slice(&lnum.to_le_bytes());
    body[4..8].copy_from_slice(&offs.to_le_bytes());
    body[8..12].copy_from_slice(&1u32.to_le_bytes()); // base head
    node(NODE_REF, sqnum, &body)
}

fn orph_node(cmt_no: u64, inos: &[u64], sqnum: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&cmt_no.to_le_bytes());
    for ino in inos {
        body.extend_from_slice(&ino.to_le_bytes());
    }
    node(NODE_ORPH, sqnum, &body)
}

/// Pack nodes back to back at 8-byte alignment into an erased LEB.
fn pack_leb(nodes: &[Vec<u8>]) -> (Vec<u8>, Vec<u32>) {
    let mut leb = vec![0xFFu8; LEB_SIZE];
    let mut offsets = Vec::new();
    let mut offs = 0usize;
    for n in nodes {
        leb[offs..offs + n.len()].copy_from_slice(n);
        offsets.push(offs as u32);
        offs += align_node_len(n.len() as u32);
    }
    (leb, offsets)
}

// ---------------------------------------------------------------------------
// Image assembly
// ---------------------------------------------------------------------------

struct PebSpec {
    vol_id: u32,
    lnum: u32,
    sqnum: u64,
    data: Vec<u8>,
    corrupt_vid: bool,
}

fn assemble(pebs: &[PebSpec]) -> Image {
    let mut image = vec![0xFFu8; pebs.len() * PEB_SIZE];
    for (i, spec) in pebs.iter().enumerate() {
        let base = i * PEB_SIZE;
        image[base..base + 64].copy_from_slice(&ec_header(1));
        let mut vid = vid_header(spec.vol_id, spec.lnum, spec.sqnum);
        if spec.corrupt_vid {
            vid[60] ^= 0xFF;
        }
        image[base + VID_OFF as usize..base + VID_OFF as usize + 64].copy_from_slice(&vid);
        assert!(spec.data.len() <= LEB_SIZE);
        image[base + DATA_OFF as usize..base + DATA_OFF as usize + spec.data.len()]
            .copy_from_slice(&spec.data);
    }
    Image::from_bytes(image)
}

/// A fixture file system: root (inode 1) holding `a.txt` (inode 2, "hello"),
/// `b/` (inode 3) holding `c.txt` (inode 4, 4096 x 0xAB), and `holey`
/// (inode 50, 8 KiB with only the second block written). One unmapped LEB at
/// the end of the volume.
#[derive(Default)]
struct Fixture {
    /// Journal bud content, referenced from the log when non-empty.
    bud: Vec<Vec<u8>>,
    /// Appended after the regular PEBs, e.g. stale copies.
    extra_pebs: Vec<PebSpec>,
    /// Content of the orphan-area LEB.
    orphan_nodes: Vec<Vec<u8>>,
    /// Additional indexed leaves beyond the base tree.
    extra_leaves: Vec<(Key, Vec<u8>)>,
    /// Erase the first master LEB to force fallback to the second copy.
    corrupt_master_1: bool,
}

impl Fixture {
    fn build(self) -> Image {
        let mut seq = 10u64;
        let mut next = || {
            seq += 1;
            seq
        };

        let mut leaves: Vec<(Key, Vec<u8>)> = vec![
            dir_ino(1, next()),
            file_ino(2, 5, next()),
            dir_ino(3, next()),
            file_ino(4, 4096, next()),
            file_ino(50, 8192, next()),
            dent_node(1, b"a.txt", 2, 0, next()),
            dent_node(1, b"b", 3, 1, next()),
            dent_node(1, b"holey", 50, 0, next()),
            dent_node(3, b"c.txt", 4, 0, next()),
            data_node(2, 0, b"hello", next()),
            data_node(4, 0, &[0xAB; 4096], next()),
            data_node(50, 1, &[0x33; 4096], next()),
        ];
        leaves.extend(self.extra_leaves);
        leaves.sort_by_key(|(key, _)| *key);

        // Main area: index at LEB 6, leaves at LEB 7.
        let (leaf_leb, leaf_offsets) = pack_leb(
            &leaves.iter().map(|(_, bytes)| bytes.clone()).collect::<Vec<_>>(),
        );
        let mut idx_body = Vec::new();
        idx_body.extend_from_slice(&(leaves.len() as u16).to_le_bytes());
        idx_body.extend_from_slice(&0u16.to_le_bytes()); // level
        for ((key, bytes), offs) in leaves.iter().zip(&leaf_offsets) {
            idx_body.extend_from_slice(&7u32.to_le_bytes());
            idx_body.extend_from_slice(&offs.to_le_bytes());
            idx_body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            idx_body.extend_from_slice(&key.to_bytes());
        }
        let idx = node(ubift_core::ubifs::node::NODE_IDX, 2, &idx_body);
        let root = (6u32, 0u32, idx.len() as u32);

        let leb_cnt = 10u32; // LEB 9 stays unmapped
        let master = mst_node(1, root, 100);
        let mut log_nodes = vec![cs_node(1, 3)];
        if !self.bud.is_empty() {
            log_nodes.push(ref_node(8, 0, 4));
        }
        let (log_leb, _) = pack_leb(&log_nodes);
        let (idx_leb, _) = pack_leb(&[idx]);
        let (bud_leb, _) = pack_leb(&self.bud);
        let (orph_leb, _) = pack_leb(&self.orphan_nodes);

        let mut pebs = vec![
            PebSpec {
                vol_id: UBI_LAYOUT_VOLUME_ID,
                lnum: 0,
                sqnum: 1,
                data: vtbl_leb(&[(VOL_DATA, "data", leb_cnt)]),
                corrupt_vid: false,
            },
            PebSpec {
                vol_id: UBI_LAYOUT_VOLUME_ID,
                lnum: 1,
                sqnum: 2,
                data: vtbl_leb(&[(VOL_DATA, "data", leb_cnt)]),
                corrupt_vid: false,
            },
        ];
        let mut sb_leb = vec![0xFFu8; LEB_SIZE];
        let sb = sb_node(leb_cnt);
        sb_leb[..sb.len()].copy_from_slice(&sb);

        let master_1 = if self.corrupt_master_1 {
            vec![0xFFu8; LEB_SIZE]
        } else {
            pack_leb(&[master.clone()]).0
        };
        let volume_lebs: Vec<(u32, Vec<u8>)> = vec![
            (0, sb_leb),
            (1, master_1),
            (2, pack_leb(&[master]).0),
            (3, log_leb),
            (5, orph_leb),
            (6, idx_leb),
            (7, leaf_leb),
            (8, bud_leb),
        ];
        for (lnum, data) in volume_lebs {
            pebs.push(PebSpec {
                vol_id: VOL_DATA,
                lnum,
                sqnum: 1000 + u64::from(lnum),
                data,
                corrupt_vid: false,
            });
        }
        pebs.extend(self.extra_pebs);
        assemble(&pebs)
    }
}

fn attach(image: &Image) -> UbiInstance<'_> {
    let parts = scan_partitions(image, None);
    let part = parts.iter().find(|p| p.is_ubi()).expect("UBI partition");
    UbiInstance::attach(image, part, None).unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn partition_scan_finds_one_ubi_run() {
    let image = Fixture::default().build();
    let parts = scan_partitions(&image, None);
    assert_eq!(parts.len(), 1);
    assert!(parts[0].is_ubi());
    assert_eq!(parts[0].peb_size, Some(PEB_SIZE as u64));
    assert_eq!(parts[0].len, image.len());
}

#[test]
fn mtdcat_concatenation_reproduces_the_image() {
    let image = Fixture::default().build();
    let parts = scan_partitions(&image, None);
    let mut rebuilt = Vec::new();
    for p in &parts {
        rebuilt.extend_from_slice(image.slice(p.offset, p.len).unwrap());
    }
    assert_eq!(rebuilt.len() as u64, image.len());
    assert_eq!(rebuilt, image.data());
}

#[test]
fn volume_table_and_leb_map() {
    let image = Fixture::default().build();
    let ubi = attach(&image);
    let volumes = ubi.volumes();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].name, "data");
    assert_eq!(volumes[0].leb_count, 10);
    assert!(!volumes[0].orphan);

    let vol = ubi.volume_by_name("data").unwrap();
    assert!(vol.is_mapped(0));
    assert!(vol.is_mapped(7));
    assert!(!vol.is_mapped(9));
    assert_eq!(vol.leb_size(), LEB_SIZE as u64);
}

#[test]
fn unmapped_leb_reads_as_erased_flash() {
    let image = Fixture::default().build();
    let ubi = attach(&image);
    let vol = ubi.volume_by_name("data").unwrap();
    let leb = vol.leb(9);
    assert_eq!(leb.len(), LEB_SIZE);
    assert!(leb.iter().all(|b| *b == 0xFF));
}

#[test]
fn ubicat_equals_lebcat_concatenation() {
    let image = Fixture::default().build();
    let ubi = attach(&image);
    let vol = ubi.volume_by_name("data").unwrap();
    let whole = vol.read_all();
    let mut pieces = Vec::new();
    for lnum in 0..vol.leb_count() {
        match vol.leb(lnum) {
            Cow::Borrowed(s) => pieces.extend_from_slice(s),
            Cow::Owned(v) => pieces.extend_from_slice(&v),
        }
    }
    assert_eq!(whole, pieces);
    assert_eq!(whole.len(), 10 * LEB_SIZE);
}

#[test]
fn live_tree_lists_and_reads() {
    let image = Fixture::default().build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();

    let root = fs.list_dir(1).unwrap();
    let names: Vec<String> = root.iter().map(|e| e.dent.name_lossy()).collect();
    assert_eq!(names, ["a.txt", "b", "holey"]);

    let b = fs.list_dir(3).unwrap();
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].dent.name_lossy(), "c.txt");
    assert_eq!(b[0].dent.inum, 4);
    assert_eq!(b[0].dent.dtype, Some(InodeType::Regular));

    assert_eq!(fs.read_inode(2).unwrap(), b"hello");
    assert_eq!(fs.read_inode(4).unwrap(), vec![0xAB; 4096]);

    let stat = fs.stat_inode(2).unwrap();
    assert_eq!(stat.node.size, 5);
    assert_eq!(stat.node.nlink, 1);
    assert_eq!(fs.read_inode(2).unwrap().len() as u64, stat.node.size);

    assert_eq!(fs.list_inodes().unwrap(), vec![1, 2, 3, 4, 50]);
}

#[test]
fn data_holes_read_as_zeroes() {
    let image = Fixture::default().build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    let content = fs.read_inode(50).unwrap();
    assert_eq!(content.len(), 8192);
    assert!(content[..4096].iter().all(|b| *b == 0));
    assert!(content[4096..].iter().all(|b| *b == 0x33));
}

#[test]
fn ffind_locates_parents() {
    let image = Fixture::default().build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    let hits = fs.find_dentries_for(4).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].dent.parent(), 3);
    assert_eq!(hits[0].dent.name_lossy(), "c.txt");
    assert_eq!(fs.path_of(&hits[0].dent), "b/c.txt");
}

#[test]
fn xattr_entries_are_separate_from_children() {
    let fixture = Fixture {
        extra_leaves: vec![xent_node(2, b"user.origin", 200, 330)],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();

    let xattrs = fs.list_xattr_entries(2).unwrap();
    assert_eq!(xattrs.len(), 1);
    assert_eq!(xattrs[0].dent.name_lossy(), "user.origin");
    assert!(xattrs[0].dent.xattr);
    assert_eq!(xattrs[0].dent.inum, 200);

    // The xattr entry is not a directory child of its host.
    assert!(fs.list_dir(2).unwrap().is_empty());
}

#[test]
fn journal_replay_surfaces_uncommitted_writes() {
    let mut seq = 490u64;
    let mut next = || {
        seq += 1;
        seq
    };
    let fixture = Fixture {
        bud: vec![
            file_ino(99, 3, next()).1,
            dent_node(1, b"new.txt", 99, 0, next()).1,
            data_node(99, 0, b"new", next()).1,
        ],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);

    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    assert_eq!(fs.journal().refs.len(), 1);
    assert_eq!(fs.stat_inode(99).unwrap().node.size, 3);
    assert_eq!(fs.read_inode(99).unwrap(), b"new");
    let names: Vec<String> = fs
        .list_dir(1)
        .unwrap()
        .iter()
        .map(|e| e.dent.name_lossy())
        .collect();
    assert!(names.contains(&"new.txt".to_string()));

    // Committed state only: the inode does not exist before replay.
    let fs_committed = UbifsInstance::mount_with(
        ubi.volume_by_name("data").unwrap(),
        MountOptions {
            replay_journal: false,
        },
    )
    .unwrap();
    assert!(fs_committed.stat_inode(99).is_err());
}

#[test]
fn tombstone_hides_live_entry_and_feeds_deleted_view() {
    // a.txt is unlinked: the journal carries the nlink=0 inode rewrite and
    // the dentry tombstone.
    let fixture = Fixture {
        bud: vec![
            ino_node(&InoSpec {
                inum: 2,
                size: 5,
                nlink: 0,
                mode: 0o100644,
                sqnum: 498,
            })
            .1,
            dent_node(1, b"a.txt", 0, 0, 499).1,
        ],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();

    // Live view: the tombstone shadows the committed dentry.
    let names: Vec<String> = fs
        .list_dir(1)
        .unwrap()
        .iter()
        .map(|e| e.dent.name_lossy())
        .collect();
    assert_eq!(names, ["b", "holey"]);

    // Deleted view: the name and content are recoverable.
    let cancel = CancelToken::new();
    let engine = RecoveryEngine::scan(&fs, &cancel);
    let tombs = engine.tombstoned_names();
    assert_eq!(tombs.len(), 1);
    assert_eq!(tombs[0].name, "a.txt");
    assert_eq!(tombs[0].former_inum, 2);
    assert_eq!(tombs[0].parent, 1);
    assert_eq!(tombs[0].tombstone_sqnum, 499);

    let recovered = engine.recovered_files().unwrap();
    let a = recovered.iter().find(|f| f.inum == 2).expect("inode 2 recovered");
    assert_eq!(a.name.as_deref(), Some("a.txt"));
    assert_eq!(a.size, 5);
    assert!(a.is_recoverable());
    let (content, partial) = engine.read_recovered(a);
    assert_eq!(content, b"hello");
    assert_eq!(partial, 0);
}

#[test]
fn conflicting_pebs_resolved_by_sequence_number() {
    // A stale copy of leaf LEB 7 with an older data node for inode 2.
    let (_, old_leaf) = data_node(2, 0, b"OLD..", 5);
    let fixture = Fixture {
        extra_pebs: vec![PebSpec {
            vol_id: VOL_DATA,
            lnum: 7,
            sqnum: 500, // live copy carries 1007
            data: pack_leb(&[old_leaf]).0,
            corrupt_vid: false,
        }],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    assert_eq!(ubi.diagnostics().stale_pebs, 1);

    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    // The live map kept the fresher copy.
    assert_eq!(fs.read_inode(2).unwrap(), b"hello");

    let cancel = CancelToken::new();
    let engine = RecoveryEngine::scan(&fs, &cancel);
    assert_eq!(engine.outcome().scanned_stale_pebs, 1);
    let report = engine.report().unwrap();
    assert_eq!(report.stale_pebs, 1);
}

#[test]
fn corrupt_vid_header_disqualifies_peb_from_live_map() {
    let fixture = Fixture {
        extra_pebs: vec![PebSpec {
            vol_id: VOL_DATA,
            lnum: 7,
            sqnum: 9999, // would win, but the header CRC is broken
            data: vec![0xFF; 16],
            corrupt_vid: true,
        }],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    assert_eq!(ubi.diagnostics().corrupt_vid_headers, 1);

    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    assert_eq!(fs.read_inode(2).unwrap(), b"hello");
}

#[test]
fn master_fallback_to_second_copy() {
    let fixture = Fixture {
        corrupt_master_1: true,
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    assert_eq!(fs.diagnostics().corrupt_master_copies, 1);
    assert_eq!(fs.master().cmt_no, 1);
    assert_eq!(fs.read_inode(2).unwrap(), b"hello");
}

#[test]
fn truncation_clamps_live_view_but_not_recovery() {
    let fixture = Fixture {
        extra_leaves: vec![
            file_ino(42, 8192, 300),
            dent_node(1, b"t.bin", 42, 0, 301),
            data_node(42, 0, &[0x11; 4096], 302),
            data_node(42, 1, &[0x22; 4096], 303),
        ],
        bud: vec![trun_node(42, 8192, 0, 600)],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();

    assert_eq!(fs.stat_inode(42).unwrap().node.size, 0);
    assert_eq!(fs.read_inode(42).unwrap(), Vec::<u8>::new());

    let cancel = CancelToken::new();
    let engine = RecoveryEngine::scan(&fs, &cancel);
    let pre = engine.recovered_file_for(42).expect("scanned inode 42");
    assert_eq!(pre.size, 8192);
    let (content, partial) = engine.read_recovered(&pre);
    assert_eq!(partial, 0);
    assert_eq!(&content[..4096], &[0x11; 4096][..]);
    assert_eq!(&content[4096..], &[0x22; 4096][..]);
}

#[test]
fn orphan_area_feeds_deleted_view() {
    let fixture = Fixture {
        extra_leaves: vec![
            ino_node(&InoSpec {
                inum: 7,
                size: 5,
                nlink: 0,
                mode: 0o100644,
                sqnum: 310,
            }),
            data_node(7, 0, b"ghost", 311),
        ],
        orphan_nodes: vec![orph_node(1, &[7], 320)],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    assert_eq!(fs.orphans(), &[7]);

    let cancel = CancelToken::new();
    let engine = RecoveryEngine::scan(&fs, &cancel);
    let recovered = engine.recovered_files().unwrap();
    let ghost = recovered.iter().find(|f| f.inum == 7).expect("orphan recovered");
    assert_eq!(ghost.source, RecoverySource::OrphanArea);
    assert_eq!(ghost.name, None);
    assert_eq!(ghost.display_name(), "inode_7");
    let (content, _) = engine.read_recovered(ghost);
    assert_eq!(content, b"ghost");
}

#[test]
fn cancelled_scan_stops_early() {
    let image = Fixture::default().build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let engine = RecoveryEngine::scan(&fs, &cancel);
    assert!(engine.outcome().cancelled);
    assert_eq!(engine.outcome().scanned_lebs, 0);
}

#[test]
fn survey_reports_recoverability() {
    let fixture = Fixture {
        bud: vec![
            ino_node(&InoSpec {
                inum: 2,
                size: 5,
                nlink: 0,
                mode: 0o100644,
                sqnum: 498,
            })
            .1,
            dent_node(1, b"a.txt", 0, 0, 499).1,
        ],
        ..Fixture::default()
    };
    let image = fixture.build();
    let cancel = CancelToken::new();
    let survey = ubift_core::survey_image(&image, None, &cancel).unwrap();
    assert_eq!(survey.ubi_instances, 1);
    assert_eq!(survey.volumes.len(), 1);
    let vol = &survey.volumes[0];
    assert_eq!(vol.volume, "data");
    assert_eq!(vol.tombstoned_names, 1);
    assert!(vol.deleted_inodes >= 1);
    assert!(vol.recoverable_deleted >= 1);
}

#[test]
fn extraction_writes_live_and_deleted_trees() {
    let fixture = Fixture {
        bud: vec![
            ino_node(&InoSpec {
                inum: 2,
                size: 5,
                nlink: 0,
                mode: 0o100644,
                sqnum: 498,
            })
            .1,
            dent_node(1, b"a.txt", 0, 0, 499).1,
        ],
        ..Fixture::default()
    };
    let image = fixture.build();
    let ubi = attach(&image);
    let fs = UbifsInstance::mount(ubi.volume_by_name("data").unwrap()).unwrap();
    let cancel = CancelToken::new();
    let engine = RecoveryEngine::scan(&fs, &cancel);

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("data");
    let report = extract::extract_volume(&fs, Some(&engine), &out, &cancel).unwrap();

    assert_eq!(std::fs::read(out.join("b/c.txt")).unwrap(), vec![0xAB; 4096]);
    assert_eq!(std::fs::read(out.join("deleted/a.txt")).unwrap(), b"hello");
    assert!(!out.join("a.txt").exists());
    assert!(report.files_written >= 2);
    assert_eq!(report.deleted_files_written, 1);
}
