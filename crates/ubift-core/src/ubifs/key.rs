//! Index keys.
//!
//! Every UBIFS node is addressed by a 64-bit key: a 32-bit inode number, a
//! 3-bit kind tag and a 29-bit payload whose meaning depends on the kind
//! (block number for data keys, name hash for directory-entry keys). Keys
//! order lexicographically on (inode, kind, payload), which is exactly the
//! layout the index tree is sorted by.

use serde::{Deserialize, Serialize};

pub const KEY_HASH_MASK: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    Inode = 0,
    Data = 1,
    Dentry = 2,
    Xattr = 3,
}

impl KeyKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(KeyKind::Inode),
            1 => Some(KeyKind::Data),
            2 => Some(KeyKind::Dentry),
            3 => Some(KeyKind::Xattr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub inum: u32,
    pub kind: KeyKind,
    pub payload: u32,
}

impl Key {
    pub fn new(inum: u32, kind: KeyKind, payload: u32) -> Self {
        Key {
            inum,
            kind,
            payload: payload & KEY_HASH_MASK,
        }
    }

    pub fn inode(inum: u32) -> Self {
        Key::new(inum, KeyKind::Inode, 0)
    }

    pub fn data(inum: u32, block: u32) -> Self {
        Key::new(inum, KeyKind::Data, block)
    }

    pub fn dentry(parent: u32, name: &[u8]) -> Self {
        Key::new(parent, KeyKind::Dentry, r5_hash(name))
    }

    /// Smallest key of a kind for an inode; with the next kind this bounds a
    /// half-open range scan over all of the inode's entries of that kind.
    pub fn range_start(inum: u32, kind: KeyKind) -> Self {
        Key::new(inum, kind, 0)
    }

    pub fn range_end(inum: u32, kind: KeyKind) -> Self {
        match kind {
            KeyKind::Inode => Key::new(inum, KeyKind::Data, 0),
            KeyKind::Data => Key::new(inum, KeyKind::Dentry, 0),
            KeyKind::Dentry => Key::new(inum, KeyKind::Xattr, 0),
            KeyKind::Xattr => Key::new(inum.wrapping_add(1), KeyKind::Inode, 0),
        }
    }

    /// Decode the first 8 bytes of an on-disk key field (little-endian).
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 8 {
            return None;
        }
        let inum = u32::from_le_bytes(raw[0..4].try_into().ok()?);
        let word = u32::from_le_bytes(raw[4..8].try_into().ok()?);
        let kind = KeyKind::from_raw(word >> 29)?;
        Some(Key {
            inum,
            kind,
            payload: word & KEY_HASH_MASK,
        })
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.inum.to_le_bytes());
        let word = ((self.kind as u32) << 29) | self.payload;
        out[4..8].copy_from_slice(&word.to_le_bytes());
        out
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {:?}, {:#x})", self.inum, self.kind, self.payload)
    }
}

/// The R5 name hash used for directory-entry keys.
///
/// Hash values 0..=2 are reserved for ".", ".." and the end-of-readdir
/// marker, so real names always hash to 3 or above.
pub fn r5_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in name {
        let c = u32::from(b);
        hash = hash.wrapping_add(c << 4).wrapping_add(c >> 4).wrapping_mul(11);
    }
    if hash & KEY_HASH_MASK <= 2 {
        hash = hash.wrapping_add(3);
    }
    hash & KEY_HASH_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ordering_is_lexicographic() {
        let a = Key::new(1, KeyKind::Inode, 0);
        let b = Key::new(1, KeyKind::Data, 0);
        let c = Key::new(1, KeyKind::Dentry, 7);
        let d = Key::new(2, KeyKind::Inode, 0);
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn key_roundtrip() {
        let key = Key::new(42, KeyKind::Dentry, 0x1234);
        assert_eq!(Key::from_bytes(&key.to_bytes()), Some(key));
    }

    #[test]
    fn range_bounds_bracket_the_kind() {
        let lo = Key::range_start(9, KeyKind::Dentry);
        let hi = Key::range_end(9, KeyKind::Dentry);
        let inside = Key::new(9, KeyKind::Dentry, KEY_HASH_MASK);
        assert!(lo <= inside && inside < hi);
        let outside = Key::new(9, KeyKind::Xattr, 0);
        assert!(outside >= hi);
    }

    #[test]
    fn r5_hash_stays_in_range_and_avoids_reserved() {
        assert_eq!(r5_hash(b""), 3);
        for name in [&b"a"[..], b"a.txt", b"some-much-longer-file-name.bin"] {
            let h = r5_hash(name);
            assert!(h > 2);
            assert!(h <= KEY_HASH_MASK);
        }
    }

    #[test]
    fn r5_hash_is_deterministic() {
        assert_eq!(r5_hash(b"a.txt"), r5_hash(b"a.txt"));
        assert_ne!(r5_hash(b"a.txt"), r5_hash(b"b.txt"));
    }
}
