//! On-flash UBI headers: erase-counter header, volume-identifier header, and
//! volume-table records, all big-endian, each guarded by a CRC-32 in the
//! JAMCRC variant (init `0xFFFFFFFF`, no final xor).

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use crc::{Crc, CRC_32_JAMCRC};
use serde::{Deserialize, Serialize};

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

pub const UBI_EC_MAGIC: &[u8; 4] = b"UBI#";
pub const UBI_VID_MAGIC: &[u8; 4] = b"UBI!";
pub const UBI_VERSION: u8 = 1;

/// Volume id of the layout volume holding the volume table.
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFF_EFFF;
/// Volume ids at or above this value are internal to UBI.
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_0000;
/// The volume table holds at most this many records.
pub const UBI_VTBL_SLOTS: usize = 128;

pub const EC_HDR_SIZE: usize = 64;
pub const VID_HDR_SIZE: usize = 64;
pub const VTBL_RECORD_SIZE: usize = 172;
const UBI_VOL_NAME_MAX: usize = 127;

/// Erase-counter header, first 64 bytes of every in-use PEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcHeader {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
    pub crc_ok: bool,
}

impl EcHeader {
    /// Parse from the start of a PEB. `None` when the magic or version does
    /// not match; a bad CRC still parses but is flagged.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < EC_HDR_SIZE || &buf[..4] != UBI_EC_MAGIC || buf[4] != UBI_VERSION {
            return None;
        }
        let mut cur = Cursor::new(&buf[8..]);
        let ec = cur.read_u64::<BigEndian>().ok()?;
        let vid_hdr_offset = cur.read_u32::<BigEndian>().ok()?;
        let data_offset = cur.read_u32::<BigEndian>().ok()?;
        let image_seq = cur.read_u32::<BigEndian>().ok()?;
        let stored_crc = u32::from_be_bytes(buf[60..64].try_into().ok()?);
        let crc_ok = UBI_CRC.checksum(&buf[..60]) == stored_crc;
        Some(EcHeader {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            crc_ok,
        })
    }
}

/// UBI volume types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolType {
    Dynamic,
    Static,
}

impl VolType {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(VolType::Dynamic),
            2 => Some(VolType::Static),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolType::Dynamic => write!(f, "dynamic"),
            VolType::Static => write!(f, "static"),
        }
    }
}

/// Volume-identifier header, mapping its PEB to a (volume, LEB) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VidHeader {
    pub vol_type: VolType,
    pub copy_flag: bool,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub sqnum: u64,
    pub crc_ok: bool,
}

impl VidHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < VID_HDR_SIZE || &buf[..4] != UBI_VID_MAGIC || buf[4] != UBI_VERSION {
            return None;
        }
        let vol_type = VolType::from_raw(buf[5])?;
        let copy_flag = buf[6] != 0;
        let compat = buf[7];
        let mut cur = Cursor::new(&buf[8..]);
        let vol_id = cur.read_u32::<BigEndian>().ok()?;
        let lnum = cur.read_u32::<BigEndian>().ok()?;
        cur.set_position(12); // skip padding1[4]
        let data_size = cur.read_u32::<BigEndian>().ok()?;
        let used_ebs = cur.read_u32::<BigEndian>().ok()?;
        let data_pad = cur.read_u32::<BigEndian>().ok()?;
        let data_crc = cur.read_u32::<BigEndian>().ok()?;
        cur.set_position(32); // skip padding2[4]
        let sqnum = cur.read_u64::<BigEndian>().ok()?;
        let stored_crc = u32::from_be_bytes(buf[60..64].try_into().ok()?);
        let crc_ok = UBI_CRC.checksum(&buf[..60]) == stored_crc;
        Some(VidHeader {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            crc_ok,
        })
    }
}

/// One record of the on-flash volume table. Record index == volume id; a
/// record with `reserved_pebs == 0` is an empty slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtblRecord {
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub vol_type: VolType,
    pub upd_marker: bool,
    pub name: String,
    pub flags: u8,
}

impl VtblRecord {
    /// Parse one table slot. `Ok(None)` for an empty slot, `Err` for a slot
    /// whose CRC or fields are damaged.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, String> {
        if buf.len() < VTBL_RECORD_SIZE {
            return Err("volume table record truncated".into());
        }
        let stored_crc = u32::from_be_bytes(buf[168..172].try_into().unwrap());
        if UBI_CRC.checksum(&buf[..168]) != stored_crc {
            return Err("volume table record CRC mismatch".into());
        }
        let mut cur = Cursor::new(buf);
        let reserved_pebs = cur.read_u32::<BigEndian>().map_err(|e| e.to_string())?;
        if reserved_pebs == 0 {
            return Ok(None);
        }
        let alignment = cur.read_u32::<BigEndian>().map_err(|e| e.to_string())?;
        let data_pad = cur.read_u32::<BigEndian>().map_err(|e| e.to_string())?;
        let vol_type = VolType::from_raw(buf[12]).ok_or("bad volume type")?;
        let upd_marker = buf[13] != 0;
        let name_len = u16::from_be_bytes(buf[14..16].try_into().unwrap()) as usize;
        if name_len > UBI_VOL_NAME_MAX {
            return Err(format!("volume name length {name_len} out of range"));
        }
        let name = std::str::from_utf8(&buf[16..16 + name_len])
            .map_err(|_| "volume name is not UTF-8".to_string())?
            .to_string();
        let flags = buf[16 + UBI_VOL_NAME_MAX + 1];
        Ok(Some(VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        }))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn encode_ec(ec: u64, vid_hdr_offset: u32, data_offset: u32) -> [u8; EC_HDR_SIZE] {
        let mut buf = [0u8; EC_HDR_SIZE];
        buf[..4].copy_from_slice(UBI_EC_MAGIC);
        buf[4] = UBI_VERSION;
        buf[8..16].copy_from_slice(&ec.to_be_bytes());
        buf[16..20].copy_from_slice(&vid_hdr_offset.to_be_bytes());
        buf[20..24].copy_from_slice(&data_offset.to_be_bytes());
        let crc = UBI_CRC.checksum(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn encode_vid(vol_id: u32, lnum: u32, sqnum: u64) -> [u8; VID_HDR_SIZE] {
        let mut buf = [0u8; VID_HDR_SIZE];
        buf[..4].copy_from_slice(UBI_VID_MAGIC);
        buf[4] = UBI_VERSION;
        buf[5] = 1; // dynamic
        buf[8..12].copy_from_slice(&vol_id.to_be_bytes());
        buf[12..16].copy_from_slice(&lnum.to_be_bytes());
        buf[40..48].copy_from_slice(&sqnum.to_be_bytes());
        let crc = UBI_CRC.checksum(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn encode_vtbl_record(name: &str, reserved_pebs: u32) -> [u8; VTBL_RECORD_SIZE] {
        let mut buf = [0u8; VTBL_RECORD_SIZE];
        buf[..4].copy_from_slice(&reserved_pebs.to_be_bytes());
        buf[4..8].copy_from_slice(&1u32.to_be_bytes()); // alignment
        buf[12] = 1; // dynamic
        buf[14..16].copy_from_slice(&(name.len() as u16).to_be_bytes());
        buf[16..16 + name.len()].copy_from_slice(name.as_bytes());
        let crc = UBI_CRC.checksum(&buf[..168]);
        buf[168..172].copy_from_slice(&crc.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn ec_header_roundtrip() {
        let buf = encode_ec(42, 64, 128);
        let hdr = EcHeader::parse(&buf).unwrap();
        assert_eq!(hdr.ec, 42);
        assert_eq!(hdr.vid_hdr_offset, 64);
        assert_eq!(hdr.data_offset, 128);
        assert!(hdr.crc_ok);
    }

    #[test]
    fn ec_header_bad_crc_is_flagged() {
        let mut buf = encode_ec(1, 64, 128);
        buf[10] ^= 0xFF;
        let hdr = EcHeader::parse(&buf).unwrap();
        assert!(!hdr.crc_ok);
    }

    #[test]
    fn ec_header_bad_magic_rejected() {
        let mut buf = encode_ec(1, 64, 128);
        buf[0] = b'X';
        assert!(EcHeader::parse(&buf).is_none());
    }

    #[test]
    fn vid_header_roundtrip() {
        let buf = encode_vid(3, 17, 0xDEAD);
        let hdr = VidHeader::parse(&buf).unwrap();
        assert_eq!(hdr.vol_id, 3);
        assert_eq!(hdr.lnum, 17);
        assert_eq!(hdr.sqnum, 0xDEAD);
        assert_eq!(hdr.vol_type, VolType::Dynamic);
        assert!(hdr.crc_ok);
    }

    #[test]
    fn vtbl_record_roundtrip() {
        let buf = encode_vtbl_record("data", 16);
        let rec = VtblRecord::parse(&buf).unwrap().unwrap();
        assert_eq!(rec.name, "data");
        assert_eq!(rec.reserved_pebs, 16);
        assert_eq!(rec.vol_type, VolType::Dynamic);
    }

    #[test]
    fn vtbl_empty_slot() {
        let mut buf = [0u8; VTBL_RECORD_SIZE];
        let crc = UBI_CRC.checksum(&buf[..168]);
        buf[168..172].copy_from_slice(&crc.to_be_bytes());
        assert!(VtblRecord::parse(&buf).unwrap().is_none());
    }

    #[test]
    fn vtbl_corrupt_slot() {
        let mut buf = encode_vtbl_record("data", 16);
        buf[0] ^= 0x01;
        assert!(VtblRecord::parse(&buf).is_err());
    }
}
