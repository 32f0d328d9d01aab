//! UBI volume reconstruction.
//!
//! Takes one UBI-typed MTD partition, parses the per-PEB header pair, and
//! resolves the LEB→PEB mapping that wear-levelling scattered over the
//! partition. Losers of mapping conflicts and PEBs with damaged VID headers
//! are kept aside as stale blocks for the recovery layer.

pub mod headers;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, UbiftError};
use crate::image::Image;
use crate::mtd::{Geometry, MtdPartition};
use headers::{
    EcHeader, VidHeader, VolType, VtblRecord, UBI_CRC, UBI_INTERNAL_VOL_START,
    UBI_LAYOUT_VOLUME_ID, UBI_VTBL_SLOTS, VTBL_RECORD_SIZE,
};

/// One physical erase block of the partition.
#[derive(Debug, Clone)]
pub struct Peb {
    pub index: u32,
    pub ec: Option<EcHeader>,
    pub vid: Option<VidHeader>,
}

impl Peb {
    /// A PEB with an EC header but no VID header is free (erased).
    pub fn is_free(&self) -> bool {
        self.ec.is_some() && self.vid.is_none()
    }
}

/// A volume known to this UBI instance, from the volume table or synthesized
/// for mapped PEBs the table does not mention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: u32,
    pub name: String,
    pub reserved_pebs: u32,
    pub vol_type: VolType,
    pub flags: u8,
    /// Referenced by mapped PEBs but absent from the volume table.
    pub orphan: bool,
    /// Declared length, extended to cover every mapped LEB actually seen.
    pub leb_count: u32,
}

/// Parse-time health counters, surfaced by the `info` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UbiDiagnostics {
    pub corrupt_ec_headers: u32,
    pub corrupt_vid_headers: u32,
    pub stale_pebs: u32,
    pub orphan_volumes: u32,
}

/// A reconstructed UBI instance over one MTD partition.
pub struct UbiInstance<'a> {
    image: &'a Image,
    part_offset: u64,
    peb_size: u64,
    data_offset: u32,
    vid_hdr_offset: u32,
    pebs: Vec<Peb>,
    /// Live mapping (vol_id, lnum) → index into `pebs`.
    map: BTreeMap<(u32, u32), u32>,
    /// PEBs with a readable VID header that lost a mapping conflict or failed
    /// their header CRC. Recovery candidates.
    stale: Vec<u32>,
    volumes: Vec<VolumeInfo>,
    diagnostics: UbiDiagnostics,
}

impl<'a> UbiInstance<'a> {
    /// Parse every PEB of `part` and build the live LEB map and volume table.
    pub fn attach(
        image: &'a Image,
        part: &MtdPartition,
        geometry: Option<Geometry>,
    ) -> Result<Self> {
        let peb_size = geometry
            .map(|g| g.peb_size)
            .or(part.peb_size)
            .filter(|s| *s > 0)
            .ok_or(UbiftError::Geometry { what: "PEB size" })?;
        let peb_count = (part.len / peb_size) as u32;

        let mut pebs = Vec::with_capacity(peb_count as usize);
        let mut diagnostics = UbiDiagnostics::default();
        let mut data_offset = None;
        let mut vid_hdr_offset = None;

        for index in 0..peb_count {
            let raw = image.slice(part.offset + u64::from(index) * peb_size, peb_size)?;
            let ec = EcHeader::parse(raw);
            let vid = match &ec {
                Some(ec) if (ec.vid_hdr_offset as u64) < peb_size => {
                    VidHeader::parse(&raw[ec.vid_hdr_offset as usize..])
                }
                _ => None,
            };
            match &ec {
                Some(ec) if ec.crc_ok => {
                    data_offset.get_or_insert(ec.data_offset);
                    vid_hdr_offset.get_or_insert(ec.vid_hdr_offset);
                }
                Some(_) => diagnostics.corrupt_ec_headers += 1,
                None => {}
            }
            pebs.push(Peb { index, ec, vid });
        }

        // With no intact EC header the supplied min-I/O size still fixes the
        // header layout: VID header one write unit in, data one further.
        let supplied_min_io = geometry.and_then(|g| g.min_io_size).map(|m| m.max(64));
        let data_offset = data_offset
            .or(supplied_min_io.map(|m| 2 * m))
            .ok_or(UbiftError::Geometry {
                what: "LEB data offset (no intact EC header and no min I/O size)",
            })?;
        let vid_hdr_offset = vid_hdr_offset.or(supplied_min_io).unwrap_or(64);

        let mut ubi = UbiInstance {
            image,
            part_offset: part.offset,
            peb_size,
            data_offset,
            vid_hdr_offset,
            pebs,
            map: BTreeMap::new(),
            stale: Vec::new(),
            volumes: Vec::new(),
            diagnostics,
        };
        ubi.build_leb_map()?;
        ubi.parse_volume_table();
        tracing::info!(
            "attached UBI instance at {:#x}: {} PEBs, {} mapped LEBs, {} volumes",
            ubi.part_offset,
            ubi.pebs.len(),
            ubi.map.len(),
            ubi.volumes.len()
        );
        Ok(ubi)
    }

    fn build_leb_map(&mut self) -> Result<()> {
        for i in 0..self.pebs.len() as u32 {
            let Some(vid) = self.pebs[i as usize].vid else {
                continue;
            };
            if !vid.crc_ok {
                self.diagnostics.corrupt_vid_headers += 1;
                self.stale.push(i);
                continue;
            }
            let key = (vid.vol_id, vid.lnum);
            match self.map.get(&key).copied() {
                None => {
                    self.map.insert(key, i);
                }
                Some(prev) => {
                    let winner = self.resolve_conflict(prev, i)?;
                    let loser = if winner == prev { i } else { prev };
                    self.map.insert(key, winner);
                    self.stale.push(loser);
                }
            }
        }
        self.diagnostics.stale_pebs = self.stale.len() as u32;
        Ok(())
    }

    /// Conflict rule: higher sequence number wins; on a tie the copy whose
    /// data CRC checks out wins; on a further tie the greater erase counter.
    fn resolve_conflict(&self, a: u32, b: u32) -> Result<u32> {
        let (pa, pb) = (&self.pebs[a as usize], &self.pebs[b as usize]);
        let (va, vb) = (pa.vid.unwrap(), pb.vid.unwrap());
        if va.sqnum != vb.sqnum {
            return Ok(if va.sqnum > vb.sqnum { a } else { b });
        }
        let (ca, cb) = (self.data_crc_ok(a), self.data_crc_ok(b));
        if ca != cb {
            return Ok(if ca { a } else { b });
        }
        let (ea, eb) = (
            pa.ec.map(|e| e.ec).unwrap_or(0),
            pb.ec.map(|e| e.ec).unwrap_or(0),
        );
        if ea != eb {
            return Ok(if ea > eb { a } else { b });
        }
        Err(UbiftError::Unrecoverable(format!(
            "PEBs {} and {} both claim volume {} LEB {} with equal sequence number {} and erase counter",
            pa.index, pb.index, va.vol_id, va.lnum, va.sqnum
        )))
    }

    /// For static volumes and copied LEBs the VID header carries a CRC over
    /// the first `data_size` bytes of the LEB; an unused data CRC passes.
    fn data_crc_ok(&self, peb: u32) -> bool {
        let vid = match self.pebs[peb as usize].vid {
            Some(v) => v,
            None => return false,
        };
        if vid.data_size == 0 {
            return true;
        }
        match self.peb_data(peb) {
            Some(data) if (vid.data_size as usize) <= data.len() => {
                UBI_CRC.checksum(&data[..vid.data_size as usize]) == vid.data_crc
            }
            _ => false,
        }
    }

    fn parse_volume_table(&mut self) {
        let copies: Vec<(u64, Vec<Option<VtblRecord>>)> = [0u32, 1u32]
            .iter()
            .filter_map(|lnum| {
                let peb = *self.map.get(&(UBI_LAYOUT_VOLUME_ID, *lnum))?;
                let sqnum = self.pebs[peb as usize].vid.map(|v| v.sqnum).unwrap_or(0);
                self.parse_vtbl_copy(peb).map(|records| (sqnum, records))
            })
            .collect();

        let chosen = match copies.len() {
            0 => {
                tracing::warn!("no intact layout volume copy; volumes limited to orphans");
                None
            }
            1 => Some(copies.into_iter().next().unwrap().1),
            _ => {
                // Both copies intact: the one written by the fresher PEB wins
                // if they disagree.
                let mut copies = copies;
                copies.sort_by_key(|(sqnum, _)| std::cmp::Reverse(*sqnum));
                Some(copies.into_iter().next().unwrap().1)
            }
        };

        if let Some(records) = chosen {
            for (id, rec) in records.into_iter().enumerate() {
                if let Some(rec) = rec {
                    let id = id as u32;
                    let leb_count = self.observed_leb_count(id).max(rec.reserved_pebs);
                    self.volumes.push(VolumeInfo {
                        id,
                        name: rec.name,
                        reserved_pebs: rec.reserved_pebs,
                        vol_type: rec.vol_type,
                        flags: rec.flags,
                        orphan: false,
                        leb_count,
                    });
                }
            }
        }

        // Volume ids referenced by mapped PEBs but absent from the table are
        // still made browsable.
        let known: BTreeSet<u32> = self.volumes.iter().map(|v| v.id).collect();
        let orphan_ids: BTreeSet<u32> = self
            .map
            .keys()
            .map(|(vol, _)| *vol)
            .filter(|vol| *vol < UBI_INTERNAL_VOL_START && !known.contains(vol))
            .collect();
        for id in orphan_ids {
            tracing::warn!("volume {} is mapped but missing from the volume table", id);
            self.diagnostics.orphan_volumes += 1;
            let leb_count = self.observed_leb_count(id);
            self.volumes.push(VolumeInfo {
                id,
                name: format!("orphan_{id}"),
                reserved_pebs: 0,
                vol_type: VolType::Dynamic,
                flags: 0,
                orphan: true,
                leb_count,
            });
        }
        self.volumes.sort_by_key(|v| v.id);
    }

    fn parse_vtbl_copy(&self, peb: u32) -> Option<Vec<Option<VtblRecord>>> {
        let data = self.peb_data(peb)?;
        let slots = (data.len() / VTBL_RECORD_SIZE).min(UBI_VTBL_SLOTS);
        let mut records = Vec::with_capacity(slots);
        for i in 0..slots {
            match VtblRecord::parse(&data[i * VTBL_RECORD_SIZE..]) {
                Ok(rec) => records.push(rec),
                Err(reason) => {
                    tracing::warn!("layout volume PEB {}: record {}: {}", peb, i, reason);
                    return None;
                }
            }
        }
        Some(records)
    }

    fn observed_leb_count(&self, vol_id: u32) -> u32 {
        self.map
            .range((vol_id, 0)..(vol_id, u32::MAX))
            .map(|((_, lnum), _)| lnum + 1)
            .max()
            .unwrap_or(0)
    }

    /// Bytes of one PEB past its UBI headers (the LEB payload area).
    fn peb_data(&self, peb: u32) -> Option<&'a [u8]> {
        let raw = self.peb_bytes(peb)?;
        raw.get(self.data_offset as usize..)
    }

    /// The raw PEB including both UBI headers.
    pub fn peb_bytes(&self, peb: u32) -> Option<&'a [u8]> {
        if u64::from(peb) >= self.peb_count() {
            return None;
        }
        self.image
            .slice(self.part_offset + u64::from(peb) * self.peb_size, self.peb_size)
            .ok()
    }

    pub fn peb_count(&self) -> u64 {
        self.pebs.len() as u64
    }

    pub fn peb_size(&self) -> u64 {
        self.peb_size
    }

    pub fn vid_hdr_offset(&self) -> u32 {
        self.vid_hdr_offset
    }

    pub fn leb_size(&self) -> u64 {
        self.peb_size - u64::from(self.data_offset)
    }

    pub fn pebs(&self) -> &[Peb] {
        &self.pebs
    }

    pub fn volumes(&self) -> &[VolumeInfo] {
        &self.volumes
    }

    pub fn diagnostics(&self) -> &UbiDiagnostics {
        &self.diagnostics
    }

    pub fn volume(&self, id: u32) -> Option<UbiVolume<'_>> {
        self.volumes
            .iter()
            .find(|v| v.id == id)
            .map(|info| UbiVolume { ubi: self, info })
    }

    pub fn volume_by_name(&self, name: &str) -> Option<UbiVolume<'_>> {
        self.volumes
            .iter()
            .find(|v| v.name == name)
            .map(|info| UbiVolume { ubi: self, info })
    }

    pub fn volume_by_index(&self, index: usize) -> Option<UbiVolume<'_>> {
        self.volumes
            .get(index)
            .map(|info| UbiVolume { ubi: self, info })
    }

    /// Stale blocks carrying data for `vol_id`: conflict losers and PEBs with
    /// a damaged VID header whose volume id still reads as `vol_id`.
    pub fn stale_pebs_for(&self, vol_id: u32) -> Vec<(u32, VidHeader)> {
        self.stale
            .iter()
            .filter_map(|i| {
                let vid = self.pebs[*i as usize].vid?;
                (vid.vol_id == vol_id).then_some((*i, vid))
            })
            .collect()
    }
}

/// A single UBI volume: a logically contiguous run of LEBs, some backed by a
/// PEB and some unmapped.
pub struct UbiVolume<'u> {
    ubi: &'u UbiInstance<'u>,
    info: &'u VolumeInfo,
}

impl<'u> UbiVolume<'u> {
    pub fn info(&self) -> &VolumeInfo {
        self.info
    }

    pub fn ubi(&self) -> &'u UbiInstance<'u> {
        self.ubi
    }

    pub fn leb_count(&self) -> u32 {
        self.info.leb_count
    }

    pub fn leb_size(&self) -> u64 {
        self.ubi.leb_size()
    }

    pub fn is_mapped(&self, lnum: u32) -> bool {
        self.ubi.map.contains_key(&(self.info.id, lnum))
    }

    pub fn backing_peb(&self, lnum: u32) -> Option<u32> {
        self.ubi.map.get(&(self.info.id, lnum)).copied()
    }

    /// LEB payload. Unmapped LEBs read as erased flash (all `0xFF`).
    pub fn leb(&self, lnum: u32) -> Cow<'u, [u8]> {
        match self.backing_peb(lnum).and_then(|peb| self.ubi.peb_data(peb)) {
            Some(data) => Cow::Borrowed(data),
            None => Cow::Owned(vec![0xFF; self.leb_size() as usize]),
        }
    }

    /// The raw backing PEB of a LEB, headers included.
    pub fn leb_with_headers(&self, lnum: u32) -> Option<&'u [u8]> {
        self.backing_peb(lnum).and_then(|peb| self.ubi.peb_bytes(peb))
    }

    /// The whole volume as one byte stream, LEB by LEB.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((u64::from(self.leb_count()) * self.leb_size()) as usize);
        for lnum in 0..self.leb_count() {
            out.extend_from_slice(&self.leb(lnum));
        }
        out
    }
}
