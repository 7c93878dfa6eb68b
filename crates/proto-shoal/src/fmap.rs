use crate::wire::{self, Wire};
use bytes::{Buf, BufMut};

/// A contiguous logical range of a file living on a single server rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmapExtent {
    /// Server rank whose backing store holds the bytes.
    pub rank: u32,
    /// Logical file offset.
    pub offset: u64,
    pub length: u64,
}

impl FmapExtent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// File-attribute snapshot carried inside an fmap, all fields widened to
/// fixed 64-bit integers for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatSnap {
    pub dev: u64,
    pub ino: u64,
    pub mode: u64,
    pub nlink: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// Serialized bytes of a [`StatSnap`]: thirteen u64 fields.
const STAT_WIRE_SIZE: usize = 13 * 8;

/// Serialized bytes of one extent: rank, offset, length.
pub const EXTENT_WIRE_SIZE: usize = 4 + 8 + 8;

/// Serialized bytes of the fmap header preceding the extent vector.
pub const FMAP_HEADER_WIRE_SIZE: usize = 4 + 4 + STAT_WIRE_SIZE;

/// The file map: where a file's bytes live across the cluster. Extents are
/// kept sorted by logical offset; overlaps are legal and are resolved by the
/// reader in favor of the later entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmap {
    /// Rank of the server that built (or last merged) this map.
    pub rank: u32,
    /// Latest known attribute snapshot.
    pub sb: StatSnap,
    pub extents: Vec<FmapExtent>,
}

impl Fmap {
    pub fn new(rank: u32, sb: StatSnap, extents: Vec<FmapExtent>) -> Fmap {
        Fmap { rank, sb, extents }
    }

    /// Exact size of the serialized form:
    /// header plus `count` fixed-size extents.
    pub fn wire_size(&self) -> usize {
        FMAP_HEADER_WIRE_SIZE + self.extents.len() * EXTENT_WIRE_SIZE
    }

    /// Fold `other` into this map: concatenate the extent vectors and re-sort
    /// by offset. The sort is stable, so among equal offsets the extents of
    /// `other` (the newer writer) come last and win a most-recent scan.
    /// Attribute snapshots combine as max-size, summed blocks, max times.
    pub fn merge(&mut self, other: &Fmap) {
        self.extents.extend_from_slice(&other.extents);
        self.extents.sort_by_key(|e| e.offset);

        self.sb.size = self.sb.size.max(other.sb.size);
        self.sb.blocks += other.sb.blocks;
        self.sb.atime = self.sb.atime.max(other.sb.atime);
        self.sb.mtime = self.sb.mtime.max(other.sb.mtime);
        self.sb.ctime = self.sb.ctime.max(other.sb.ctime);
    }

    /// The extent covering logical `offset`, if any. Scans back to front so
    /// the most recently merged extent wins on overlap.
    pub fn extent_at(&self, offset: u64) -> Option<&FmapExtent> {
        self.extents
            .iter()
            .rev()
            .find(|e| e.offset <= offset && offset < e.end())
    }
}

impl Wire for StatSnap {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        for v in [
            self.dev, self.ino, self.mode, self.nlink, self.uid, self.gid, self.rdev, self.size,
            self.blksize, self.blocks, self.atime, self.mtime, self.ctime,
        ] {
            buf.put_u64_le(v);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> wire::Result<StatSnap> {
        wire::need(buf, STAT_WIRE_SIZE)?;
        Ok(StatSnap {
            dev: buf.get_u64_le(),
            ino: buf.get_u64_le(),
            mode: buf.get_u64_le(),
            nlink: buf.get_u64_le(),
            uid: buf.get_u64_le(),
            gid: buf.get_u64_le(),
            rdev: buf.get_u64_le(),
            size: buf.get_u64_le(),
            blksize: buf.get_u64_le(),
            blocks: buf.get_u64_le(),
            atime: buf.get_u64_le(),
            mtime: buf.get_u64_le(),
            ctime: buf.get_u64_le(),
        })
    }
}

impl Wire for FmapExtent {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.rank);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.length);
    }

    fn decode<B: Buf>(buf: &mut B) -> wire::Result<FmapExtent> {
        wire::need(buf, EXTENT_WIRE_SIZE)?;
        Ok(FmapExtent {
            rank: buf.get_u32_le(),
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
        })
    }
}

impl Wire for Fmap {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.rank);
        buf.put_u32_le(self.extents.len() as u32);
        self.sb.encode(buf);
        for extent in &self.extents {
            extent.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> wire::Result<Fmap> {
        let rank = wire::get_u32(buf)?;
        let count = wire::get_u32(buf)? as usize;
        let sb = StatSnap::decode(buf)?;
        wire::need(buf, count * EXTENT_WIRE_SIZE)?;
        let mut extents = Vec::with_capacity(count);
        for _ in 0..count {
            extents.push(FmapExtent::decode(buf)?);
        }
        Ok(Fmap { rank, sb, extents })
    }
}
