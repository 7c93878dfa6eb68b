//! Layout of one write-index record in the client superblock. The server
//! scans these in place over the attached region during `sync`, so the
//! struct is `repr(C)` with explicit padding and must never change size
//! without a matching bump on both sides.

/// One record per append: where `length` bytes of file `gfid` landed, both
/// logically (`file_pos`) and physically in the local log (`log_pos`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexEntry {
    pub gfid: u32,
    pub _pad: u32,
    pub file_pos: u64,
    pub log_pos: u64,
    pub length: u64,
}

pub const INDEX_ENTRY_SIZE: usize = std::mem::size_of::<IndexEntry>();
