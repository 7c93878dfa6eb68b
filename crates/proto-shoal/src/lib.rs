//! Wire-level types shared by the shoal client runtime and the shoald server:
//! the fmap and its extents, file attribute records, and the request/response
//! structs of every registered RPC operation. Both sides depend on this crate
//! and nothing else, so encodings can never drift apart.

mod fmap;
pub use fmap::{Fmap, FmapExtent, StatSnap, EXTENT_WIRE_SIZE, FMAP_HEADER_WIRE_SIZE};

pub mod messages;
pub mod wire;

pub mod errno;
pub mod index;
pub mod op;

/// Hard bound on a pathname travelling over the wire or stored in the
/// client's file-name table, terminator included.
pub const MAX_FILENAME: usize = 128;

/// Payloads larger than this never travel inline in a request or response
/// frame; they move through a registered bulk buffer instead.
pub const MAX_INLINE_PAYLOAD: usize = 32 * 1024;

/// Global file id: the first four digest bytes of the absolute path,
/// identical on every rank for the same name.
pub fn gfid(path: &str) -> u32 {
    let digest = md5::compute(path.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// The server rank owning the metadata shard for `name`. Every rank computes
/// the same owner for the same name.
pub fn shard_owner(name: &str, server_count: u32) -> u32 {
    let sum: u64 = name.as_bytes().iter().map(|b| *b as u64).sum();
    (sum % server_count as u64) as u32
}

/// Shared-memory region names.
pub mod shm_name {
    /// Client superblock region.
    pub fn superblock(app_id: u32, client_id: u32) -> String {
        format!("shoal-super-{app_id}-{client_id}")
    }

    /// Client receive-buffer region filled by the server on read/mread.
    pub fn recv(app_id: u32, client_id: u32) -> String {
        format!("shoal-data-{app_id}-{client_id}")
    }

    /// Per-inode fmap region published by the server for readers.
    pub fn fmap(ino: u64) -> String {
        format!("shoal-fmap-{ino}")
    }
}
