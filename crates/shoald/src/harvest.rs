//! The fmap harvester: after the last local writer closes a file, probe the
//! physical extent layout of its backing file and turn it into an fmap. The
//! probe is the two-pass FIEMAP ioctl; filesystems without it (tmpfs and
//! friends) fall back to one dense extent covering the whole file.

use crate::Result;
use proto_shoal::{Fmap, FmapExtent, StatSnap};
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

const FS_IOC_FIEMAP: libc::c_ulong = 0xC020660B;
const FIEMAP_FLAG_SYNC: u32 = 0x1;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

/// Sorted `(logical_offset, length)` runs covering the written regions of
/// `file`, via FIEMAP. Errors if the ioctl is unsupported.
fn fiemap(file: &File) -> std::io::Result<Vec<(u64, u64)>> {
    let fd = file.as_raw_fd();

    // First pass: how many mappings are there?
    let mut header = FiemapHeader {
        fm_length: u64::MAX,
        fm_flags: FIEMAP_FLAG_SYNC,
        ..Default::default()
    };
    if unsafe { libc::ioctl(fd, FS_IOC_FIEMAP, &mut header as *mut FiemapHeader) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let count = header.fm_mapped_extents as usize;
    if count == 0 {
        return Ok(Vec::new());
    }

    // Second pass: read them in. The buffer is u64-backed to satisfy the
    // struct alignment.
    let bytes =
        std::mem::size_of::<FiemapHeader>() + count * std::mem::size_of::<FiemapExtent>();
    let mut buf = vec![0u64; (bytes + 7) / 8];
    let ptr = buf.as_mut_ptr() as *mut u8;

    let header = unsafe { &mut *(ptr as *mut FiemapHeader) };
    header.fm_length = u64::MAX;
    header.fm_flags = FIEMAP_FLAG_SYNC;
    header.fm_extent_count = count as u32;

    if unsafe { libc::ioctl(fd, FS_IOC_FIEMAP, ptr) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let header = unsafe { &*(ptr as *const FiemapHeader) };
    let extents = unsafe {
        std::slice::from_raw_parts(
            ptr.add(std::mem::size_of::<FiemapHeader>()) as *const FiemapExtent,
            header.fm_mapped_extents as usize,
        )
    };

    let mut runs: Vec<(u64, u64)> = extents
        .iter()
        .map(|e| (e.fe_logical, e.fe_length))
        .collect();
    runs.sort_by_key(|(logical, _)| *logical);
    Ok(runs)
}

/// Compress adjacent runs into single extents.
pub(crate) fn compress(runs: &[(u64, u64)]) -> Vec<(u64, u64)> {
    let mut out: Vec<(u64, u64)> = Vec::new();
    for &(start, len) in runs {
        match out.last_mut() {
            Some((cur_start, cur_len)) if *cur_start + *cur_len == start => {
                *cur_len += len;
            }
            _ => out.push((start, len)),
        }
    }
    out
}

/// Build the local fmap of `path`: probe physical extents, compress, and
/// snapshot the file attributes, tagging every extent with `rank`.
pub fn harvest(path: &Path, rank: u32) -> Result<Fmap> {
    let file = File::open(path)?;
    let md = file.metadata()?;

    let runs = match fiemap(&file) {
        Ok(runs) => runs,
        Err(err) => {
            // No extent probe on this filesystem: a single dense extent
            // costs fmap size but preserves correctness.
            tracing::debug!(path = %path.display(), %err, "fiemap unavailable; dense fallback");
            if md.size() == 0 {
                Vec::new()
            } else {
                vec![(0, md.size())]
            }
        }
    };

    let extents = compress(&runs)
        .into_iter()
        .map(|(offset, length)| FmapExtent {
            rank,
            offset,
            length,
        })
        .collect();

    let sb = StatSnap {
        dev: md.dev(),
        ino: md.ino(),
        mode: md.mode() as u64,
        nlink: md.nlink(),
        uid: md.uid() as u64,
        gid: md.gid() as u64,
        rdev: md.rdev(),
        size: md.size(),
        blksize: md.blksize(),
        blocks: md.blocks(),
        atime: md.atime() as u64,
        mtime: md.mtime() as u64,
        ctime: md.ctime() as u64,
    };

    let fmap = Fmap::new(rank, sb, extents);
    tracing::debug!(
        path = %path.display(),
        rank,
        extents = fmap.extents.len(),
        size = sb.size,
        "harvested fmap",
    );
    Ok(fmap)
}
