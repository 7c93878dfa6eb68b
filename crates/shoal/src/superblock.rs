//! The client superblock: one shared-memory region holding, strictly in
//! this order, the initialization magic, the free file-id stack, the
//! file-name table, the file-meta table, and the page-aligned write-index
//! header word followed by the index-entry ring.
//!
//! The first attacher wins a CAS on the magic word and populates the
//! structures; later attachers (a restarted process, a sibling on the same
//! node) observe the magic and skip straight to use. The index header sits
//! on its own page so the entry ring that follows stays page-aligned for
//! bulk access by the server.

use proto_shoal::index::{IndexEntry, INDEX_ENTRY_SIZE};
use shoal_shm::{IdStack, Region, SpinLock};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const SUPERBLOCK_MAGIC: u32 = 0xDEADBEEF;
const MAGIC_INITIALIZING: u32 = 0x1;

pub const MAX_FILENAME: usize = proto_shoal::MAX_FILENAME;

pub const STORAGE_NULL: u32 = 0;
pub const STORAGE_LOGIO: u32 = 1;

/// File-name table entry, indexed by local file id.
#[repr(C)]
pub struct RawFileName {
    pub in_use: u32,
    pub name: [u8; MAX_FILENAME],
}

/// Mutable per-file metadata, guarded by the embedded per-file lock.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FileMetaData {
    pub gfid: u32,
    pub mode: u32,
    pub storage: u32,
    pub is_laminated: u32,
    pub needs_sync: u32,
    pub chunks: u32,
    _pad0: u32,
    _pad1: u32,
    /// Authoritative only once laminated.
    pub global_size: u64,
    /// Bytes appended to the local log.
    pub log_size: u64,
}

#[repr(C)]
pub struct RawFileMeta {
    lock: SpinLock,
    _pad: u32,
    data: FileMetaData,
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    stack_off: usize,
    names_off: usize,
    metas_off: usize,
    index_count_off: usize,
    index_entries_off: usize,
    total: usize,
}

fn align_up(off: usize, align: usize) -> usize {
    (off + align - 1) / align * align
}

impl Layout {
    fn compute(max_files: usize, max_index_entries: usize, page: usize) -> Layout {
        let mut off = std::mem::size_of::<u32>();

        let stack_off = align_up(off, 8);
        off = stack_off + IdStack::bytes_for(max_files);

        let names_off = align_up(off, 8);
        off = names_off + max_files * std::mem::size_of::<RawFileName>();

        let metas_off = align_up(off, 8);
        off = metas_off + max_files * std::mem::size_of::<RawFileMeta>();

        let index_count_off = align_up(off, page);
        let index_entries_off = index_count_off + page;
        let total = index_entries_off + max_index_entries * INDEX_ENTRY_SIZE;

        Layout {
            stack_off,
            names_off,
            metas_off,
            index_count_off,
            index_entries_off,
            total,
        }
    }
}

pub struct Superblock {
    region: Region,
    max_files: usize,
    max_index_entries: usize,
    layout: Layout,
}

impl Superblock {
    /// Create or attach the superblock region and run first-attacher
    /// initialization if the magic is not yet set.
    pub fn attach(
        name: &str,
        max_files: usize,
        write_index_size: usize,
    ) -> shoal_shm::Result<Superblock> {
        let page = shoal_shm::page_size();
        let max_index_entries = (write_index_size / INDEX_ENTRY_SIZE).max(1);
        let layout = Layout::compute(max_files, max_index_entries, page);
        let region = Region::create(name, layout.total)?;

        let superblock = Superblock {
            region,
            max_files,
            max_index_entries,
            layout,
        };
        superblock.initialize();
        Ok(superblock)
    }

    fn magic(&self) -> &AtomicU32 {
        unsafe { &*(self.region.as_ptr() as *const AtomicU32) }
    }

    fn initialize(&self) {
        match self.magic().compare_exchange(
            0,
            MAGIC_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // We won the race: lay out the free-id stack. Names, metas,
                // and the index count rely on the region being zero-filled.
                unsafe {
                    IdStack::init(
                        self.region.as_ptr().add(self.layout.stack_off),
                        self.max_files,
                    );
                }
                self.magic().store(SUPERBLOCK_MAGIC, Ordering::Release);
                tracing::debug!(name = self.region.name(), "initialized superblock");
            }
            Err(_) => {
                // Another attacher is (or was) initializing; wait it out.
                while self.magic().load(Ordering::Acquire) != SUPERBLOCK_MAGIC {
                    std::hint::spin_loop();
                }
                tracing::debug!(name = self.region.name(), "attached existing superblock");
            }
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    // ---- free file-id stack ----

    fn stack(&self) -> IdStack {
        unsafe { IdStack::at(self.region.as_ptr().add(self.layout.stack_off)) }
    }

    pub fn fid_alloc(&self) -> Option<i32> {
        self.stack().pop()
    }

    pub fn fid_free(&self, fid: i32) {
        self.stack().push(fid);
    }

    // ---- file-name table ----

    fn name_ptr(&self, fid: i32) -> *mut RawFileName {
        debug_assert!((fid as usize) < self.max_files);
        unsafe {
            (self.region.as_ptr().add(self.layout.names_off) as *mut RawFileName)
                .add(fid as usize)
        }
    }

    pub fn set_name(&self, fid: i32, path: &str) {
        debug_assert!(path.len() < MAX_FILENAME);
        let slot = unsafe { &mut *self.name_ptr(fid) };
        slot.name.fill(0);
        slot.name[..path.len()].copy_from_slice(path.as_bytes());
        slot.in_use = 1;
    }

    pub fn clear_name(&self, fid: i32) {
        let slot = unsafe { &mut *self.name_ptr(fid) };
        slot.in_use = 0;
        slot.name.fill(0);
    }

    pub fn path_of(&self, fid: i32) -> Option<String> {
        let slot = unsafe { &*self.name_ptr(fid) };
        if slot.in_use == 0 {
            return None;
        }
        let len = slot.name.iter().position(|b| *b == 0).unwrap_or(MAX_FILENAME);
        Some(String::from_utf8_lossy(&slot.name[..len]).into_owned())
    }

    /// Scan the name table for `path`.
    pub fn find_fid(&self, path: &str) -> Option<i32> {
        for fid in 0..self.max_files as i32 {
            if self.path_of(fid).as_deref() == Some(path) {
                return Some(fid);
            }
        }
        None
    }

    /// All in-use paths, for directory emptiness checks.
    pub fn paths(&self) -> Vec<(i32, String)> {
        (0..self.max_files as i32)
            .filter_map(|fid| self.path_of(fid).map(|p| (fid, p)))
            .collect()
    }

    // ---- file-meta table ----

    fn meta_ptr(&self, fid: i32) -> *mut RawFileMeta {
        debug_assert!((fid as usize) < self.max_files);
        unsafe {
            (self.region.as_ptr().add(self.layout.metas_off) as *mut RawFileMeta)
                .add(fid as usize)
        }
    }

    /// Run `f` over the file's metadata under its per-file lock.
    pub fn with_meta<R>(&self, fid: i32, f: impl FnOnce(&mut FileMetaData) -> R) -> R {
        let raw = self.meta_ptr(fid);
        let guard = unsafe { (*raw).lock.lock() };
        let result = f(unsafe { &mut (*raw).data });
        drop(guard);
        result
    }

    /// Copy of the file's metadata, taken under its lock.
    pub fn meta(&self, fid: i32) -> FileMetaData {
        self.with_meta(fid, |meta| *meta)
    }

    // ---- write-index ring ----

    fn index_count_atomic(&self) -> &AtomicU64 {
        unsafe {
            &*(self.region.as_ptr().add(self.layout.index_count_off) as *const AtomicU64)
        }
    }

    fn index_entry_ptr(&self) -> *mut IndexEntry {
        unsafe { self.region.as_ptr().add(self.layout.index_entries_off) as *mut IndexEntry }
    }

    pub fn index_count(&self) -> u64 {
        self.index_count_atomic().load(Ordering::Acquire)
    }

    pub fn max_index_entries(&self) -> usize {
        self.max_index_entries
    }

    /// Append one record. Returns false when the ring is at capacity; the
    /// caller must flush (sync) and reset before retrying.
    pub fn index_append(&self, entry: IndexEntry) -> bool {
        let count = self.index_count_atomic();
        let slot = count.fetch_add(1, Ordering::AcqRel);
        if slot >= self.max_index_entries as u64 {
            count.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        unsafe {
            std::ptr::write_volatile(self.index_entry_ptr().add(slot as usize), entry);
        }
        true
    }

    pub fn index_reset(&self) {
        self.index_count_atomic().store(0, Ordering::Release);
    }

    /// Copy of the live entries, in append order.
    pub fn index_entries(&self) -> Vec<IndexEntry> {
        let count = self.index_count().min(self.max_index_entries as u64) as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            entries.push(unsafe { std::ptr::read_volatile(self.index_entry_ptr().add(i)) });
        }
        entries
    }

    /// Offsets the server needs to scan the ring over its own mapping.
    pub fn index_count_offset(&self) -> usize {
        self.layout.index_count_off
    }

    pub fn index_entries_offset(&self) -> usize {
        self.layout.index_entries_off
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch(tag: &str, max_files: usize, index_bytes: usize) -> (String, Superblock) {
        let name = format!("shoal-test-super-{tag}-{}", std::process::id());
        let sb = Superblock::attach(&name, max_files, index_bytes).unwrap();
        (name, sb)
    }

    #[test]
    fn layout_keeps_the_index_page_aligned() {
        let page = shoal_shm::page_size();
        for max_files in [1usize, 7, 128, 1000] {
            let layout = Layout::compute(max_files, 1024, page);
            assert_eq!(layout.index_count_off % page, 0);
            assert_eq!(layout.index_entries_off % page, 0);
            assert!(layout.metas_off % 8 == 0);
            assert!(layout.total > layout.index_entries_off);
        }
    }

    #[test]
    fn first_attacher_initializes_second_observes() {
        let (name, sb) = scratch("init", 16, 4096);
        assert_eq!(sb.magic().load(Ordering::Relaxed), SUPERBLOCK_MAGIC);

        let fid = sb.fid_alloc().unwrap();
        sb.set_name(fid, "/m/a");

        let other = Superblock::attach(&name, 16, 4096).unwrap();
        assert_eq!(other.find_fid("/m/a"), Some(fid));
        // The second attacher skipped init: the allocation is still gone.
        assert_ne!(other.fid_alloc(), Some(fid));

        Region::unlink(&name).unwrap();
    }

    #[test]
    fn meta_round_trips_under_the_lock() {
        let (name, sb) = scratch("meta", 8, 4096);
        let fid = sb.fid_alloc().unwrap();

        sb.with_meta(fid, |meta| {
            meta.gfid = 77;
            meta.storage = STORAGE_LOGIO;
            meta.log_size = 4096;
            meta.needs_sync = 1;
        });
        let meta = sb.meta(fid);
        assert_eq!(meta.gfid, 77);
        assert_eq!(meta.storage, STORAGE_LOGIO);
        assert_eq!(meta.log_size, 4096);

        Region::unlink(&name).unwrap();
    }

    #[test]
    fn index_ring_fills_at_capacity_and_resets() {
        // Room for exactly four entries.
        let (name, sb) = scratch("ring", 8, 4 * INDEX_ENTRY_SIZE);
        assert_eq!(sb.max_index_entries(), 4);

        for i in 0..4u64 {
            assert!(sb.index_append(IndexEntry {
                gfid: 9,
                _pad: 0,
                file_pos: i * 100,
                log_pos: i * 100,
                length: 100,
            }));
        }
        // Exactly at capacity: the next append demands a flush first.
        assert!(!sb.index_append(IndexEntry::default()));
        assert_eq!(sb.index_count(), 4);

        let entries = sb.index_entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].file_pos, 300);

        sb.index_reset();
        assert_eq!(sb.index_count(), 0);
        assert!(sb.index_append(IndexEntry::default()));

        Region::unlink(&name).unwrap();
    }
}
