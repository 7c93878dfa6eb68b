//! The file-descriptor layer: caller-visible fds are offset by the system
//! fd soft limit, so a single comparison routes every syscall without a
//! table lookup and no system fd is ever reinterpreted. Streams and
//! directory streams are preallocated arrays with pointer-range intercept
//! tests.

use proto_shoal::Fmap;
use std::fs::File;

pub const MAX_FILEDESCS: usize = 1024;

/// The numeric partition of the fd space.
#[derive(Debug, Clone, Copy)]
pub struct FdSpace {
    limit: i64,
}

impl FdSpace {
    /// Partition at the process's RLIMIT_NOFILE soft limit: the kernel can
    /// never hand out an fd at or above it.
    pub fn from_rlimit() -> std::io::Result<FdSpace> {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(FdSpace {
            limit: lim.rlim_cur as i64,
        })
    }

    #[cfg(test)]
    pub fn with_limit(limit: i64) -> FdSpace {
        FdSpace { limit }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// The fd value handed to the caller for internal slot `internal`.
    pub fn expose(&self, internal: i32) -> i64 {
        self.limit + internal as i64
    }

    /// Translate a caller fd back to the internal slot, or `None` when the
    /// fd belongs to the system (or is invalid) and must bypass.
    pub fn intercept(&self, fd: i64) -> Option<i32> {
        if fd < self.limit {
            return None;
        }
        Some((fd - self.limit) as i32)
    }
}

/// Per-fd state.
pub struct FdEntry {
    pub fid: i32,
    pub pos: u64,
    pub read: bool,
    pub write: bool,
    pub append: bool,
    /// Open handle on the backing-store file.
    pub file: File,
    /// Decoded fmap for read-only opens; writers carry none.
    pub fmap: Option<Fmap>,
}

pub struct FdTable {
    entries: Vec<Option<FdEntry>>,
    free: Vec<i32>,
}

impl FdTable {
    pub fn new(capacity: usize) -> FdTable {
        FdTable {
            entries: (0..capacity).map(|_| None).collect(),
            // Reverse order, so allocation hands out low slots first.
            free: (0..capacity as i32).rev().collect(),
        }
    }

    pub fn alloc(&mut self, entry: FdEntry) -> Option<i32> {
        let slot = self.free.pop()?;
        self.entries[slot as usize] = Some(entry);
        Some(slot)
    }

    pub fn get(&self, slot: i32) -> Option<&FdEntry> {
        self.entries.get(slot as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: i32) -> Option<&mut FdEntry> {
        self.entries.get_mut(slot as usize)?.as_mut()
    }

    pub fn release(&mut self, slot: i32) -> Option<FdEntry> {
        let entry = self.entries.get_mut(slot as usize)?.take()?;
        self.free.push(slot);
        Some(entry)
    }
}

/// Preallocated stream slot; `fd` is -1 while inactive. The intercept
/// predicate is a pointer-range test against the slot array.
#[repr(C)]
pub struct StreamSlot {
    pub sid: i32,
    pub fd: i64,
}

/// Directory stream slot; `fid` is -1 while inactive.
#[repr(C)]
pub struct DirStreamSlot {
    pub dirid: i32,
    pub fid: i32,
    pub pos: u64,
}

pub struct Streams<S> {
    slots: Box<[S]>,
    free: Vec<i32>,
}

impl Streams<StreamSlot> {
    pub fn new(capacity: usize) -> Streams<StreamSlot> {
        let slots = (0..capacity as i32)
            .map(|sid| StreamSlot { sid, fd: -1 })
            .collect();
        Streams {
            slots,
            free: (0..capacity as i32).rev().collect(),
        }
    }
}

impl Streams<DirStreamSlot> {
    pub fn new_dir(capacity: usize) -> Streams<DirStreamSlot> {
        let slots = (0..capacity as i32)
            .map(|dirid| DirStreamSlot {
                dirid,
                fid: -1,
                pos: 0,
            })
            .collect();
        Streams {
            slots,
            free: (0..capacity as i32).rev().collect(),
        }
    }
}

impl<S> Streams<S> {
    /// True when `ptr` points into our preallocated slot array.
    pub fn contains_ptr(&self, ptr: *const S) -> bool {
        let start = self.slots.as_ptr();
        let end = unsafe { start.add(self.slots.len()) };
        ptr >= start && ptr < end
    }

    pub fn alloc(&mut self) -> Option<&mut S> {
        let slot = self.free.pop()?;
        Some(&mut self.slots[slot as usize])
    }

    pub fn release(&mut self, index: i32) {
        self.free.push(index);
    }

    pub fn slot(&self, index: i32) -> Option<&S> {
        self.slots.get(index as usize)
    }

    pub fn slot_mut(&mut self, index: i32) -> Option<&mut S> {
        self.slots.get_mut(index as usize)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fd_translation_is_a_bijection_above_the_limit() {
        let space = FdSpace::with_limit(1024);

        // Internal slots map to caller fds and back, losslessly.
        for internal in [0i32, 1, 17, 1023] {
            let exposed = space.expose(internal);
            assert!(exposed >= space.limit());
            assert_eq!(space.intercept(exposed), Some(internal));
        }

        // System fds below the limit always bypass.
        for fd in [0i64, 2, 1023] {
            assert_eq!(space.intercept(fd), None);
        }
        assert_eq!(space.intercept(-1), None);
        assert_eq!(space.intercept(1024), Some(0));
    }

    #[test]
    fn fd_table_allocates_lowest_first_and_reuses() {
        let mut table = FdTable::new(4);
        let entry = || FdEntry {
            fid: 0,
            pos: 0,
            read: true,
            write: false,
            append: false,
            file: tempfile::tempfile().unwrap(),
            fmap: None,
        };

        let a = table.alloc(entry()).unwrap();
        let b = table.alloc(entry()).unwrap();
        assert_eq!((a, b), (0, 1));

        table.release(a).unwrap();
        assert_eq!(table.alloc(entry()), Some(0));
        assert!(table.get(1).is_some());
    }

    #[test]
    fn stream_pointer_ranges_discriminate() {
        let streams = Streams::<StreamSlot>::new(8);
        let inside = streams.slot(3).unwrap() as *const StreamSlot;
        assert!(streams.contains_ptr(inside));

        let outside = StreamSlot { sid: 0, fd: -1 };
        assert!(!streams.contains_ptr(&outside as *const StreamSlot));

        let other = Streams::<StreamSlot>::new(8);
        assert!(!streams.contains_ptr(other.slot(0).unwrap() as *const StreamSlot));
    }
}
