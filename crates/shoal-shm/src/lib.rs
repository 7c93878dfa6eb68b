//! Named, size-bounded process-shared memory regions, plus the two
//! primitives that live inside them: a spin-lock small enough to lay out in
//! a `repr(C)` struct, and a free-id stack.
//!
//! A region's lifetime is decoupled from attach/detach: dropping a `Region`
//! unmaps it, while [`Region::unlink`] removes the name so no later process
//! can reattach. A freshly created region is zero-filled by the kernel;
//! callers use a magic word at a known offset to tell a new region from one
//! a previous process already populated.

use std::ffi::CString;
use std::io;

mod lock;
pub use lock::{SpinLock, SpinLockGuard};

mod stack;
pub use stack::IdStack;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shm region name {0:?} is not representable")]
    BadName(String),
    #[error("shm_open({name}) failed")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("ftruncate({name}, {len}) failed")]
    Truncate {
        name: String,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("mmap({name}) failed")]
    Map {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("shm_unlink({name}) failed")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<Ok> = std::result::Result<Ok, Error>;

/// An attached shared-memory region.
pub struct Region {
    name: String,
    addr: *mut u8,
    len: usize,
}

// The mapping is plain process-shared bytes; all synchronization happens
// through the atomics the callers place inside it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn shm_path(name: &str) -> Result<CString> {
    CString::new(format!("/{name}")).map_err(|_| Error::BadName(name.to_string()))
}

impl Region {
    /// Create the region, or attach to it if some process created it
    /// already. Either way the mapping is read-write and `len` bytes long.
    pub fn create(name: &str, len: usize) -> Result<Region> {
        let path = shm_path(name)?;

        let fd = unsafe {
            libc::shm_open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                0o640 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(Error::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Truncate {
                name: name.to_string(),
                len,
                source,
            });
        }

        Self::map(name, fd, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    /// Attach read-only to a region some other process created. The length
    /// is taken from the backing object.
    pub fn attach_ro(name: &str) -> Result<Region> {
        let path = shm_path(name)?;

        let fd = unsafe { libc::shm_open(path.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(Error::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let mut sb: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut sb) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Open {
                name: name.to_string(),
                source,
            });
        }

        Self::map(name, fd, sb.st_size as usize, libc::PROT_READ)
    }

    /// Attach read-write to a region some other process created.
    pub fn attach(name: &str) -> Result<Region> {
        let path = shm_path(name)?;

        let fd = unsafe { libc::shm_open(path.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let mut sb: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut sb) } != 0 {
            let source = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Open {
                name: name.to_string(),
                source,
            });
        }

        Self::map(name, fd, sb.st_size as usize, libc::PROT_READ | libc::PROT_WRITE)
    }

    fn map(name: &str, fd: libc::c_int, len: usize, prot: libc::c_int) -> Result<Region> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // The mapping holds its own reference to the object.
        unsafe { libc::close(fd) };

        if addr == libc::MAP_FAILED {
            return Err(Error::Map {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        tracing::debug!(name, len, "attached shm region");

        Ok(Region {
            name: name.to_string(),
            addr: addr as *mut u8,
            len,
        })
    }

    /// Remove the name from the system so no later process can reattach.
    /// Existing mappings stay valid until their owners drop them.
    pub fn unlink(name: &str) -> Result<()> {
        let path = shm_path(name)?;
        if unsafe { libc::shm_unlink(path.as_ptr()) } != 0 {
            return Err(Error::Unlink {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// View the region as bytes. Callers must not read fields another
    /// process concurrently mutates except through the atomics laid out in
    /// the region.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.addr, self.len)
    }

    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.addr, self.len)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) } != 0 {
            tracing::warn!(
                name = %self.name,
                error = %io::Error::last_os_error(),
                "munmap failed",
            );
        }
    }
}

/// The system page size, used for the superblock's alignment invariant.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_name(tag: &str) -> String {
        // Tie the name to the pid so parallel test runs don't collide.
        format!("shoal-test-{tag}-{}", std::process::id())
    }

    #[test]
    fn create_attach_and_unlink() {
        let name = scratch_name("region");
        let region = Region::create(&name, 4096).unwrap();
        assert_eq!(region.len(), 4096);

        // Freshly created regions are zero-filled.
        assert!(unsafe { region.as_slice() }.iter().all(|b| *b == 0));

        unsafe { region.as_mut_slice()[17] = 0xab };

        // A second attach observes the write.
        let other = Region::attach_ro(&name).unwrap();
        assert_eq!(unsafe { other.as_slice() }[17], 0xab);

        // Unlink removes the name; the live mappings stay usable.
        Region::unlink(&name).unwrap();
        assert_eq!(unsafe { other.as_slice() }[17], 0xab);
        assert!(Region::attach_ro(&name).is_err());
    }

    #[test]
    fn create_is_attach_when_the_region_exists() {
        let name = scratch_name("reattach");
        let first = Region::create(&name, 8192).unwrap();
        unsafe { first.as_mut_slice()[0] = 1 };

        let second = Region::create(&name, 8192).unwrap();
        assert_eq!(unsafe { second.as_slice() }[0], 1);

        Region::unlink(&name).unwrap();
    }
}
