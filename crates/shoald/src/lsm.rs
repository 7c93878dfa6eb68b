//! The local storage manager: one real file on the node's backing store
//! per logical file, reference-counted across the writers of this node,
//! with harvested fmaps published to readers through per-inode
//! shared-memory regions.

use crate::mds::Mds;
use crate::{Error, Result};
use proto_shoal::{errno, shm_name, Fmap, StatSnap};
use proto_shoal::wire::Wire;
use shoal_shm::Region;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::RwLock;

pub const MAX_FILETAB_SIZE: usize = 64;

struct FileSlot {
    rpath: String,
    ino: u64,
    refs: u32,
}

/// Writer reference table, capacity-bounded. Slots clear and become
/// reusable the moment their count returns to zero.
#[derive(Default)]
pub struct FileTab {
    slots: Vec<Option<FileSlot>>,
}

pub enum Unref {
    /// No writer entry; a read-only open is being closed.
    NotTracked,
    Remaining(u32),
    /// Last writer gone: the slot was cleared, here is its path.
    Last(String),
}

impl FileTab {
    fn find(&self, ino: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map(|s| s.ino) == Some(ino))
    }

    pub fn add_ref(&mut self, ino: u64, rpath: &str) -> Result<u32> {
        if let Some(index) = self.find(ino) {
            let slot = self.slots[index].as_mut().unwrap();
            slot.refs += 1;
            tracing::debug!(ino, refs = slot.refs, "filetab ref");
            return Ok(slot.refs);
        }

        let slot = FileSlot {
            rpath: rpath.to_string(),
            ino,
            refs: 1,
        };
        match self.slots.iter().position(Option::is_none) {
            Some(free) => self.slots[free] = Some(slot),
            None if self.slots.len() < MAX_FILETAB_SIZE => self.slots.push(Some(slot)),
            None => {
                tracing::error!(ino, "filetab is full");
                return Err(Error::Errno(errno::ENOMEM));
            }
        }
        tracing::debug!(ino, rpath, "filetab new ref");
        Ok(1)
    }

    pub fn unref(&mut self, ino: u64) -> Unref {
        let Some(index) = self.find(ino) else {
            return Unref::NotTracked;
        };
        let slot = self.slots[index].as_mut().unwrap();
        slot.refs -= 1;
        tracing::debug!(ino, refs = slot.refs, "filetab unref");

        if slot.refs > 0 {
            return Unref::Remaining(slot.refs);
        }
        let slot = self.slots[index].take().unwrap();
        Unref::Last(slot.rpath)
    }

    pub fn rpath(&self, ino: u64) -> Option<String> {
        let index = self.find(ino)?;
        Some(self.slots[index].as_ref().unwrap().rpath.clone())
    }
}

/// A reader-side published fmap; the region stays mapped so the server
/// keeps write capability for later replacement.
struct Published {
    rpath: String,
    region: Region,
}

pub struct Lsm {
    rank: u32,
    root: PathBuf,
    mount_lock: tokio::sync::Mutex<()>,
    filetab: RwLock<FileTab>,
    published: RwLock<HashMap<u64, Published>>,
}

impl Lsm {
    pub fn new(rank: u32, root: PathBuf) -> Lsm {
        tracing::info!(root = %root.display(), "lsm initialized");
        Lsm {
            rank,
            root,
            mount_lock: tokio::sync::Mutex::new(()),
            filetab: RwLock::new(FileTab::default()),
            published: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Backing-store path of a mount path.
    pub fn realpath(&self, pathname: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.root.display(), pathname))
    }

    /// Mount path of a backing-store path.
    fn conpath(&self, rpath: &str) -> String {
        rpath[self.root.display().to_string().len()..].to_string()
    }

    /// Make sure the mountpoint directory exists on the backing store.
    /// Serialized across clients and idempotent.
    pub async fn mount(&self, mountpoint: &str, client: u32) -> Result<()> {
        let _guard = self.mount_lock.lock().await;
        let conpath = self.realpath(mountpoint);
        tracing::debug!(mountpoint, client, conpath = %conpath.display(), "mount");

        match std::fs::create_dir_all(&conpath) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Server-side open. Writers are reference-counted; readers get the
    /// merged fmap fetched from its owner and published for mmap.
    pub async fn open(&self, mds: &Mds, pathname: &str, flags: i32, mode: u32) -> Result<()> {
        let rpath = self.realpath(pathname);
        let accmode = flags & libc::O_ACCMODE;
        let rdonly = accmode == libc::O_RDONLY && flags & (libc::O_CREAT | libc::O_TRUNC) == 0;

        if rdonly {
            // Reader: the file may never have been written on this node.
            // Materialize it at the merged size so local preads see holes
            // as zeros, then publish the fmap keyed by the local inode.
            let fmap = mds.getfmap(pathname).await?;

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&rpath)?;
            let md = file.metadata()?;
            if md.size() < fmap.sb.size {
                file.set_len(fmap.sb.size)?;
            }
            let ino = md.ino();

            return self.publish(ino, rpath.display().to_string(), &fmap);
        }

        if flags & libc::O_CREAT != 0 {
            match mds.create(pathname).await {
                Ok(()) => {}
                // Some peer created the name already; opening it for
                // write is still fine under the laminate-on-close model.
                Err(err) if err.errno() == errno::EEXIST => {}
                Err(err) => return Err(err),
            }
        } else {
            if !mds.search(pathname).await? {
                return Err(Error::Errno(errno::ENOENT));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(&rpath)?;
        let ino = file.metadata()?.ino();

        self.filetab
            .write()
            .unwrap()
            .add_ref(ino, &rpath.display().to_string())?;
        Ok(())
    }

    /// Server-side close: drop one writer reference; when the last one
    /// goes, harvest the backing file into the MDS.
    pub async fn close(&self, mds: &Mds, ino: u64) -> Result<()> {
        let unref = self.filetab.write().unwrap().unref(ino);
        match unref {
            Unref::NotTracked | Unref::Remaining(_) => Ok(()),
            Unref::Last(rpath) => {
                let pathname = self.conpath(&rpath);
                tracing::debug!(ino, %pathname, "last writer closed; harvesting");
                mds.addfmap(&pathname, std::path::Path::new(&rpath)).await
            }
        }
    }

    pub async fn stat(&self, mds: &Mds, ino: u64) -> Result<StatSnap> {
        let rpath = self
            .rpath_of_ino(ino)
            .ok_or(Error::Errno(errno::ENOENT))?;
        mds.stat(&self.conpath(&rpath)).await
    }

    /// The backing path an inode maps to, whether opened by writers or
    /// published to readers.
    pub fn rpath_of_ino(&self, ino: u64) -> Option<String> {
        if let Some(rpath) = self.filetab.read().unwrap().rpath(ino) {
            return Some(rpath);
        }
        self.published
            .read()
            .unwrap()
            .get(&ino)
            .map(|p| p.rpath.clone())
    }

    /// Put the fmap where clients can mmap it: the per-inode region.
    /// Replaces any previous publication (a region's size is fixed at
    /// creation, so a grown fmap needs a fresh region).
    fn publish(&self, ino: u64, rpath: String, fmap: &Fmap) -> Result<()> {
        let name = shm_name::fmap(ino);
        let bytes = fmap.to_bytes();

        let mut published = self.published.write().unwrap();
        if let Some(previous) = published.remove(&ino) {
            drop(previous);
            let _ = Region::unlink(&name);
        }

        let region = Region::create(&name, bytes.len())?;
        unsafe { region.as_mut_slice() }.copy_from_slice(&bytes);

        tracing::debug!(ino, %name, extents = fmap.extents.len(), "published fmap");
        published.insert(ino, Published { rpath, region });
        Ok(())
    }

    /// Drop every published region (shutdown path).
    pub fn unpublish_all(&self) {
        let mut published = self.published.write().unwrap();
        for (ino, _entry) in published.drain() {
            let _ = Region::unlink(&shm_name::fmap(ino));
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filetab_counts_and_clears_on_last_unref() {
        let mut tab = FileTab::default();
        assert_eq!(tab.add_ref(7, "/store/m/f").unwrap(), 1);
        assert_eq!(tab.add_ref(7, "/store/m/f").unwrap(), 2);

        assert!(matches!(tab.unref(7), Unref::Remaining(1)));
        match tab.unref(7) {
            Unref::Last(rpath) => assert_eq!(rpath, "/store/m/f"),
            _ => panic!("expected last unref"),
        }

        // The slot is reusable afterward.
        assert!(tab.rpath(7).is_none());
        assert!(matches!(tab.unref(7), Unref::NotTracked));
        assert_eq!(tab.add_ref(8, "/store/m/g").unwrap(), 1);
    }

    #[test]
    fn filetab_capacity_is_bounded() {
        let mut tab = FileTab::default();
        for ino in 0..MAX_FILETAB_SIZE as u64 {
            tab.add_ref(ino, "/store/x").unwrap();
        }
        assert_eq!(
            tab.add_ref(u64::MAX, "/store/y").unwrap_err().errno(),
            errno::ENOMEM
        );

        // Freeing any slot makes room again.
        assert!(matches!(tab.unref(3), Unref::Last(_)));
        tab.add_ref(u64::MAX, "/store/y").unwrap();
    }
}
