//! The intercepted filesystem surface: open/close/read/write/lseek/fsync/
//! stat/mkdir/truncate/unlink against the backing store, with the write
//! index, the extent trees, and the per-inode fmap regions doing the
//! bookkeeping around the raw I/O.

use crate::client::{Client, Tables};
use crate::{Error, Result};
use proto_shoal::index::IndexEntry;
use proto_shoal::{errno, gfid as gfid_of, shm_name, Fmap, StatSnap};
use proto_shoal::wire::Wire;
use shoal_shm::Region;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};

impl Client {
    /// Open `path` inside the mount. Returns the caller-visible fd (offset
    /// into our partition of the fd space).
    pub fn open(&self, path: &str, flags: i32, mode: u32) -> Result<i64> {
        if !self.intercepts_path(path) {
            return Err(Error::Errno(errno::EINVAL));
        }
        if path.len() + 1 > proto_shoal::MAX_FILENAME {
            return Err(Error::Errno(errno::ENAMETOOLONG));
        }

        let gfid = gfid_of(path);
        let mut fid = self.superblock.find_fid(path);

        let gattr = match self.rpc_metaget(gfid) {
            Ok(attr) => Some(attr),
            Err(err) if err.errno() == errno::ENOENT => None,
            Err(err) => return Err(err),
        };

        let accmode = flags & libc::O_ACCMODE;
        let writable =
            accmode != libc::O_RDONLY || flags & (libc::O_CREAT | libc::O_TRUNC) != 0;

        // Never let a laminated file be opened in any way that could write.
        if let Some(attr) = &gattr {
            if attr.is_laminated && (writable || flags & libc::O_APPEND != 0) {
                return Err(Error::Errno(errno::EROFS));
            }
        }

        // Present locally but deleted globally: a peer unlinked it and no
        // invalidation broadcast exists, so reconcile here.
        if let (Some(stale), None) = (fid, &gattr) {
            tracing::debug!(path, fid = stale, "local entry is globally gone; invalidating");
            self.fid_invalidate(stale);
            fid = None;
        }

        if fid.is_none() {
            if flags & libc::O_CREAT == 0 && gattr.is_none() {
                return Err(Error::Errno(errno::ENOENT));
            }
            let created = self.fid_create(path, gfid, mode)?;
            if gattr.is_none() {
                self.rpc_metaset(true, self.attr_from_fid(created))?;
            }
            fid = Some(created);
        }
        let fid = fid.unwrap();

        // Server side: backing file, MDS entries, fmap publication.
        self.rpc_lsm_open(path, flags, mode)?;

        let rdonly = accmode == libc::O_RDONLY && flags & (libc::O_CREAT | libc::O_TRUNC) == 0;

        let file = OpenOptions::new()
            .read(true)
            .write(!rdonly)
            .create(flags & libc::O_CREAT != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode)
            .open(self.conpath(path))?;
        let ino = file.metadata()?.ino();

        if flags & libc::O_TRUNC != 0 {
            self.superblock.with_meta(fid, |meta| {
                meta.global_size = 0;
                meta.log_size = 0;
            });
        }

        // Readers consult the fmap the server just published for this
        // inode; writers read their own data back directly.
        let fmap = if rdonly { Some(self.map_fmap(ino)?) } else { None };

        let pos = if flags & libc::O_APPEND != 0 {
            gattr.as_ref().map(|attr| attr.size).unwrap_or(0)
        } else {
            0
        };

        let mut tables = self.tables.lock().unwrap();
        if flags & libc::O_TRUNC != 0 {
            tables.locals[fid as usize].extents_sync.clear();
            tables.locals[fid as usize].extents.clear();
        }
        let slot = tables
            .fds
            .alloc(crate::fd::FdEntry {
                fid,
                pos,
                read: accmode != libc::O_WRONLY,
                write: accmode != libc::O_RDONLY,
                append: flags & libc::O_APPEND != 0,
                file,
                fmap,
            })
            .ok_or(Error::Errno(errno::ENFILE))?;

        Ok(self.fdspace.expose(slot))
    }

    /// Attach and decode the per-inode fmap region.
    fn map_fmap(&self, ino: u64) -> Result<Fmap> {
        let region = Region::attach_ro(&shm_name::fmap(ino))?;
        let bytes = bytes::Bytes::copy_from_slice(unsafe { region.as_slice() });
        let fmap = Fmap::from_bytes(bytes).map_err(|err| {
            tracing::error!(ino, %err, "fmap region is corrupt");
            Error::Errno(errno::EIO)
        })?;
        tracing::debug!(ino, extents = fmap.extents.len(), size = fmap.sb.size, "mapped fmap");
        Ok(fmap)
    }

    /// Close a caller fd. A writer close flushes pending index records and
    /// notifies the server, whose unref may trigger the harvest.
    pub fn close(&self, fd: i64) -> Result<()> {
        let slot = self
            .fdspace
            .intercept(fd)
            .ok_or(Error::Errno(errno::EBADF))?;

        let entry = {
            let mut tables = self.tables.lock().unwrap();
            tables.fds.release(slot).ok_or(Error::Errno(errno::EBADF))?
        };

        if !entry.write {
            return Ok(());
        }

        let fid = entry.fid;
        let ino = entry.file.metadata()?.ino();
        drop(entry);

        // The server folds sizes out of our index at sync; make sure it
        // sees everything before the fmap is harvested.
        if self.superblock.meta(fid).needs_sync == 1 {
            self.sync_fid(fid)?;
        }
        self.rpc_lsm_close(ino)
    }

    /// Write at the descriptor's position, advancing it.
    pub fn write(&self, fd: i64, buf: &[u8]) -> Result<usize> {
        let slot = self
            .fdspace
            .intercept(fd)
            .ok_or(Error::Errno(errno::EBADF))?;

        let mut tables = self.tables.lock().unwrap();
        let Tables { fds, locals, .. } = &mut *tables;
        let entry = fds.get_mut(slot).ok_or(Error::Errno(errno::EBADF))?;
        if !entry.write {
            return Err(Error::Errno(errno::EBADF));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let fid = entry.fid;
        let pos = entry.pos;
        let gfid = self.superblock.meta(fid).gfid;

        // Per-file serialization: the append to the local log and the
        // metadata update happen under the file's shared lock.
        let io = self.superblock.with_meta(fid, |meta| {
            entry.file.write_all_at(buf, pos).map(|()| {
                let log_pos = meta.log_size;
                meta.log_size += buf.len() as u64;
                meta.needs_sync = 1;
                log_pos
            })
        });
        let log_pos = io?;

        let record = IndexEntry {
            gfid,
            _pad: 0,
            file_pos: pos,
            log_pos,
            length: buf.len() as u64,
        };
        if !self.superblock.index_append(record) {
            // Ring at capacity: flush to the server, then retry.
            self.rpc_sync()?;
            if !self.superblock.index_append(record) {
                return Err(Error::Errno(errno::ENOSPC));
            }
        }

        let end = pos + buf.len() as u64;
        if self.cfg.flatten_writes {
            locals[fid as usize].extents_sync.insert(pos, end);
        }
        if self.cfg.local_extents {
            locals[fid as usize].extents.insert(pos, end);
        }

        entry.pos = end;
        Ok(buf.len())
    }

    /// Read at the descriptor's position, advancing it. Data is served
    /// from the local backing file whenever the fmap (or the local extent
    /// tree) says every byte is here; otherwise the server assembles the
    /// range into the recv region.
    pub fn read(&self, fd: i64, buf: &mut [u8]) -> Result<usize> {
        let slot = self
            .fdspace
            .intercept(fd)
            .ok_or(Error::Errno(errno::EBADF))?;

        let mut tables = self.tables.lock().unwrap();
        let Tables { fds, locals, .. } = &mut *tables;
        let entry = fds.get_mut(slot).ok_or(Error::Errno(errno::EBADF))?;
        if !entry.read {
            return Err(Error::Errno(errno::EBADF));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let fid = entry.fid;
        let pos = entry.pos;
        let want = buf.len() as u64;

        let local_covered = self.cfg.local_extents
            && locals[fid as usize].extents.covers(pos, pos + want);

        let n = if local_covered {
            pread(&entry.file, buf, pos)?
        } else if let Some(fmap) = &entry.fmap {
            let size = fmap.sb.size;
            if pos >= size {
                0
            } else {
                let end = (pos + want).min(size);
                let len = end - pos;
                if remote_needed(fmap, self.server_rank, pos, end) {
                    let gfid = self.superblock.meta(fid).gfid;
                    let nread = self.rpc_read(gfid, pos, len)? as usize;
                    let recv = unsafe { self.recv.as_slice() };
                    buf[..nread].copy_from_slice(&recv[..nread]);
                    nread
                } else {
                    pread(&entry.file, &mut buf[..len as usize], pos)?
                }
            }
        } else {
            pread(&entry.file, buf, pos)?
        };

        entry.pos = pos + n as u64;
        Ok(n)
    }

    /// Positioned batch read: every range is answered through one server
    /// round trip, landing back-to-back in the recv region. Returns the
    /// total bytes delivered; ranges clipped at EOF come back zero-filled
    /// past the clip.
    pub fn mread(&self, fd: i64, reqs: &mut [(u64, &mut [u8])]) -> Result<u64> {
        let slot = self
            .fdspace
            .intercept(fd)
            .ok_or(Error::Errno(errno::EBADF))?;

        let tables = self.tables.lock().unwrap();
        let entry = tables.fds.get(slot).ok_or(Error::Errno(errno::EBADF))?;
        if !entry.read {
            return Err(Error::Errno(errno::EBADF));
        }
        let gfid = self.superblock.meta(entry.fid).gfid;
        drop(tables);

        let ranges: Vec<proto_shoal::messages::MreadRange> = reqs
            .iter()
            .map(|(offset, buf)| proto_shoal::messages::MreadRange {
                gfid,
                offset: *offset,
                length: buf.len() as u64,
            })
            .collect();
        let total = self.rpc_mread(ranges)?;

        let recv = unsafe { self.recv.as_slice() };
        let mut off = 0usize;
        for (_, buf) in reqs.iter_mut() {
            buf.copy_from_slice(&recv[off..off + buf.len()]);
            off += buf.len();
        }
        Ok(total)
    }

    pub fn lseek(&self, fd: i64, offset: i64, whence: i32) -> Result<u64> {
        let slot = self
            .fdspace
            .intercept(fd)
            .ok_or(Error::Errno(errno::EBADF))?;

        // SEEK_END consults the file size, which may sync and RPC; compute
        // it before taking the table lock.
        let (fid, pos) = {
            let tables = self.tables.lock().unwrap();
            let entry = tables.fds.get(slot).ok_or(Error::Errno(errno::EBADF))?;
            (entry.fid, entry.pos)
        };

        let base = match whence {
            libc::SEEK_SET => 0i64,
            libc::SEEK_CUR => pos as i64,
            libc::SEEK_END => self.fid_filesize(fid)? as i64,
            _ => return Err(Error::Errno(errno::EINVAL)),
        };
        let target = base
            .checked_add(offset)
            .ok_or(Error::Errno(errno::EINVAL))?;
        if target < 0 {
            return Err(Error::Errno(errno::EINVAL));
        }

        let mut tables = self.tables.lock().unwrap();
        let entry = tables.fds.get_mut(slot).ok_or(Error::Errno(errno::EBADF))?;
        entry.pos = target as u64;
        Ok(entry.pos)
    }

    pub fn fsync(&self, fd: i64) -> Result<()> {
        let slot = self
            .fdspace
            .intercept(fd)
            .ok_or(Error::Errno(errno::EBADF))?;

        let fid = {
            let tables = self.tables.lock().unwrap();
            let entry = tables.fds.get(slot).ok_or(Error::Errno(errno::EBADF))?;
            entry.file.sync_data()?;
            entry.fid
        };

        if self.superblock.meta(fid).needs_sync == 1 {
            self.sync_fid(fid)?;
        }
        Ok(())
    }

    /// Flush this client's write-index records and clear the file's dirty
    /// flag.
    pub(crate) fn sync_fid(&self, fid: i32) -> Result<()> {
        self.rpc_sync()?;
        self.superblock.with_meta(fid, |meta| meta.needs_sync = 0);
        Ok(())
    }

    /// Laminated files answer from the cached global size; otherwise the
    /// server is asked, after any pending writes are synced.
    pub fn fid_filesize(&self, fid: i32) -> Result<u64> {
        let meta = self.superblock.meta(fid);
        if meta.is_laminated != 0 {
            return Ok(meta.global_size);
        }
        if meta.needs_sync != 0 {
            self.sync_fid(fid)?;
        }
        self.rpc_filesize(meta.gfid)
    }

    /// Stat through the backing store, with size and times sourced from
    /// the server's view.
    pub fn stat(&self, path: &str) -> Result<StatSnap> {
        if !self.intercepts_path(path) {
            return Err(Error::Errno(errno::EINVAL));
        }

        match std::fs::metadata(self.conpath(path)) {
            Ok(md) => {
                let mut sb = statsnap_from_metadata(&md);
                match self.rpc_lsm_stat(md.ino()) {
                    Ok(server) => {
                        sb.size = server.size;
                        sb.blocks = server.blocks;
                        sb.atime = server.atime;
                        sb.mtime = server.mtime;
                        sb.ctime = server.ctime;
                    }
                    Err(err) => {
                        // No fmap yet (nothing harvested): the attribute
                        // record and the synced length still answer.
                        tracing::debug!(path, %err, "lsm stat unavailable; using attrs");
                        let gfid = gfid_of(path);
                        if let Ok(attr) = self.rpc_metaget(gfid) {
                            sb.atime = attr.atime;
                            sb.mtime = attr.mtime;
                            sb.ctime = attr.ctime;
                            sb.size = self.rpc_filesize(gfid).unwrap_or(attr.size);
                        }
                    }
                }
                Ok(sb)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Never materialized on this node; the global record is
                // all there is.
                let gfid = gfid_of(path);
                let attr = self.rpc_metaget(gfid)?;
                let mut sb = statsnap_from_attr(&attr);
                sb.size = self.rpc_filesize(gfid).unwrap_or(attr.size);
                Ok(sb)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
        if !self.intercepts_path(path) {
            return Err(Error::Errno(errno::EINVAL));
        }
        if self.superblock.find_fid(path).is_some() {
            return Err(Error::Errno(errno::EEXIST));
        }
        match self.rpc_metaget(gfid_of(path)) {
            Ok(_) => return Err(Error::Errno(errno::EEXIST)),
            Err(err) if err.errno() == errno::ENOENT => {}
            Err(err) => return Err(err),
        }

        self.fid_create_directory(path)?;
        match std::fs::create_dir(self.conpath(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let fid = self
            .superblock
            .find_fid(path)
            .ok_or(Error::Errno(errno::ENOENT))?;
        if self.superblock.meta(fid).mode & libc::S_IFDIR == 0 {
            return Err(Error::Errno(errno::ENOTDIR));
        }
        if !self.fid_is_dir_empty(path) {
            return Err(Error::Errno(errno::EEXIST));
        }

        self.rpc_unlink(gfid_of(path))?;
        self.fid_invalidate(fid);
        match std::fs::remove_dir(self.conpath(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Truncate rejects laminated files; otherwise the server is told
    /// first and the cached global size follows. The local log keeps its
    /// length: bytes past the cut are simply orphaned.
    pub fn truncate(&self, path: &str, length: u64) -> Result<()> {
        let gfid = gfid_of(path);
        let fid = self.superblock.find_fid(path);

        let laminated = match fid {
            Some(fid) => self.superblock.meta(fid).is_laminated != 0,
            None => self
                .rpc_metaget(gfid)
                .map(|attr| attr.is_laminated)
                .unwrap_or(false),
        };
        if laminated {
            return Err(Error::Errno(errno::EINVAL));
        }

        self.rpc_truncate(gfid, length)?;
        if let Some(fid) = fid {
            self.superblock.with_meta(fid, |meta| meta.global_size = length);
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let gfid = gfid_of(path);
        if let Some(fid) = self.superblock.find_fid(path) {
            if self.superblock.meta(fid).mode & libc::S_IFDIR != 0 {
                return Err(Error::Errno(errno::EISDIR));
            }
        }

        self.rpc_unlink(gfid)?;
        if let Some(fid) = self.superblock.find_fid(path) {
            self.fid_invalidate(fid);
        }
        match std::fs::remove_file(self.conpath(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Change permission bits. Clearing every write bit is the lamination
    /// trigger: the file becomes read-only and globally visible, and its
    /// global size freezes.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let gfid = gfid_of(path);
        let mut attr = self.rpc_metaget(gfid)?;
        attr.mode = (attr.mode & libc::S_IFMT) | (mode & 0o7777);
        self.rpc_metaset(false, attr)?;

        if mode & 0o222 == 0 {
            self.rpc_laminate(gfid)?;
            if let Some(fid) = self.superblock.find_fid(path) {
                let attr = self.rpc_metaget(gfid)?;
                self.superblock.with_meta(fid, |meta| {
                    meta.is_laminated = 1;
                    meta.global_size = attr.size;
                });
            }
            tracing::debug!(path, "laminated");
        }
        Ok(())
    }
}

/// True when some byte of `[start, end)` lives on a rank other than ours.
fn remote_needed(fmap: &Fmap, local_rank: u32, start: u64, end: u64) -> bool {
    fmap.extents
        .iter()
        .any(|e| e.rank != local_rank && e.offset < end && start < e.end())
}

/// Positioned read that keeps going through short reads; returns the byte
/// count actually read (short only at EOF).
fn pread(file: &File, buf: &mut [u8], pos: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], pos + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

pub(crate) fn statsnap_from_metadata(md: &std::fs::Metadata) -> StatSnap {
    StatSnap {
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
    }
}

fn statsnap_from_attr(attr: &proto_shoal::messages::FileAttr) -> StatSnap {
    StatSnap {
        mode: attr.mode as u64,
        nlink: 1,
        uid: attr.uid as u64,
        gid: attr.gid as u64,
        size: attr.size,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proto_shoal::{FmapExtent, StatSnap};

    fn fmap(extents: Vec<FmapExtent>) -> Fmap {
        Fmap::new(0, StatSnap::default(), extents)
    }

    #[test]
    fn remote_detection_honors_rank_and_overlap() {
        let map = fmap(vec![
            FmapExtent {
                rank: 0,
                offset: 0,
                length: 4096,
            },
            FmapExtent {
                rank: 1,
                offset: 4096,
                length: 4096,
            },
        ]);

        assert!(!remote_needed(&map, 0, 0, 4096));
        assert!(remote_needed(&map, 0, 0, 4097));
        assert!(remote_needed(&map, 0, 6000, 6001));
        assert!(!remote_needed(&map, 1, 4096, 8192));
        // A hole is not remote; it reads back zeros locally.
        assert!(!remote_needed(&map, 0, 0, 4096));
    }

    #[test]
    fn pread_loops_to_fill_and_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"0123456789").unwrap();
        let file = File::open(&path).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(pread(&file, &mut buf, 3).unwrap(), 4);
        assert_eq!(&buf, b"3456");

        let mut buf = [0u8; 8];
        assert_eq!(pread(&file, &mut buf, 6).unwrap(), 4);
        assert_eq!(&buf[..4], b"6789");
    }
}
