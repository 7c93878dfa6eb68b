//! Client sessions and the handlers behind every client-facing operation.
//! A session is a mounted client: its id, its attached superblock (for the
//! write-index scan during sync) and its recv region (the landing zone for
//! read/mread assembly).

use crate::{Error, Result, ServerState};
use proto_shoal::index::IndexEntry;
use proto_shoal::messages as msg;
use proto_shoal::{errno, op, shm_name};
use shoal_rpc::Channel;
use shoal_shm::Region;
use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub struct Session {
    pub app_id: u32,
    pub client_id: u32,
    superblock: Region,
    recv: Region,
    index_count_offset: usize,
    index_entries_offset: usize,
    index_max_entries: usize,
}

impl Session {
    /// Copy of the client's live write-index records.
    pub fn index_snapshot(&self) -> Vec<IndexEntry> {
        let count = unsafe {
            let word = self.superblock.as_ptr().add(self.index_count_offset) as *const AtomicU64;
            (*word).load(Ordering::Acquire)
        }
        .min(self.index_max_entries as u64) as usize;

        let base = unsafe {
            self.superblock.as_ptr().add(self.index_entries_offset) as *const IndexEntry
        };
        (0..count)
            .map(|i| unsafe { std::ptr::read_volatile(base.add(i)) })
            .collect()
    }

    pub fn recv_len(&self) -> usize {
        self.recv.len()
    }

    fn recv_write(&self, offset: usize, data: &[u8]) {
        let slice = unsafe { self.recv.as_mut_slice() };
        slice[offset..offset + data.len()].copy_from_slice(data);
    }

    fn recv_zero(&self, offset: usize, len: usize) {
        let slice = unsafe { self.recv.as_mut_slice() };
        slice[offset..offset + len].fill(0);
    }
}

#[derive(Default)]
pub struct Sessions {
    map: RwLock<HashMap<u32, Arc<Session>>>,
}

impl Sessions {
    pub fn get(&self, client_id: u32) -> Result<Arc<Session>> {
        self.map
            .read()
            .unwrap()
            .get(&client_id)
            .cloned()
            .ok_or(Error::Errno(errno::EINVAL))
    }

    fn insert(&self, session: Session) {
        self.map
            .write()
            .unwrap()
            .insert(session.client_id, Arc::new(session));
    }

    fn remove(&self, client_id: u32) -> Option<Arc<Session>> {
        self.map.write().unwrap().remove(&client_id)
    }
}

impl ServerState {
    pub async fn op_mount(&self, req: msg::MountRequest) -> Result<msg::MountResponse> {
        self.lsm.mount(&req.mount_prefix, req.rank).await?;
        let app_id = proto_shoal::gfid(&req.mount_prefix);
        let client_id = self
            .next_client_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        tracing::info!(rank = req.rank, app_id, client_id, prefix = %req.mount_prefix, "client mounted");
        Ok(msg::MountResponse {
            status: 0,
            app_id,
            client_id,
            server_rank: self.rank,
        })
    }

    pub async fn op_attach(&self, req: msg::AttachRequest) -> Result<msg::AttachResponse> {
        let superblock = Region::attach(&shm_name::superblock(req.app_id, req.client_id))?;
        let recv = Region::attach(&shm_name::recv(req.app_id, req.client_id))?;

        if superblock.len() as u64 != req.super_size || recv.len() as u64 != req.recv_size {
            tracing::error!(
                client_id = req.client_id,
                "attach geometry mismatch with shared regions"
            );
            return Err(Error::Errno(errno::EINVAL));
        }

        self.sessions.insert(Session {
            app_id: req.app_id,
            client_id: req.client_id,
            superblock,
            recv,
            index_count_offset: req.index_count_offset as usize,
            index_entries_offset: req.index_entries_offset as usize,
            index_max_entries: req.index_max_entries as usize,
        });

        tracing::debug!(client_id = req.client_id, "attached client regions");
        Ok(msg::AttachResponse { status: 0 })
    }

    pub async fn op_unmount(&self, req: msg::UnmountRequest) -> Result<msg::UnmountResponse> {
        self.sessions.remove(req.client_id);
        tracing::info!(client_id = req.client_id, "client unmounted");
        Ok(msg::UnmountResponse { status: 0 })
    }

    pub async fn op_metaset(&self, req: msg::MetasetRequest) -> Result<msg::MetasetResponse> {
        self.attrs.set(req.create != 0, req.attr).await?;
        Ok(msg::MetasetResponse { status: 0 })
    }

    pub async fn op_metaget(&self, req: msg::MetagetRequest) -> Result<msg::MetagetResponse> {
        let attr = self.attrs.get(req.gfid).await?;
        Ok(msg::MetagetResponse { status: 0, attr })
    }

    /// Laminated files answer from the frozen attribute; otherwise the MDS
    /// entry carries the synced size.
    pub async fn op_filesize(&self, req: msg::FilesizeRequest) -> Result<msg::FilesizeResponse> {
        let attr = self.attrs.get(req.gfid).await?;
        let size = if attr.is_laminated {
            attr.size
        } else {
            match self.mds.filelen(&attr.filename).await {
                Ok(size) => size,
                Err(err) if err.errno() == errno::ENOENT => attr.size,
                Err(err) => return Err(err),
            }
        };
        Ok(msg::FilesizeResponse { status: 0, size })
    }

    pub async fn op_truncate(&self, req: msg::TruncateRequest) -> Result<msg::TruncateResponse> {
        let mut attr = self.attrs.get(req.gfid).await?;
        if attr.is_laminated {
            return Err(Error::Errno(errno::EINVAL));
        }

        attr.size = req.length;
        let pathname = attr.filename.clone();
        self.attrs.set(false, attr).await?;
        match self.mds.set_len(&pathname, req.length).await {
            Ok(()) => {}
            // Nothing synced yet; the attribute record is the whole truth.
            Err(err) if err.errno() == errno::ENOENT => {}
            Err(err) => return Err(err),
        }
        Ok(msg::TruncateResponse { status: 0 })
    }

    pub async fn op_unlink(&self, req: msg::UnlinkRequest) -> Result<msg::UnlinkResponse> {
        self.attrs.remove(req.gfid).await?;
        Ok(msg::UnlinkResponse { status: 0 })
    }

    /// Freeze the file: record the merged size and flip the laminated
    /// flag. From here on writable opens fail EROFS and truncate EINVAL.
    pub async fn op_laminate(&self, req: msg::LaminateRequest) -> Result<msg::LaminateResponse> {
        let mut attr = self.attrs.get(req.gfid).await?;
        let size = match self.mds.filelen(&attr.filename).await {
            Ok(size) => size.max(attr.size),
            Err(err) if err.errno() == errno::ENOENT => attr.size,
            Err(err) => return Err(err),
        };

        attr.size = size;
        attr.is_laminated = true;
        let pathname = attr.filename.clone();
        self.attrs.set(false, attr).await?;

        tracing::info!(gfid = req.gfid, %pathname, size, "laminated");
        Ok(msg::LaminateResponse { status: 0 })
    }

    /// Fold the client's write-index records into the metadata view: the
    /// MDS size of each touched name rises to the furthest byte written.
    pub async fn op_sync(&self, req: msg::SyncRequest) -> Result<msg::SyncResponse> {
        let session = self.sessions.get(req.client_id)?;
        let entries = session.index_snapshot();

        let mut sizes: HashMap<u32, u64> = HashMap::new();
        for entry in &entries {
            let end = entry.file_pos + entry.length;
            let size = sizes.entry(entry.gfid).or_insert(0);
            *size = (*size).max(end);
        }

        tracing::debug!(
            client_id = req.client_id,
            records = entries.len(),
            files = sizes.len(),
            "sync",
        );

        for (gfid, size) in sizes {
            let attr = match self.attrs.get(gfid).await {
                Ok(attr) => attr,
                Err(err) => {
                    tracing::warn!(gfid, %err, "sync record for unknown gfid");
                    continue;
                }
            };
            self.mds.fsync(&attr.filename, size).await?;
        }
        Ok(msg::SyncResponse { status: 0 })
    }

    pub async fn op_read(&self, req: msg::ReadRequest) -> Result<msg::ReadResponse> {
        let session = self.sessions.get(req.client_id)?;
        let nread = self
            .assemble(&session, req.gfid, req.offset, req.length, 0)
            .await?;
        Ok(msg::ReadResponse { status: 0, nread })
    }

    pub async fn op_mread(&self, req: msg::MreadRequest) -> Result<msg::MreadResponse> {
        let session = self.sessions.get(req.client_id)?;

        // Refuse before moving anything if the batch cannot fit.
        let wanted: u64 = req.ranges.iter().map(|r| r.length).sum();
        if wanted > session.recv_len() as u64 {
            return Err(Error::Errno(errno::ENOMEM));
        }

        let mut total = 0u64;
        let mut recv_off = 0usize;
        for range in &req.ranges {
            let nread = self
                .assemble(&session, range.gfid, range.offset, range.length, recv_off)
                .await?;
            // Ranges land back-to-back at their requested lengths, so the
            // client can find each answer without a layout table; a range
            // clipped at EOF zero-fills its tail.
            if nread < range.length {
                session.recv_zero(recv_off + nread as usize, (range.length - nread) as usize);
            }
            recv_off += range.length as usize;
            total += nread;
        }
        Ok(msg::MreadResponse { status: 0, total })
    }

    /// Assemble `[offset, offset+length)` of the file into the session's
    /// recv region at `recv_off`: local extents by reading our backing
    /// store, remote extents by chunk-reads to their owning rank, holes as
    /// zeros. Returns the bytes delivered (clipped at the merged size).
    async fn assemble(
        &self,
        session: &Session,
        gfid: u32,
        offset: u64,
        length: u64,
        recv_off: usize,
    ) -> Result<u64> {
        let attr = self.attrs.get(gfid).await?;
        let pathname = attr.filename;
        let fmap = self.mds.getfmap(&pathname).await?;

        let size = fmap.sb.size;
        if offset >= size {
            return Ok(0);
        }
        let end = (offset + length).min(size);
        if recv_off + (end - offset) as usize > session.recv_len() {
            return Err(Error::Errno(errno::ENOMEM));
        }

        let mut filled = 0u64;
        while offset + filled < end {
            let pos = offset + filled;
            match fmap.extent_at(pos) {
                Some(extent) => {
                    let take = (extent.end().min(end) - pos).min(self.meta_range_size as u64);
                    let data = if extent.rank == self.rank {
                        self.read_local(&pathname, pos, take)?
                    } else {
                        self.read_remote(extent.rank, &pathname, pos, take).await?
                    };
                    session.recv_write(recv_off + filled as usize, &data);
                    filled += take;
                }
                None => {
                    // A hole: zeros up to the next extent or the end.
                    let next = fmap
                        .extents
                        .iter()
                        .map(|e| e.offset)
                        .filter(|&o| o > pos)
                        .min()
                        .unwrap_or(end)
                        .min(end);
                    session.recv_zero(recv_off + filled as usize, (next - pos) as usize);
                    filled += next - pos;
                }
            }
        }
        Ok(filled)
    }

    fn read_local(&self, pathname: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let rpath = self.lsm.realpath(pathname);
        let file = std::fs::File::open(&rpath)?;

        let mut buf = vec![0u8; length as usize];
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break, // past EOF reads as zeros
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(buf)
    }

    /// Chunk-read from the rank owning the extent: register a writable
    /// sink, ask the owner to push into it, take the bytes.
    pub async fn read_remote(
        &self,
        rank: u32,
        pathname: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let channel = self.peers.channel(rank).await?;
        let sink = channel.bulk().register_rw(length as usize);

        let result: Result<msg::ChunkReadResponse> = channel
            .call(
                op::CHUNK_READ,
                &msg::ChunkReadRequest {
                    pathname: pathname.to_string(),
                    offset,
                    length,
                    sink: sink.as_ref(),
                },
            )
            .await
            .map_err(Into::into);

        match result.and_then(|resp| crate::check(resp.status)) {
            Ok(()) => channel
                .bulk()
                .take(sink)
                .ok_or(Error::Errno(errno::EIO)),
            Err(err) => {
                channel.bulk().unregister(sink);
                Err(err)
            }
        }
    }

    /// Serve a peer's chunk read out of our backing store, pushing the
    /// bytes into the sink it registered.
    pub async fn op_chunk_read(
        &self,
        peer: &Channel,
        req: msg::ChunkReadRequest,
    ) -> Result<msg::ChunkReadResponse> {
        let length = req.length.min(req.sink.len);
        let data = self.read_local(&req.pathname, req.offset, length)?;
        peer.push(req.sink, &data).await?;
        Ok(msg::ChunkReadResponse {
            status: 0,
            nread: length,
        })
    }

    pub async fn op_lsm_open(&self, req: msg::LsmOpenRequest) -> Result<msg::LsmOpenResponse> {
        self.lsm
            .open(&self.mds, &req.pathname, req.flags as i32, req.mode)
            .await?;
        Ok(msg::LsmOpenResponse { status: 0 })
    }

    pub async fn op_lsm_close(&self, req: msg::LsmCloseRequest) -> Result<msg::LsmCloseResponse> {
        self.lsm.close(&self.mds, req.ino).await?;
        Ok(msg::LsmCloseResponse { status: 0 })
    }

    pub async fn op_lsm_stat(&self, req: msg::LsmStatRequest) -> Result<msg::LsmStatResponse> {
        let sb = self.lsm.stat(&self.mds, req.ino).await?;
        Ok(msg::LsmStatResponse { status: 0, sb })
    }
}
