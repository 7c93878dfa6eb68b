use crate::config::ClientConfig;
use crate::extent_tree::ExtentTree;
use crate::fd::{DirStreamSlot, FdSpace, FdTable, StreamSlot, Streams, MAX_FILEDESCS};
use crate::superblock::{Superblock, STORAGE_LOGIO, STORAGE_NULL};
use crate::{Error, Result};
use proto_shoal::messages as msg;
use proto_shoal::{errno, op, shm_name};
use shoal_rpc::{Addr, Channel};
use shoal_shm::Region;
use std::path::PathBuf;
use std::sync::Mutex;

/// Process-local per-fid state; the shared superblock holds everything
/// other processes need, while the extent trees stay private.
#[derive(Default)]
pub(crate) struct FidLocal {
    /// Locally-written extents pending flattening into sync records.
    pub extents_sync: ExtentTree,
    /// All local extents, consulted to short-circuit reads.
    pub extents: ExtentTree,
}

pub(crate) struct Tables {
    pub fds: FdTable,
    pub streams: Streams<StreamSlot>,
    pub dirstreams: Streams<DirStreamSlot>,
    pub locals: Vec<FidLocal>,
}

/// The client filesystem runtime: every global of the system (superblock
/// pointers, the RPC context, fd tables) lives behind this one handle.
pub struct Client {
    pub(crate) cfg: ClientConfig,
    pub(crate) rank: u32,
    pub(crate) nranks: u32,
    pub(crate) app_id: u32,
    pub(crate) client_id: u32,
    pub(crate) server_rank: u32,
    pub(crate) mount_prefix: String,
    pub(crate) conroot: String,
    pub(crate) rt: tokio::runtime::Runtime,
    pub(crate) channel: Channel,
    pub(crate) superblock: Superblock,
    pub(crate) recv: Region,
    pub(crate) fdspace: FdSpace,
    pub(crate) tables: Mutex<Tables>,
}

impl Client {
    /// Mount the filesystem at `prefix`. The sequence is a total order; any
    /// failure tears down strictly in reverse (drop order plus the explicit
    /// unlink of the recv region).
    pub fn mount(
        prefix: &str,
        rank: u32,
        nranks: u32,
        requested_app_id: u32,
        cfg: ClientConfig,
    ) -> Result<Client> {
        // Logging first, so the rest of the sequence is observable.
        crate::init_logging(&cfg.log_verbosity);

        let mount_prefix = prefix.to_string();

        // The app id derives from the mount prefix; a caller-supplied id is
        // recorded but never used, so every rank agrees without exchange.
        let app_id = proto_shoal::gfid(prefix);
        if requested_app_id != 0 && requested_app_id != app_id {
            tracing::debug!(requested_app_id, app_id, "ignoring passed app id");
        }

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let addr: Addr = cfg.server_addr().parse().map_err(|_| {
            Error::Errno(errno::EINVAL)
        })?;
        let channel = rt.block_on(Channel::connect_with_retry(&addr, None, 3))?;

        let mount_resp: msg::MountResponse = rt.block_on(channel.call(
            op::MOUNT,
            &msg::MountRequest {
                rank,
                mount_prefix: mount_prefix.clone(),
            },
        ))?;
        crate::check(mount_resp.status)?;
        debug_assert_eq!(mount_resp.app_id, app_id);
        let client_id = mount_resp.client_id;
        let server_rank = mount_resp.server_rank;

        tracing::info!(
            rank,
            nranks,
            app_id,
            client_id,
            server_rank,
            prefix = %mount_prefix,
            "mounted",
        );

        let fdspace = FdSpace::from_rlimit()?;

        // Canonical backing root; the server created the mountpoint
        // directory under it during the mount call.
        let conroot = PathBuf::from(&cfg.spill_dir)
            .canonicalize()?
            .display()
            .to_string();

        let superblock = Superblock::attach(
            &shm_name::superblock(app_id, client_id),
            cfg.max_files,
            cfg.write_index_size,
        )?;

        let recv = Region::create(&shm_name::recv(app_id, client_id), cfg.recv_data_size)?;

        let attach_resp: Result<msg::AttachResponse> = rt
            .block_on(channel.call(
                op::ATTACH,
                &msg::AttachRequest {
                    app_id,
                    client_id,
                    super_size: superblock.region().len() as u64,
                    recv_size: recv.len() as u64,
                    index_count_offset: superblock.index_count_offset() as u64,
                    index_entries_offset: superblock.index_entries_offset() as u64,
                    index_max_entries: superblock.max_index_entries() as u64,
                    spill_dir: conroot.clone(),
                },
            ))
            .map_err(Into::into);
        match attach_resp.and_then(|resp| crate::check(resp.status)) {
            Ok(()) => {}
            Err(err) => {
                // Reverse teardown: nobody will ever attach this region.
                let _ = Region::unlink(recv.name());
                return Err(err);
            }
        }

        let max_files = cfg.max_files;
        let client = Client {
            cfg,
            rank,
            nranks,
            app_id,
            client_id,
            server_rank,
            mount_prefix,
            conroot,
            rt,
            channel,
            superblock,
            recv,
            fdspace,
            tables: Mutex::new(Tables {
                fds: FdTable::new(MAX_FILEDESCS),
                streams: Streams::<StreamSlot>::new(MAX_FILEDESCS),
                dirstreams: Streams::<DirStreamSlot>::new_dir(MAX_FILEDESCS),
                locals: (0..max_files).map(|_| FidLocal::default()).collect(),
            }),
        };

        // The mount point itself appears as a directory entry.
        if client.superblock.find_fid(&client.mount_prefix).is_none() {
            let prefix = client.mount_prefix.clone();
            client.fid_create_directory(&prefix)?;
        }

        Ok(client)
    }

    /// Unmount: tell the server we are leaving, then release resources in
    /// reverse of the mount order. The superblock region keeps its name so
    /// a restarted client can reattach; the recv region does not.
    pub fn unmount(self) -> Result<()> {
        let resp: msg::UnmountResponse = self.call(
            op::UNMOUNT,
            &msg::UnmountRequest {
                client_id: self.client_id,
            },
        )?;
        crate::check(resp.status)?;

        self.channel.shutdown();
        let _ = Region::unlink(self.recv.name());

        tracing::info!(client_id = self.client_id, "unmounted");
        Ok(())
    }

    pub fn mount_prefix(&self) -> &str {
        &self.mount_prefix
    }

    /// Name of this client's superblock region. The region outlives
    /// unmount by design; tools (and tests) use the name to scrub it.
    pub fn superblock_region_name(&self) -> String {
        self.superblock.region().name().to_string()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn nranks(&self) -> u32 {
        self.nranks
    }

    /// Path intercept predicate: byte-wise prefix match against the mount.
    pub fn intercepts_path(&self, path: &str) -> bool {
        path.as_bytes()
            .starts_with(self.mount_prefix.as_bytes())
    }

    /// Stream intercept predicate: does `ptr` point into our preallocated
    /// stream array?
    pub fn intercepts_stream(&self, ptr: *const crate::fd::StreamSlot) -> bool {
        self.tables.lock().unwrap().streams.contains_ptr(ptr)
    }

    /// Directory-stream intercept predicate.
    pub fn intercepts_dirstream(&self, ptr: *const crate::fd::DirStreamSlot) -> bool {
        self.tables.lock().unwrap().dirstreams.contains_ptr(ptr)
    }

    /// Backing-store path of a mount path.
    pub(crate) fn conpath(&self, path: &str) -> String {
        format!("{}{}", self.conroot, path)
    }

    // ---- local file-id operations ----

    /// Create the local entry for a new regular file.
    pub(crate) fn fid_create(&self, path: &str, gfid: u32, mode: u32) -> Result<i32> {
        let fid = self
            .superblock
            .fid_alloc()
            .ok_or(Error::Errno(errno::ENOSPC))?;
        self.superblock.set_name(fid, path);
        self.superblock.with_meta(fid, |meta| {
            *meta = Default::default();
            meta.gfid = gfid;
            meta.mode = mode | libc::S_IFREG;
            meta.storage = STORAGE_LOGIO;
        });

        let mut tables = self.tables.lock().unwrap();
        tables.locals[fid as usize] = FidLocal::default();

        tracing::debug!(path, fid, gfid, "created local file entry");
        Ok(fid)
    }

    /// Create the local and global entries for a directory.
    pub(crate) fn fid_create_directory(&self, path: &str) -> Result<i32> {
        let gfid = proto_shoal::gfid(path);
        let fid = self.fid_create(path, gfid, 0o755)?;
        self.superblock.with_meta(fid, |meta| {
            meta.mode = (meta.mode & !libc::S_IFREG) | libc::S_IFDIR;
        });
        self.rpc_metaset(true, self.attr_from_fid(fid))?;
        Ok(fid)
    }

    /// Drop a local entry entirely: name slot, meta, trees, free id.
    pub(crate) fn fid_invalidate(&self, fid: i32) {
        self.superblock.clear_name(fid);
        self.superblock.with_meta(fid, |meta| {
            *meta = Default::default();
            meta.storage = STORAGE_NULL;
        });
        let mut tables = self.tables.lock().unwrap();
        tables.locals[fid as usize] = FidLocal::default();
        drop(tables);
        self.superblock.fid_free(fid);
    }

    /// A directory is empty when no other in-use name extends its path.
    pub(crate) fn fid_is_dir_empty(&self, path: &str) -> bool {
        !self
            .superblock
            .paths()
            .iter()
            .any(|(_, name)| name.as_str() != path && name.starts_with(path))
    }

    /// Build the global attribute record from local metadata.
    pub(crate) fn attr_from_fid(&self, fid: i32) -> msg::FileAttr {
        let meta = self.superblock.meta(fid);
        let path = self.superblock.path_of(fid).unwrap_or_default();
        let now = now_secs();
        msg::FileAttr {
            gfid: meta.gfid,
            filename: path,
            mode: meta.mode,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            // Size and lamination are owned by the server.
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            is_laminated: false,
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
