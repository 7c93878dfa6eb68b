//! Client-side filesystem runtime: intercepted file operations against a
//! shared mount prefix, backed by node-local storage, a shared-memory
//! superblock, and the co-located shoald server.
//!
//! The instrumentation layer calls [`mount`], then routes file operations
//! through the intercept predicates and the [`Client`] surface; the caller
//! never sees anything but fds and errno-style returns.

mod client;
pub use client::Client;

mod config;
pub use config::ClientConfig;

pub mod extent_tree;
pub mod fd;
pub mod superblock;

mod rpc;
mod storage;
mod transfer;

use proto_shoal::errno;
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("errno {0}")]
    Errno(i32),
    #[error(transparent)]
    Rpc(#[from] shoal_rpc::Error),
    #[error(transparent)]
    Shm(#[from] shoal_shm::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<Ok> = std::result::Result<Ok, Error>;

impl Error {
    /// The single errno surfaced at the POSIX boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Errno(errno) => *errno,
            Error::Rpc(err) => err.errno(),
            Error::Shm(_) => errno::EIO,
            Error::Io(err) => err.raw_os_error().unwrap_or(errno::EIO),
        }
    }
}

pub(crate) fn check(status: i32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(Error::Errno(status))
    }
}

/// The process-wide client handle. Intercept predicates are consulted on
/// every syscall, so they read through this lazily-initialized slot rather
/// than threading the handle through the wrapper layer.
fn global() -> &'static RwLock<Option<Arc<Client>>> {
    static CLIENT: OnceLock<RwLock<Option<Arc<Client>>>> = OnceLock::new();
    CLIENT.get_or_init(|| RwLock::new(None))
}

/// The mounted client, if any.
pub fn current() -> Option<Arc<Client>> {
    global().read().unwrap().clone()
}

/// Mount the filesystem at `prefix` and install the process-wide handle.
/// Returns 0, or a negative error code. Mounting twice with the same
/// prefix is idempotent; a second prefix is refused.
pub fn mount(prefix: &str, rank: u32, nranks: u32, app_id: u32) -> i32 {
    let mut slot = global().write().unwrap();
    if let Some(existing) = &*slot {
        if existing.mount_prefix() == prefix {
            tracing::debug!(prefix, "already mounted");
            return 0;
        }
        tracing::error!(prefix, "multiple mounts are not supported");
        return -errno::EINVAL;
    }

    match Client::mount(prefix, rank, nranks, app_id, ClientConfig::from_env()) {
        Ok(client) => {
            *slot = Some(Arc::new(client));
            0
        }
        Err(err) => {
            tracing::error!(prefix, %err, "mount failed");
            -err.errno()
        }
    }
}

/// Unmount and drop the process-wide handle. Returns 0, or a negative
/// error code.
pub fn unmount() -> i32 {
    let Some(client) = global().write().unwrap().take() else {
        return 0;
    };
    match Arc::try_unwrap(client) {
        Ok(client) => match client.unmount() {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!(%err, "unmount failed");
                -err.errno()
            }
        },
        Err(_busy) => {
            tracing::error!("unmount with outstanding references");
            -errno::EPERM
        }
    }
}

/// Stage a file in or out of the mount. Returns 0, or a negative errno.
pub fn transfer_file(src: &str, dst: &str, parallel: bool) -> i32 {
    let Some(client) = current() else {
        return -errno::EINVAL;
    };
    match client.transfer_file(src, dst, parallel) {
        Ok(()) => 0,
        Err(err) => -err.errno(),
    }
}

/// Path intercept predicate: false until a mount is live, then a byte-wise
/// prefix test.
pub fn intercept_path(path: &str) -> bool {
    match current() {
        Some(client) => client.intercepts_path(path),
        None => false,
    }
}

/// Fd intercept predicate: translates a caller fd into our space. `None`
/// means the fd belongs to the kernel and must bypass.
pub fn intercept_fd(fd: i64) -> Option<i64> {
    let client = current()?;
    client.fdspace().intercept(fd).map(|slot| slot as i64)
}

/// Stream intercept predicate: pointer-range test against the mounted
/// client's preallocated stream array.
pub fn intercept_stream(ptr: *const fd::StreamSlot) -> bool {
    match current() {
        Some(client) => client.intercepts_stream(ptr),
        None => false,
    }
}

/// Directory-stream intercept predicate.
pub fn intercept_dirstream(ptr: *const fd::DirStreamSlot) -> bool {
    match current() {
        Some(client) => client.intercepts_dirstream(ptr),
        None => false,
    }
}

impl Client {
    pub fn fdspace(&self) -> &fd::FdSpace {
        &self.fdspace
    }
}

fn init_logging(verbosity: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(verbosity))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A second mount in the same process finds the subscriber installed;
    // that is fine.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
