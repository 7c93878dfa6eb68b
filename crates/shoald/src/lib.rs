//! The shoal server daemon: one process per node, owning a shard of the
//! metadata directory, the node's backing store, and the sessions of the
//! clients mounted on this node.

pub mod attrs;
pub mod dispatch;
pub mod harvest;
pub mod lsm;
pub mod mds;
pub mod peers;
pub mod session;

use proto_shoal::errno;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("errno {0}")]
    Errno(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rpc(#[from] shoal_rpc::Error),
    #[error(transparent)]
    Shm(#[from] shoal_shm::Error),
    #[error(transparent)]
    Wire(#[from] proto_shoal::wire::Error),
}

pub type Result<Ok> = std::result::Result<Ok, Error>;

impl Error {
    /// Status word carried back through a response struct.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Errno(errno) => *errno,
            Error::Rpc(err) => err.errno(),
            Error::Io(err) => err.raw_os_error().unwrap_or(errno::EIO),
            Error::Shm(_) => errno::EIO,
            Error::Wire(_) => errno::EINVAL,
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

/// Everything one server rank owns.
pub struct ServerState {
    pub rank: u32,
    pub nranks: u32,
    pub mds: mds::Mds,
    pub lsm: lsm::Lsm,
    pub attrs: attrs::Attrs,
    pub peers: Arc<peers::Peers>,
    pub sessions: session::Sessions,
    pub(crate) next_client_id: AtomicU32,
    /// Slice size for cross-rank data requests.
    pub meta_range_size: usize,
}

impl ServerState {
    pub fn new(
        rank: u32,
        peer_addrs: Vec<shoal_rpc::Addr>,
        spill_dir: PathBuf,
        meta_range_size: usize,
    ) -> Result<Arc<ServerState>> {
        let nranks = peer_addrs.len() as u32;
        let peers = Arc::new(peers::Peers::new(rank, peer_addrs));

        std::fs::create_dir_all(&spill_dir)?;
        let root = spill_dir.canonicalize()?;

        Ok(Arc::new(ServerState {
            rank,
            nranks,
            mds: mds::Mds::new(rank, nranks, peers.clone()),
            lsm: lsm::Lsm::new(rank, root),
            attrs: attrs::Attrs::new(rank, nranks, peers.clone()),
            peers,
            sessions: session::Sessions::default(),
            next_client_id: AtomicU32::new(1),
            meta_range_size,
        }))
    }
}
