//! The transport linking clients to their co-located server and servers to
//! one another: typed request/response calls over length-delimited frames,
//! plus an orthogonal bulk primitive where one side registers a buffer and
//! the peer pulls from (or pushes into) it. Payloads above the inline cap
//! only ever move through bulk transfers.

mod frame;
pub use frame::Frame;

mod bulk;
pub use bulk::{BulkHandle, BulkRegistry};

mod channel;
pub use channel::{Addr, Channel};

mod server;
pub use server::{serve_tcp, serve_unix, Handler};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] proto_shoal::wire::Error),
    #[error("peer answered errno {0}")]
    Remote(i32),
    #[error("connection closed")]
    Closed,
    #[error("peer has no bulk region {0}")]
    BulkMissing(u64),
    #[error("bulk transfer returned {got} bytes, wanted {expected}")]
    BulkSize { expected: u64, got: u64 },
    #[error("invalid address {0:?}")]
    BadAddr(String),
}

pub type Result<Ok> = std::result::Result<Ok, Error>;

impl Error {
    /// Collapse to the single errno surfaced at the POSIX boundary.
    /// Transport failures become EIO; a remote errno passes through.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Remote(errno) => *errno,
            _ => proto_shoal::errno::EIO,
        }
    }
}
