//! Request and response structs for every registered operation. Every
//! response leads with an errno-style `status` word (0 = success), so a
//! caller can check the outcome before touching the rest of the payload.

use crate::wire::{self, Wire};
use crate::StatSnap;
use bytes::{Buf, BufMut};

/// Reference to a buffer registered with the caller's bulk registry. The
/// peer pulls from (or pushes into) it by id; the id is meaningful only for
/// the connection it was sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkRef {
    pub region: u64,
    pub len: u64,
}

impl Wire for BulkRef {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.region);
        buf.put_u64_le(self.len);
    }

    fn decode<B: Buf>(buf: &mut B) -> wire::Result<BulkRef> {
        Ok(BulkRef {
            region: wire::get_u64(buf)?,
            len: wire::get_u64(buf)?,
        })
    }
}

/// Global file-attribute record kept by the server per gfid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileAttr {
    pub gfid: u32,
    pub filename: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub is_laminated: bool,
}

impl Wire for FileAttr {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.gfid);
        wire::put_str(buf, &self.filename);
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.uid);
        buf.put_u32_le(self.gid);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.atime);
        buf.put_u64_le(self.mtime);
        buf.put_u64_le(self.ctime);
        buf.put_u32_le(self.is_laminated as u32);
    }

    fn decode<B: Buf>(buf: &mut B) -> wire::Result<FileAttr> {
        Ok(FileAttr {
            gfid: wire::get_u32(buf)?,
            filename: wire::get_str(buf)?,
            mode: wire::get_u32(buf)?,
            uid: wire::get_u32(buf)?,
            gid: wire::get_u32(buf)?,
            size: wire::get_u64(buf)?,
            atime: wire::get_u64(buf)?,
            mtime: wire::get_u64(buf)?,
            ctime: wire::get_u64(buf)?,
            is_laminated: wire::get_u32(buf)? != 0,
        })
    }
}

macro_rules! wire_struct {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl Wire for $name {
            fn encode<B: BufMut>(&self, buf: &mut B) {
                $(WireField::put(&self.$field, buf);)*
            }

            fn decode<B: Buf>(buf: &mut B) -> wire::Result<$name> {
                Ok($name {
                    $($field: WireField::get(buf)?,)*
                })
            }
        }
    };
}

/// Field-level encoding used by the `wire_struct!` macro.
trait WireField: Sized {
    fn put<B: BufMut>(&self, buf: &mut B);
    fn get<B: Buf>(buf: &mut B) -> wire::Result<Self>;
}

impl WireField for u32 {
    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(*self);
    }
    fn get<B: Buf>(buf: &mut B) -> wire::Result<u32> {
        wire::get_u32(buf)
    }
}

impl WireField for i32 {
    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(*self);
    }
    fn get<B: Buf>(buf: &mut B) -> wire::Result<i32> {
        wire::get_i32(buf)
    }
}

impl WireField for u64 {
    fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(*self);
    }
    fn get<B: Buf>(buf: &mut B) -> wire::Result<u64> {
        wire::get_u64(buf)
    }
}

impl WireField for String {
    fn put<B: BufMut>(&self, buf: &mut B) {
        wire::put_str(buf, self);
    }
    fn get<B: Buf>(buf: &mut B) -> wire::Result<String> {
        wire::get_str(buf)
    }
}

impl WireField for BulkRef {
    fn put<B: BufMut>(&self, buf: &mut B) {
        Wire::encode(self, buf);
    }
    fn get<B: Buf>(buf: &mut B) -> wire::Result<BulkRef> {
        Wire::decode(buf)
    }
}

impl WireField for StatSnap {
    fn put<B: BufMut>(&self, buf: &mut B) {
        Wire::encode(self, buf);
    }
    fn get<B: Buf>(buf: &mut B) -> wire::Result<StatSnap> {
        Wire::decode(buf)
    }
}

impl WireField for FileAttr {
    fn put<B: BufMut>(&self, buf: &mut B) {
        Wire::encode(self, buf);
    }
    fn get<B: Buf>(buf: &mut B) -> wire::Result<FileAttr> {
        Wire::decode(buf)
    }
}

// ---- client <-> local server ----

wire_struct!(MountRequest {
    rank: u32,
    mount_prefix: String,
});
wire_struct!(MountResponse {
    status: i32,
    app_id: u32,
    client_id: u32,
    server_rank: u32,
});

wire_struct!(AttachRequest {
    app_id: u32,
    client_id: u32,
    super_size: u64,
    recv_size: u64,
    // Offsets into the superblock region, so the server can scan the
    // write-index ring without re-deriving the layout.
    index_count_offset: u64,
    index_entries_offset: u64,
    index_max_entries: u64,
    spill_dir: String,
});
wire_struct!(AttachResponse { status: i32 });

wire_struct!(UnmountRequest { client_id: u32 });
wire_struct!(UnmountResponse { status: i32 });

wire_struct!(MetasetRequest {
    create: u32,
    attr: FileAttr,
});
wire_struct!(MetasetResponse { status: i32 });

wire_struct!(MetagetRequest { gfid: u32 });
wire_struct!(MetagetResponse {
    status: i32,
    attr: FileAttr,
});

wire_struct!(FilesizeRequest { gfid: u32 });
wire_struct!(FilesizeResponse {
    status: i32,
    size: u64,
});

wire_struct!(TruncateRequest {
    gfid: u32,
    length: u64,
});
wire_struct!(TruncateResponse { status: i32 });

wire_struct!(UnlinkRequest { gfid: u32 });
wire_struct!(UnlinkResponse { status: i32 });

wire_struct!(LaminateRequest { gfid: u32 });
wire_struct!(LaminateResponse { status: i32 });

wire_struct!(SyncRequest { client_id: u32 });
wire_struct!(SyncResponse { status: i32 });

wire_struct!(ReadRequest {
    client_id: u32,
    gfid: u32,
    offset: u64,
    length: u64,
});
wire_struct!(ReadResponse {
    status: i32,
    nread: u64,
});

/// One range of an mread batch; answered back-to-back into the recv region.
wire_struct!(MreadRange {
    gfid: u32,
    offset: u64,
    length: u64,
});

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MreadRequest {
    pub client_id: u32,
    pub ranges: Vec<MreadRange>,
}

impl Wire for MreadRequest {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.client_id);
        buf.put_u32_le(self.ranges.len() as u32);
        for range in &self.ranges {
            range.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> wire::Result<MreadRequest> {
        let client_id = wire::get_u32(buf)?;
        let count = wire::get_u32(buf)? as usize;
        let mut ranges = Vec::with_capacity(count);
        for _ in 0..count {
            ranges.push(MreadRange::decode(buf)?);
        }
        Ok(MreadRequest { client_id, ranges })
    }
}

wire_struct!(MreadResponse {
    status: i32,
    total: u64,
});

wire_struct!(LsmOpenRequest {
    pathname: String,
    flags: u32,
    mode: u32,
});
wire_struct!(LsmOpenResponse { status: i32 });

wire_struct!(LsmCloseRequest { ino: u64 });
wire_struct!(LsmCloseResponse { status: i32 });

wire_struct!(LsmStatRequest { ino: u64 });
wire_struct!(LsmStatResponse {
    status: i32,
    sb: StatSnap,
});

// ---- server <-> server ----

wire_struct!(MdsCreateRequest { pathname: String });
wire_struct!(MdsCreateResponse { status: i32 });

wire_struct!(MdsSearchRequest { pathname: String });
wire_struct!(MdsSearchResponse {
    status: i32,
    found: u32,
});

wire_struct!(MdsFsyncRequest {
    pathname: String,
    size: u64,
});
wire_struct!(MdsFsyncResponse { status: i32 });

wire_struct!(MdsFilelenRequest { pathname: String });
wire_struct!(MdsFilelenResponse {
    status: i32,
    size: u64,
});

wire_struct!(MdsAddfmapRequest {
    pathname: String,
    fmap: BulkRef,
});
wire_struct!(MdsAddfmapResponse { status: i32 });

wire_struct!(MdsGetfmapRequest { pathname: String });
wire_struct!(MdsGetfmapResponse {
    status: i32,
    fmap: BulkRef,
});

wire_struct!(MdsStatRequest { pathname: String });
wire_struct!(MdsStatResponse {
    status: i32,
    sb: StatSnap,
});

wire_struct!(ChunkReadRequest {
    pathname: String,
    offset: u64,
    length: u64,
    // Writable region on the requester the owner pushes the bytes into.
    sink: BulkRef,
});
wire_struct!(ChunkReadResponse {
    status: i32,
    nread: u64,
});

/// Convenience for handlers answering a bare failure status where the
/// response type carries more than the status word.
pub fn status_only<T: Default + StatusResponse>(status: i32) -> T {
    let mut resp = T::default();
    resp.set_status(status);
    resp
}

pub trait StatusResponse {
    fn set_status(&mut self, status: i32);
    fn status(&self) -> i32;
}

macro_rules! status_response {
    ($($name:ident),* $(,)?) => {
        $(
            impl StatusResponse for $name {
                fn set_status(&mut self, status: i32) {
                    self.status = status;
                }
                fn status(&self) -> i32 {
                    self.status
                }
            }
        )*
    };
}

status_response!(
    MountResponse,
    AttachResponse,
    UnmountResponse,
    MetasetResponse,
    MetagetResponse,
    FilesizeResponse,
    TruncateResponse,
    UnlinkResponse,
    LaminateResponse,
    SyncResponse,
    ReadResponse,
    MreadResponse,
    LsmOpenResponse,
    LsmCloseResponse,
    LsmStatResponse,
    MdsCreateResponse,
    MdsSearchResponse,
    MdsFsyncResponse,
    MdsFilelenResponse,
    MdsAddfmapResponse,
    MdsGetfmapResponse,
    MdsStatResponse,
    ChunkReadResponse,
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = AttachRequest {
            app_id: 7,
            client_id: 2,
            super_size: 1 << 20,
            recv_size: 1 << 22,
            index_count_offset: 8192,
            index_entries_offset: 12288,
            index_max_entries: 1024,
            spill_dir: "/var/tmp/shoal".to_string(),
        };
        let bytes = req.to_bytes();
        assert_eq!(AttachRequest::from_bytes(bytes).unwrap(), req);
    }

    #[test]
    fn attr_round_trips() {
        let attr = FileAttr {
            gfid: crate::gfid("/m/f"),
            filename: "/m/f".to_string(),
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            size: 65536,
            atime: 1,
            mtime: 2,
            ctime: 3,
            is_laminated: true,
        };
        let req = MetasetRequest {
            create: 1,
            attr: attr.clone(),
        };
        let decoded = MetasetRequest::from_bytes(req.to_bytes()).unwrap();
        assert_eq!(decoded.attr, attr);
    }

    #[test]
    fn mread_batch_round_trips() {
        let req = MreadRequest {
            client_id: 3,
            ranges: vec![
                MreadRange {
                    gfid: 1,
                    offset: 0,
                    length: 4096,
                },
                MreadRange {
                    gfid: 1,
                    offset: 8192,
                    length: 4096,
                },
            ],
        };
        assert_eq!(MreadRequest::from_bytes(req.to_bytes()).unwrap(), req);
    }

    #[test]
    fn status_only_sets_just_the_status() {
        let resp: LsmStatResponse = status_only(crate::errno::ENOENT);
        assert_eq!(resp.status, crate::errno::ENOENT);
        assert_eq!(resp.sb, StatSnap::default());
    }
}
