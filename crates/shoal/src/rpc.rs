//! Typed wrappers over the client→server operations. Each call blocks the
//! caller on the client's private runtime, which is the contract of the
//! intercepted-syscall surface.

use crate::client::Client;
use crate::{check, Result};
use proto_shoal::messages as msg;
use proto_shoal::wire::Wire;
use proto_shoal::{op, StatSnap};

impl Client {
    pub(crate) fn call<Req: Wire, Resp: Wire>(&self, op: &str, req: &Req) -> Result<Resp> {
        Ok(self.rt.block_on(self.channel.call(op, req))?)
    }

    pub(crate) fn rpc_metaset(&self, create: bool, attr: msg::FileAttr) -> Result<()> {
        let resp: msg::MetasetResponse = self.call(
            op::METASET,
            &msg::MetasetRequest {
                create: create as u32,
                attr,
            },
        )?;
        check(resp.status)
    }

    pub(crate) fn rpc_metaget(&self, gfid: u32) -> Result<msg::FileAttr> {
        let resp: msg::MetagetResponse = self.call(op::METAGET, &msg::MetagetRequest { gfid })?;
        check(resp.status)?;
        Ok(resp.attr)
    }

    pub(crate) fn rpc_filesize(&self, gfid: u32) -> Result<u64> {
        let resp: msg::FilesizeResponse = self.call(op::FILESIZE, &msg::FilesizeRequest { gfid })?;
        check(resp.status)?;
        Ok(resp.size)
    }

    pub(crate) fn rpc_truncate(&self, gfid: u32, length: u64) -> Result<()> {
        let resp: msg::TruncateResponse =
            self.call(op::TRUNCATE, &msg::TruncateRequest { gfid, length })?;
        check(resp.status)
    }

    pub(crate) fn rpc_unlink(&self, gfid: u32) -> Result<()> {
        let resp: msg::UnlinkResponse = self.call(op::UNLINK, &msg::UnlinkRequest { gfid })?;
        check(resp.status)
    }

    pub(crate) fn rpc_laminate(&self, gfid: u32) -> Result<()> {
        let resp: msg::LaminateResponse = self.call(op::LAMINATE, &msg::LaminateRequest { gfid })?;
        check(resp.status)
    }

    /// Ask the server to fold our write-index records into the metadata
    /// view. On success the ring is ours to reset.
    pub(crate) fn rpc_sync(&self) -> Result<()> {
        let resp: msg::SyncResponse = self.call(
            op::SYNC,
            &msg::SyncRequest {
                client_id: self.client_id,
            },
        )?;
        check(resp.status)?;
        self.superblock.index_reset();
        Ok(())
    }

    /// Assemble `[offset, offset+length)` of `gfid` into the recv region.
    pub(crate) fn rpc_read(&self, gfid: u32, offset: u64, length: u64) -> Result<u64> {
        let resp: msg::ReadResponse = self.call(
            op::READ,
            &msg::ReadRequest {
                client_id: self.client_id,
                gfid,
                offset,
                length,
            },
        )?;
        check(resp.status)?;
        Ok(resp.nread)
    }

    pub(crate) fn rpc_mread(&self, ranges: Vec<msg::MreadRange>) -> Result<u64> {
        let resp: msg::MreadResponse = self.call(
            op::MREAD,
            &msg::MreadRequest {
                client_id: self.client_id,
                ranges,
            },
        )?;
        check(resp.status)?;
        Ok(resp.total)
    }

    pub(crate) fn rpc_lsm_open(&self, pathname: &str, flags: i32, mode: u32) -> Result<()> {
        let resp: msg::LsmOpenResponse = self.call(
            op::LSM_OPEN,
            &msg::LsmOpenRequest {
                pathname: pathname.to_string(),
                flags: flags as u32,
                mode,
            },
        )?;
        check(resp.status)
    }

    pub(crate) fn rpc_lsm_close(&self, ino: u64) -> Result<()> {
        let resp: msg::LsmCloseResponse = self.call(op::LSM_CLOSE, &msg::LsmCloseRequest { ino })?;
        check(resp.status)
    }

    pub(crate) fn rpc_lsm_stat(&self, ino: u64) -> Result<StatSnap> {
        let resp: msg::LsmStatResponse = self.call(op::LSM_STAT, &msg::LsmStatRequest { ino })?;
        check(resp.status)?;
        Ok(resp.sb)
    }
}
