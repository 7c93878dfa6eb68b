//! Opcode dispatch: one handler serves both listeners (the Unix socket the
//! node's clients dial and the TCP endpoint peers dial), decoding the
//! request, running the operation, and answering with the encoded response.
//! Failures inside an operation travel as the response's status word; a
//! request that cannot even be decoded gets the dispatcher's bare errno.

use crate::ServerState;
use bytes::Bytes;
use proto_shoal::messages as msg;
use proto_shoal::wire::Wire;
use proto_shoal::{errno, op, Fmap};
use shoal_rpc::{Channel, Handler};
use std::sync::Arc;

pub struct Dispatch(pub Arc<ServerState>);

macro_rules! op_case {
    ($payload:expr, $reqty:ty, $respty:ty, $run:expr) => {{
        let req = <$reqty>::from_bytes($payload).map_err(|_| errno::EINVAL)?;
        let resp: $respty = match $run(req).await {
            Ok(resp) => resp,
            Err(err) => {
                let errno = crate::Error::errno(&err);
                tracing::debug!(%err, errno, "operation failed");
                msg::status_only(errno)
            }
        };
        Ok(resp.to_bytes())
    }};
}

#[async_trait::async_trait]
impl Handler for Dispatch {
    async fn handle(&self, peer: Channel, op_name: &str, payload: Bytes) -> Result<Bytes, i32> {
        let state = &self.0;
        match op_name {
            // ---- client-facing ----
            op::MOUNT => op_case!(payload, msg::MountRequest, msg::MountResponse, |req| state
                .op_mount(req)),
            op::ATTACH => op_case!(payload, msg::AttachRequest, msg::AttachResponse, |req| state
                .op_attach(req)),
            op::UNMOUNT => op_case!(payload, msg::UnmountRequest, msg::UnmountResponse, |req| {
                state.op_unmount(req)
            }),
            op::METASET => op_case!(payload, msg::MetasetRequest, msg::MetasetResponse, |req| {
                state.op_metaset(req)
            }),
            op::METAGET => op_case!(payload, msg::MetagetRequest, msg::MetagetResponse, |req| {
                state.op_metaget(req)
            }),
            op::FILESIZE => {
                op_case!(payload, msg::FilesizeRequest, msg::FilesizeResponse, |req| {
                    state.op_filesize(req)
                })
            }
            op::TRUNCATE => {
                op_case!(payload, msg::TruncateRequest, msg::TruncateResponse, |req| {
                    state.op_truncate(req)
                })
            }
            op::UNLINK => op_case!(payload, msg::UnlinkRequest, msg::UnlinkResponse, |req| state
                .op_unlink(req)),
            op::LAMINATE => {
                op_case!(payload, msg::LaminateRequest, msg::LaminateResponse, |req| {
                    state.op_laminate(req)
                })
            }
            op::SYNC => op_case!(payload, msg::SyncRequest, msg::SyncResponse, |req| state
                .op_sync(req)),
            op::READ => op_case!(payload, msg::ReadRequest, msg::ReadResponse, |req| state
                .op_read(req)),
            op::MREAD => op_case!(payload, msg::MreadRequest, msg::MreadResponse, |req| state
                .op_mread(req)),
            op::LSM_OPEN => {
                op_case!(payload, msg::LsmOpenRequest, msg::LsmOpenResponse, |req| state
                    .op_lsm_open(req))
            }
            op::LSM_CLOSE => {
                op_case!(payload, msg::LsmCloseRequest, msg::LsmCloseResponse, |req| {
                    state.op_lsm_close(req)
                })
            }
            op::LSM_STAT => {
                op_case!(payload, msg::LsmStatRequest, msg::LsmStatResponse, |req| state
                    .op_lsm_stat(req))
            }

            // ---- peer-to-peer: shard-local MDS operations ----
            op::MDS_CREATE => op_case!(
                payload,
                msg::MdsCreateRequest,
                msg::MdsCreateResponse,
                |req: msg::MdsCreateRequest| async move {
                    state.mds.table.create(&req.pathname)?;
                    Ok(msg::MdsCreateResponse { status: 0 })
                }
            ),
            op::MDS_SEARCH => op_case!(
                payload,
                msg::MdsSearchRequest,
                msg::MdsSearchResponse,
                |req: msg::MdsSearchRequest| async move {
                    Ok(msg::MdsSearchResponse {
                        status: 0,
                        found: state.mds.table.search(&req.pathname) as u32,
                    })
                }
            ),
            op::MDS_FSYNC => op_case!(
                payload,
                msg::MdsFsyncRequest,
                msg::MdsFsyncResponse,
                |req: msg::MdsFsyncRequest| async move {
                    state.mds.table.fsync(&req.pathname, req.size)?;
                    Ok(msg::MdsFsyncResponse { status: 0 })
                }
            ),
            op::MDS_SETLEN => op_case!(
                payload,
                msg::MdsFsyncRequest,
                msg::MdsFsyncResponse,
                |req: msg::MdsFsyncRequest| async move {
                    state.mds.table.set_len(&req.pathname, req.size)?;
                    Ok(msg::MdsFsyncResponse { status: 0 })
                }
            ),
            op::MDS_FILELEN => op_case!(
                payload,
                msg::MdsFilelenRequest,
                msg::MdsFilelenResponse,
                |req: msg::MdsFilelenRequest| async move {
                    let size = state.mds.table.filelen(&req.pathname)?;
                    Ok(msg::MdsFilelenResponse { status: 0, size })
                }
            ),
            op::MDS_ADDFMAP => {
                let peer = peer.clone();
                op_case!(
                    payload,
                    msg::MdsAddfmapRequest,
                    msg::MdsAddfmapResponse,
                    |req: msg::MdsAddfmapRequest| async move {
                        // Pull the harvested fmap out of the sender's
                        // registered buffer, then merge it into our shard.
                        let bytes = peer.pull(req.fmap).await?;
                        let fmap = Fmap::from_bytes(bytes)?;
                        state.mds.table.addfmap(&req.pathname, fmap)?;
                        Ok(msg::MdsAddfmapResponse { status: 0 })
                    }
                )
            }
            op::MDS_GETFMAP => {
                let peer = peer.clone();
                op_case!(
                    payload,
                    msg::MdsGetfmapRequest,
                    msg::MdsGetfmapResponse,
                    |req: msg::MdsGetfmapRequest| async move {
                        // Serialize a copy and stage it for exactly one
                        // pull; the registration frees itself afterward.
                        let fmap = state.mds.table.getfmap(&req.pathname)?;
                        let handle = peer.bulk().register_ro_once(fmap.to_bytes());
                        Ok(msg::MdsGetfmapResponse {
                            status: 0,
                            fmap: handle.as_ref(),
                        })
                    }
                )
            }
            op::MDS_STAT => op_case!(
                payload,
                msg::MdsStatRequest,
                msg::MdsStatResponse,
                |req: msg::MdsStatRequest| async move {
                    let sb = state.mds.table.stat(&req.pathname)?;
                    Ok(msg::MdsStatResponse { status: 0, sb })
                }
            ),
            op::CHUNK_READ => {
                let peer = peer.clone();
                op_case!(
                    payload,
                    msg::ChunkReadRequest,
                    msg::ChunkReadResponse,
                    |req| state.op_chunk_read(&peer, req)
                )
            }

            // ---- peer-to-peer: shard-local attribute operations ----
            op::ATTR_SET => op_case!(
                payload,
                msg::MetasetRequest,
                msg::MetasetResponse,
                |req: msg::MetasetRequest| async move {
                    state.attrs.set_local(req.create != 0, req.attr)?;
                    Ok(msg::MetasetResponse { status: 0 })
                }
            ),
            op::ATTR_GET => op_case!(
                payload,
                msg::MetagetRequest,
                msg::MetagetResponse,
                |req: msg::MetagetRequest| async move {
                    let attr = state.attrs.get_local(req.gfid)?;
                    Ok(msg::MetagetResponse { status: 0, attr })
                }
            ),
            op::ATTR_REMOVE => op_case!(
                payload,
                msg::UnlinkRequest,
                msg::UnlinkResponse,
                |req: msg::UnlinkRequest| async move {
                    state.attrs.remove_local(req.gfid)?;
                    Ok(msg::UnlinkResponse { status: 0 })
                }
            ),

            other => {
                tracing::warn!(op = other, "unknown operation");
                Err(errno::ENOTSUP)
            }
        }
    }
}
