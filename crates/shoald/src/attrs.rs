//! The file-attribute directory: gfid-keyed records sharded across ranks
//! by `gfid % server_count`. The storage behind a shard is a pluggable
//! [`AttrBackend`]; the default keeps records in memory, which is all the
//! laminate-on-close model needs across one job.

use crate::peers::Peers;
use crate::{check, Error, Result};
use proto_shoal::messages as msg;
use proto_shoal::{errno, op};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Seam for the key-value backend holding one shard's records.
pub trait AttrBackend: Send + Sync + 'static {
    fn get(&self, gfid: u32) -> Option<msg::FileAttr>;
    fn put(&self, attr: msg::FileAttr);
    fn remove(&self, gfid: u32) -> bool;
}

/// In-memory default backend.
#[derive(Default)]
pub struct MemAttrs {
    map: RwLock<HashMap<u32, msg::FileAttr>>,
}

impl AttrBackend for MemAttrs {
    fn get(&self, gfid: u32) -> Option<msg::FileAttr> {
        self.map.read().unwrap().get(&gfid).cloned()
    }

    fn put(&self, attr: msg::FileAttr) {
        self.map.write().unwrap().insert(attr.gfid, attr);
    }

    fn remove(&self, gfid: u32) -> bool {
        self.map.write().unwrap().remove(&gfid).is_some()
    }
}

pub struct Attrs {
    rank: u32,
    nranks: u32,
    backend: Box<dyn AttrBackend>,
    peers: Arc<Peers>,
}

impl Attrs {
    pub fn new(rank: u32, nranks: u32, peers: Arc<Peers>) -> Attrs {
        Attrs {
            rank,
            nranks,
            backend: Box::new(MemAttrs::default()),
            peers,
        }
    }

    fn owner(&self, gfid: u32) -> u32 {
        gfid % self.nranks
    }

    pub async fn get(&self, gfid: u32) -> Result<msg::FileAttr> {
        let owner = self.owner(gfid);
        if owner == self.rank {
            return self.get_local(gfid);
        }

        let channel = self.peers.channel(owner).await?;
        let resp: msg::MetagetResponse = channel
            .call(op::ATTR_GET, &msg::MetagetRequest { gfid })
            .await?;
        check(resp.status)?;
        Ok(resp.attr)
    }

    pub async fn set(&self, create: bool, attr: msg::FileAttr) -> Result<()> {
        let owner = self.owner(attr.gfid);
        if owner == self.rank {
            return self.set_local(create, attr);
        }

        let channel = self.peers.channel(owner).await?;
        let resp: msg::MetasetResponse = channel
            .call(
                op::ATTR_SET,
                &msg::MetasetRequest {
                    create: create as u32,
                    attr,
                },
            )
            .await?;
        check(resp.status)
    }

    pub async fn remove(&self, gfid: u32) -> Result<()> {
        let owner = self.owner(gfid);
        if owner == self.rank {
            return self.remove_local(gfid);
        }

        let channel = self.peers.channel(owner).await?;
        let resp: msg::UnlinkResponse = channel
            .call(op::ATTR_REMOVE, &msg::UnlinkRequest { gfid })
            .await?;
        check(resp.status)
    }

    // ---- shard-local operations, also invoked by the dispatcher when a
    // peer routes to us ----

    pub fn get_local(&self, gfid: u32) -> Result<msg::FileAttr> {
        self.backend.get(gfid).ok_or(Error::Errno(errno::ENOENT))
    }

    /// `create` upserts but preserves an existing record's size and
    /// lamination: a second writer re-creating a live file must not reset
    /// what earlier syncs established. Plain set requires the record to
    /// exist and overwrites it.
    pub fn set_local(&self, create: bool, mut attr: msg::FileAttr) -> Result<()> {
        match self.backend.get(attr.gfid) {
            Some(existing) => {
                if create {
                    attr.size = existing.size;
                    attr.is_laminated = existing.is_laminated;
                }
                self.backend.put(attr);
                Ok(())
            }
            None if create => {
                self.backend.put(attr);
                Ok(())
            }
            None => Err(Error::Errno(errno::ENOENT)),
        }
    }

    pub fn remove_local(&self, gfid: u32) -> Result<()> {
        if self.backend.remove(gfid) {
            Ok(())
        } else {
            Err(Error::Errno(errno::ENOENT))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn attrs() -> Attrs {
        Attrs::new(0, 1, Arc::new(Peers::new(0, vec![])))
    }

    fn record(gfid: u32) -> msg::FileAttr {
        msg::FileAttr {
            gfid,
            filename: "/m/f".to_string(),
            mode: 0o100644,
            ..Default::default()
        }
    }

    #[test]
    fn set_requires_an_existing_record() {
        let attrs = attrs();
        assert_eq!(
            attrs.set_local(false, record(1)).unwrap_err().errno(),
            errno::ENOENT
        );
        attrs.set_local(true, record(1)).unwrap();
        assert!(attrs.set_local(false, record(1)).is_ok());
    }

    #[test]
    fn create_preserves_size_and_lamination() {
        let attrs = attrs();

        let mut first = record(2);
        first.size = 4096;
        first.is_laminated = true;
        attrs.set_local(true, first).unwrap();

        // A later create (second writer opening the name) must not clobber.
        attrs.set_local(true, record(2)).unwrap();
        let read = attrs.get_local(2).unwrap();
        assert_eq!(read.size, 4096);
        assert!(read.is_laminated);
    }

    #[test]
    fn remove_then_get_is_enoent() {
        let attrs = attrs();
        attrs.set_local(true, record(3)).unwrap();
        attrs.remove_local(3).unwrap();
        assert_eq!(attrs.get_local(3).unwrap_err().errno(), errno::ENOENT);
    }
}
