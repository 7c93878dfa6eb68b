//! The metadata service shard: every rank owns the names hashing to it and
//! forwards everything else. The shard table is capacity-bounded and
//! serialized by one reader-writer lock; fmaps merge in place at the owner.

use crate::peers::Peers;
use crate::{check, Error, Result};
use proto_shoal::messages as msg;
use proto_shoal::wire::Wire;
use proto_shoal::{errno, op, shard_owner, Fmap, StatSnap};
use std::sync::{Arc, RwLock};

pub const MDS_TABLE_MAX_ENTRIES: usize = 512;

struct MdsEntry {
    pathname: String,
    /// Reader and writer opens not yet harvested.
    refs: u32,
    size: u64,
    fmap: Option<Fmap>,
}

/// One rank's shard of the directory.
pub struct MdsTable {
    entries: RwLock<Vec<MdsEntry>>,
}

impl MdsTable {
    pub fn new() -> MdsTable {
        MdsTable {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn create(&self, pathname: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        if entries.iter().any(|e| e.pathname == pathname) {
            return Err(Error::Errno(errno::EEXIST));
        }
        if entries.len() >= MDS_TABLE_MAX_ENTRIES {
            return Err(Error::Errno(errno::ENOMEM));
        }
        entries.push(MdsEntry {
            pathname: pathname.to_string(),
            refs: 1,
            size: 0,
            fmap: None,
        });
        Ok(())
    }

    pub fn search(&self, pathname: &str) -> bool {
        self.entries
            .read()
            .unwrap()
            .iter()
            .any(|e| e.pathname == pathname)
    }

    /// Raise the stored size to at least `size`.
    pub fn fsync(&self, pathname: &str, size: u64) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.pathname == pathname)
            .ok_or(Error::Errno(errno::ENOENT))?;
        entry.size = entry.size.max(size);
        Ok(())
    }

    pub fn filelen(&self, pathname: &str) -> Result<u64> {
        let entries = self.entries.read().unwrap();
        let entry = entries
            .iter()
            .find(|e| e.pathname == pathname)
            .ok_or(Error::Errno(errno::ENOENT))?;
        Ok(entry.size)
    }

    /// Set the stored size outright (truncate). Extents past the cut stay
    /// in the fmap; their data is orphaned, not re-exposed, because the
    /// size bound clips every read.
    pub fn set_len(&self, pathname: &str, size: u64) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.pathname == pathname)
            .ok_or(Error::Errno(errno::ENOENT))?;
        entry.size = size;
        if let Some(fmap) = &mut entry.fmap {
            fmap.sb.size = size;
        }
        Ok(())
    }

    /// Install a freshly harvested fmap, or merge it into the stored one.
    pub fn addfmap(&self, pathname: &str, new_fmap: Fmap) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.pathname == pathname)
            .ok_or(Error::Errno(errno::ENOENT))?;

        match &mut entry.fmap {
            Some(stored) => stored.merge(&new_fmap),
            None => entry.fmap = Some(new_fmap),
        }
        entry.refs = entry.refs.saturating_sub(1);
        Ok(())
    }

    /// Copy of the stored fmap, made while the read lock is held, so a
    /// concurrent merge can never invalidate what the caller works with.
    pub fn getfmap(&self, pathname: &str) -> Result<Fmap> {
        let entries = self.entries.read().unwrap();
        let entry = entries
            .iter()
            .find(|e| e.pathname == pathname)
            .ok_or(Error::Errno(errno::ENOENT))?;
        entry.fmap.clone().ok_or(Error::Errno(errno::EINVAL))
    }

    pub fn stat(&self, pathname: &str) -> Result<StatSnap> {
        let entries = self.entries.read().unwrap();
        let entry = entries
            .iter()
            .find(|e| e.pathname == pathname)
            .ok_or(Error::Errno(errno::ENOENT))?;
        entry.fmap.as_ref().map(|f| f.sb).ok_or(Error::Errno(errno::ENOENT))
    }
}

impl Default for MdsTable {
    fn default() -> MdsTable {
        MdsTable::new()
    }
}

/// Routing layer: execute at the local shard when we own the name, else
/// invoke the owner.
pub struct Mds {
    rank: u32,
    nranks: u32,
    pub table: MdsTable,
    peers: Arc<Peers>,
}

impl Mds {
    pub fn new(rank: u32, nranks: u32, peers: Arc<Peers>) -> Mds {
        Mds {
            rank,
            nranks,
            table: MdsTable::new(),
            peers,
        }
    }

    pub fn owner(&self, pathname: &str) -> u32 {
        shard_owner(pathname, self.nranks)
    }

    pub async fn create(&self, pathname: &str) -> Result<()> {
        let owner = self.owner(pathname);
        tracing::debug!(pathname, owner, "mds create");
        if owner == self.rank {
            return self.table.create(pathname);
        }
        let channel = self.peers.channel(owner).await?;
        let resp: msg::MdsCreateResponse = channel
            .call(
                op::MDS_CREATE,
                &msg::MdsCreateRequest {
                    pathname: pathname.to_string(),
                },
            )
            .await?;
        check(resp.status)
    }

    pub async fn search(&self, pathname: &str) -> Result<bool> {
        let owner = self.owner(pathname);
        if owner == self.rank {
            return Ok(self.table.search(pathname));
        }
        let channel = self.peers.channel(owner).await?;
        let resp: msg::MdsSearchResponse = channel
            .call(
                op::MDS_SEARCH,
                &msg::MdsSearchRequest {
                    pathname: pathname.to_string(),
                },
            )
            .await?;
        check(resp.status)?;
        Ok(resp.found != 0)
    }

    pub async fn fsync(&self, pathname: &str, size: u64) -> Result<()> {
        let owner = self.owner(pathname);
        if owner == self.rank {
            return self.table.fsync(pathname, size);
        }
        let channel = self.peers.channel(owner).await?;
        let resp: msg::MdsFsyncResponse = channel
            .call(
                op::MDS_FSYNC,
                &msg::MdsFsyncRequest {
                    pathname: pathname.to_string(),
                    size,
                },
            )
            .await?;
        check(resp.status)
    }

    pub async fn set_len(&self, pathname: &str, size: u64) -> Result<()> {
        let owner = self.owner(pathname);
        if owner == self.rank {
            return self.table.set_len(pathname, size);
        }
        let channel = self.peers.channel(owner).await?;
        let resp: msg::MdsFsyncResponse = channel
            .call(
                op::MDS_SETLEN,
                &msg::MdsFsyncRequest {
                    pathname: pathname.to_string(),
                    size,
                },
            )
            .await?;
        check(resp.status)
    }

    pub async fn filelen(&self, pathname: &str) -> Result<u64> {
        let owner = self.owner(pathname);
        if owner == self.rank {
            return self.table.filelen(pathname);
        }
        let channel = self.peers.channel(owner).await?;
        let resp: msg::MdsFilelenResponse = channel
            .call(
                op::MDS_FILELEN,
                &msg::MdsFilelenRequest {
                    pathname: pathname.to_string(),
                },
            )
            .await?;
        check(resp.status)?;
        Ok(resp.size)
    }

    /// Harvest the backing file at `rpath` and install or forward the
    /// resulting fmap. The forwarded copy travels as a bulk pull against
    /// our registry; the registration is released once the owner answers.
    pub async fn addfmap(&self, pathname: &str, rpath: &std::path::Path) -> Result<()> {
        let fmap = crate::harvest::harvest(rpath, self.rank)?;

        let owner = self.owner(pathname);
        tracing::debug!(pathname, owner, extents = fmap.extents.len(), "mds addfmap");
        if owner == self.rank {
            return self.table.addfmap(pathname, fmap);
        }

        let channel = self.peers.channel(owner).await?;
        let handle = channel.bulk().register_ro(fmap.to_bytes());
        let result: Result<msg::MdsAddfmapResponse> = channel
            .call(
                op::MDS_ADDFMAP,
                &msg::MdsAddfmapRequest {
                    pathname: pathname.to_string(),
                    fmap: handle.as_ref(),
                },
            )
            .await
            .map_err(Into::into);
        channel.bulk().unregister(handle);
        check(result?.status)
    }

    pub async fn getfmap(&self, pathname: &str) -> Result<Fmap> {
        let owner = self.owner(pathname);
        if owner == self.rank {
            return self.table.getfmap(pathname);
        }

        let channel = self.peers.channel(owner).await?;
        let resp: msg::MdsGetfmapResponse = channel
            .call(
                op::MDS_GETFMAP,
                &msg::MdsGetfmapRequest {
                    pathname: pathname.to_string(),
                },
            )
            .await?;
        check(resp.status)?;

        let bytes = channel.pull(resp.fmap).await?;
        Ok(Fmap::from_bytes(bytes)?)
    }

    pub async fn stat(&self, pathname: &str) -> Result<StatSnap> {
        let owner = self.owner(pathname);
        if owner == self.rank {
            return self.table.stat(pathname);
        }
        let channel = self.peers.channel(owner).await?;
        let resp: msg::MdsStatResponse = channel
            .call(
                op::MDS_STAT,
                &msg::MdsStatRequest {
                    pathname: pathname.to_string(),
                },
            )
            .await?;
        check(resp.status)?;
        Ok(resp.sb)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proto_shoal::FmapExtent;

    fn fmap_of(rank: u32, offset: u64, length: u64, size: u64) -> Fmap {
        Fmap::new(
            rank,
            StatSnap {
                size,
                blocks: (length / 512).max(1),
                ..Default::default()
            },
            vec![FmapExtent {
                rank,
                offset,
                length,
            }],
        )
    }

    #[test]
    fn create_then_search_and_duplicate_create() {
        let table = MdsTable::new();
        table.create("/m/a").unwrap();
        assert!(table.search("/m/a"));
        assert!(!table.search("/m/b"));
        assert_eq!(table.create("/m/a").unwrap_err().errno(), errno::EEXIST);
    }

    #[test]
    fn fsync_only_raises_the_size() {
        let table = MdsTable::new();
        table.create("/m/f").unwrap();

        table.fsync("/m/f", 4096).unwrap();
        table.fsync("/m/f", 1024).unwrap();
        assert_eq!(table.filelen("/m/f").unwrap(), 4096);

        table.fsync("/m/f", 8192).unwrap();
        assert_eq!(table.filelen("/m/f").unwrap(), 8192);

        assert_eq!(
            table.fsync("/m/missing", 1).unwrap_err().errno(),
            errno::ENOENT
        );
    }

    #[test]
    fn addfmap_installs_then_merges_sorted() {
        let table = MdsTable::new();
        table.create("/m/f").unwrap();

        assert_eq!(table.getfmap("/m/f").unwrap_err().errno(), errno::EINVAL);

        table.addfmap("/m/f", fmap_of(1, 4096, 4096, 8192)).unwrap();
        table.addfmap("/m/f", fmap_of(0, 0, 4096, 4096)).unwrap();

        let merged = table.getfmap("/m/f").unwrap();
        assert_eq!(merged.extents.len(), 2);
        assert!(merged
            .extents
            .windows(2)
            .all(|w| w[0].offset <= w[1].offset));
        assert_eq!(merged.sb.size, 8192);

        let sb = table.stat("/m/f").unwrap();
        assert_eq!(sb.size, 8192);
    }

    #[test]
    fn getfmap_returns_an_independent_copy() {
        let table = MdsTable::new();
        table.create("/m/f").unwrap();
        table.addfmap("/m/f", fmap_of(0, 0, 4096, 4096)).unwrap();

        let copy = table.getfmap("/m/f").unwrap();
        // A concurrent merge must not be visible through the copy.
        table.addfmap("/m/f", fmap_of(1, 4096, 4096, 8192)).unwrap();
        assert_eq!(copy.extents.len(), 1);
    }

    #[test]
    fn stat_without_fmap_is_enoent() {
        let table = MdsTable::new();
        table.create("/m/f").unwrap();
        assert_eq!(table.stat("/m/f").unwrap_err().errno(), errno::ENOENT);
    }

    #[test]
    fn capacity_overflow_is_enomem() {
        let table = MdsTable::new();
        for i in 0..MDS_TABLE_MAX_ENTRIES {
            table.create(&format!("/m/{i}")).unwrap();
        }
        assert_eq!(
            table.create("/m/too-many").unwrap_err().errno(),
            errno::ENOMEM
        );
    }
}
