//! Registered operation names. A caller and its peer must agree on these
//! strings; the transport dispatches on them verbatim.

// Client -> local server.
pub const ATTACH: &str = "attach";
pub const MOUNT: &str = "mount";
pub const UNMOUNT: &str = "unmount";
pub const METASET: &str = "metaset";
pub const METAGET: &str = "metaget";
pub const FILESIZE: &str = "filesize";
pub const TRUNCATE: &str = "truncate";
pub const UNLINK: &str = "unlink";
pub const LAMINATE: &str = "laminate";
pub const SYNC: &str = "sync";
pub const READ: &str = "read";
pub const MREAD: &str = "mread";
pub const LSM_OPEN: &str = "lsm_open";
pub const LSM_CLOSE: &str = "lsm_close";
pub const LSM_STAT: &str = "lsm_stat";

// Server -> server.
pub const MDS_CREATE: &str = "mds_create";
pub const MDS_SEARCH: &str = "mds_search";
pub const MDS_FSYNC: &str = "mds_fsync";
pub const MDS_SETLEN: &str = "mds_setlen";
pub const MDS_FILELEN: &str = "mds_filelen";
pub const MDS_ADDFMAP: &str = "mds_addfmap";
pub const MDS_GETFMAP: &str = "mds_getfmap";
pub const MDS_STAT: &str = "mds_stat";
pub const CHUNK_READ: &str = "chunk_read";

// File-attribute shard traffic (the key-value backend for attributes rides
// the same transport, sharded by gfid).
pub const ATTR_SET: &str = "attr_set";
pub const ATTR_GET: &str = "attr_get";
pub const ATTR_REMOVE: &str = "attr_remove";
