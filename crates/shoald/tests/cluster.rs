//! Cross-rank MDS behavior over real TCP connections: deterministic
//! sharding, owner forwarding, and the two-writer fmap merge.

use shoal_rpc::Addr;
use shoald::dispatch::Dispatch;
use shoald::ServerState;
use std::sync::Arc;

/// Bind `n` ranks on ephemeral localhost ports, serve their peer
/// endpoints, and hand back the states.
async fn cluster(n: usize, spills: &[tempfile::TempDir]) -> Vec<Arc<ServerState>> {
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..n {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(Addr::Tcp(listener.local_addr().unwrap().to_string()));
        listeners.push(listener);
    }

    let mut states = Vec::new();
    for (rank, listener) in listeners.into_iter().enumerate() {
        let state = ServerState::new(
            rank as u32,
            addrs.clone(),
            spills[rank].path().to_path_buf(),
            1024 * 1024,
        )
        .unwrap();
        let handler: Arc<dyn shoal_rpc::Handler> = Arc::new(Dispatch(state.clone()));
        tokio::spawn(shoal_rpc::serve_tcp(listener, handler));
        states.push(state);
    }
    states
}

/// A path under `/m` owned by `want_owner` among `nranks` shards.
fn path_owned_by(want_owner: u32, nranks: u32) -> String {
    for i in 0..10_000 {
        let path = format!("/m/file-{i}");
        if proto_shoal::shard_owner(&path, nranks) == want_owner {
            return path;
        }
    }
    unreachable!("no path hashed to rank {want_owner}");
}

#[tokio::test]
async fn every_rank_computes_the_same_owner() {
    for name in ["/m/a", "/m/b", "/m/c"] {
        let owners: Vec<u32> = (0..4).map(|_| proto_shoal::shard_owner(name, 4)).collect();
        assert!(owners.windows(2).all(|w| w[0] == w[1]));
        assert!(owners[0] < 4);
    }
}

#[tokio::test]
async fn create_search_fsync_filelen_forward_to_the_owner() {
    let spills: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
    let states = cluster(2, &spills).await;

    // A name owned by rank 1, operated on from rank 0: every call crosses
    // the wire.
    let path = path_owned_by(1, 2);

    assert!(!states[0].mds.search(&path).await.unwrap());
    states[0].mds.create(&path).await.unwrap();
    assert!(states[0].mds.search(&path).await.unwrap());
    assert!(states[1].mds.table.search(&path));

    // Repeated create answers EEXIST through the forwarding layer too.
    let err = states[0].mds.create(&path).await.unwrap_err();
    assert_eq!(err.errno(), proto_shoal::errno::EEXIST);

    states[0].mds.fsync(&path, 4096).await.unwrap();
    states[1].mds.fsync(&path, 1024).await.unwrap();
    assert_eq!(states[0].mds.filelen(&path).await.unwrap(), 4096);
    assert_eq!(states[1].mds.filelen(&path).await.unwrap(), 4096);
}

#[tokio::test]
async fn two_writer_harvests_merge_at_the_owner() {
    let spills: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
    let states = cluster(2, &spills).await;

    let path = path_owned_by(0, 2);
    states[1].mds.create(&path).await.unwrap();

    // Each rank writes its own backing file and harvests it: rank 0 owns
    // the first 4 KiB, rank 1 the next.
    for (rank, state) in states.iter().enumerate() {
        let rpath = state.lsm.realpath(&path);
        std::fs::create_dir_all(rpath.parent().unwrap()).unwrap();
        let data = vec![rank as u8 + 1; 4096];
        let file = std::fs::File::create(&rpath).unwrap();
        use std::os::unix::fs::FileExt;
        file.write_all_at(&data, rank as u64 * 4096).unwrap();
        file.sync_all().unwrap();

        state.mds.addfmap(&path, &rpath).await.unwrap();
    }

    // Any rank's getfmap sees both contributions, sorted by offset.
    for state in &states {
        let fmap = state.mds.getfmap(&path).await.unwrap();
        assert!(fmap.extents.len() >= 2);
        assert!(fmap
            .extents
            .windows(2)
            .all(|w| w[0].offset <= w[1].offset));
        assert_eq!(fmap.sb.size, 8192);

        let ranks: std::collections::HashSet<u32> =
            fmap.extents.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, [0u32, 1].into_iter().collect());

        let sb = state.mds.stat(&path).await.unwrap();
        assert_eq!(sb.size, 8192);
    }
}

#[tokio::test]
async fn getfmap_without_a_harvest_is_einval() {
    let spills: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
    let states = cluster(2, &spills).await;

    let path = path_owned_by(1, 2);
    states[0].mds.create(&path).await.unwrap();

    let err = states[0].mds.getfmap(&path).await.unwrap_err();
    assert_eq!(err.errno(), proto_shoal::errno::EINVAL);

    let err = states[0].mds.stat(&path).await.unwrap_err();
    assert_eq!(err.errno(), proto_shoal::errno::ENOENT);
}

#[tokio::test]
async fn chunk_read_pulls_remote_bytes() {
    let spills: Vec<_> = (0..2).map(|_| tempfile::tempdir().unwrap()).collect();
    let states = cluster(2, &spills).await;

    // Rank 1 holds the bytes; rank 0 fetches them.
    let path = "/m/chunky";
    let rpath = states[1].lsm.realpath(path);
    std::fs::create_dir_all(rpath.parent().unwrap()).unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
    std::fs::write(&rpath, &payload).unwrap();

    let fetched = states[0]
        .read_remote(1, path, 1000, 150_000)
        .await
        .unwrap();
    assert_eq!(&fetched[..], &payload[1000..151_000]);
}
