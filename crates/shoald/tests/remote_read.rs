//! The cross-node read path end to end: a client mounted on rank 0 reads a
//! file whose bytes live on rank 1. Its local server fetches the fmap,
//! publishes it, pulls the remote extents with chunk-reads, and lands the
//! assembly in the client's recv region.

use rand::{rngs::SmallRng, RngCore, SeedableRng};
use shoal::{Client, ClientConfig};
use shoal_rpc::Addr;
use shoald::dispatch::Dispatch;
use shoald::ServerState;
use std::sync::Arc;

#[test]
fn reader_sees_bytes_written_on_a_peer_node() {
    let dir = tempfile::tempdir().unwrap();
    let spill0 = dir.path().join("node0");
    let spill1 = dir.path().join("node1");
    std::fs::create_dir_all(&spill0).unwrap();
    std::fs::create_dir_all(&spill1).unwrap();

    let prefix = format!("/shoal-remote-{}", std::process::id());
    let path = format!("{prefix}/f");
    let gfid = proto_shoal::gfid(&path);

    let mut payload = vec![0u8; 96 * 1024];
    SmallRng::seed_from_u64(42).fill_bytes(&mut payload);

    // The server pair runs on its own thread and runtime; the sender hands
    // the states back once both endpoints are live.
    let (tx, rx) = std::sync::mpsc::channel();
    {
        let spill0 = spill0.clone();
        let spill1 = spill1.clone();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let l0 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let l1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addrs = vec![
                    Addr::Tcp(l0.local_addr().unwrap().to_string()),
                    Addr::Tcp(l1.local_addr().unwrap().to_string()),
                ];

                let state0 =
                    ServerState::new(0, addrs.clone(), spill0.clone(), 1024 * 1024).unwrap();
                let state1 = ServerState::new(1, addrs, spill1.clone(), 1024 * 1024).unwrap();

                let h0: Arc<dyn shoal_rpc::Handler> = Arc::new(Dispatch(state0.clone()));
                let h1: Arc<dyn shoal_rpc::Handler> = Arc::new(Dispatch(state1.clone()));
                tokio::spawn(shoal_rpc::serve_tcp(l0, h0.clone()));
                tokio::spawn(shoal_rpc::serve_tcp(l1, h1));

                let socket = spill0.join("shoald.sock");
                let _ = std::fs::remove_file(&socket);
                let listener = tokio::net::UnixListener::bind(&socket).unwrap();
                tokio::spawn(shoal_rpc::serve_unix(listener, h0));

                tx.send((state0, state1)).unwrap();
                // Keep the runtime alive for the duration of the test.
                run_forever().await;
            });
        });
    }
    let (_state0, state1) = rx.recv().unwrap();

    // Act as the writer's server on node 1: backing file, attribute
    // record, MDS entry, harvest.
    let server_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    server_rt.block_on(async {
        let rpath = state1.lsm.realpath(&path);
        std::fs::create_dir_all(rpath.parent().unwrap()).unwrap();
        std::fs::write(&rpath, &payload).unwrap();

        state1
            .attrs
            .set(
                true,
                proto_shoal::messages::FileAttr {
                    gfid,
                    filename: path.clone(),
                    mode: 0o100644,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        state1.mds.create(&path).await.unwrap();
        state1.mds.fsync(&path, payload.len() as u64).await.unwrap();
        state1.mds.addfmap(&path, &rpath).await.unwrap();
    });

    // A client on node 0 opens the file read-only and reads it through:
    // every extent is remote, so the bytes arrive via recv shm.
    let cfg = ClientConfig {
        spill_dir: spill0.clone(),
        ..Default::default()
    };
    let client = Client::mount(&prefix, 0, 2, 0, cfg).unwrap();
    let super_name = client.superblock_region_name();

    let sb = client.stat(&path).unwrap();
    assert_eq!(sb.size, payload.len() as u64);

    let fd = client.open(&path, libc::O_RDONLY, 0).unwrap();
    let mut readback = vec![0u8; payload.len()];
    let mut got = 0;
    while got < readback.len() {
        let n = client.read(fd, &mut readback[got..]).unwrap();
        assert!(n > 0, "unexpected EOF at {got}");
        got += n;
    }
    assert_eq!(readback, payload);
    client.close(fd).unwrap();

    client.unmount().unwrap();
    let _ = shoal_shm::Region::unlink(&super_name);
}

async fn run_forever() {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
