//! Single-node end-to-end: a real client runtime (shared-memory superblock
//! and all) against a real server over the Unix socket, exercising the
//! write → close → harvest → read-back cycle, lamination, and staging.

use rand::{rngs::SmallRng, RngCore, SeedableRng};
use shoal::{Client, ClientConfig};
use shoal_rpc::Addr;
use shoald::dispatch::Dispatch;
use shoald::ServerState;
use std::path::PathBuf;
use std::sync::Arc;

/// Spin up a one-rank server on its own thread and runtime, serving the
/// default client socket under `spill`.
fn start_server(spill: PathBuf) {
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let state = ServerState::new(
                0,
                vec![Addr::Tcp("127.0.0.1:1".to_string())], // never dialed
                spill.clone(),
                1024 * 1024,
            )
            .unwrap();
            let handler: Arc<dyn shoal_rpc::Handler> = Arc::new(Dispatch(state));

            let socket = spill.join("shoald.sock");
            let _ = std::fs::remove_file(&socket);
            let listener = tokio::net::UnixListener::bind(&socket).unwrap();
            shoal_rpc::serve_unix(listener, handler).await.unwrap();
        });
    });
}

fn mount_client(spill: &PathBuf, prefix: &str) -> Client {
    let cfg = ClientConfig {
        spill_dir: spill.clone(),
        local_extents: false,
        ..Default::default()
    };
    Client::mount(prefix, 0, 1, 0, cfg).expect("mount")
}

#[test]
fn write_close_read_back_and_laminate() {
    let dir = tempfile::tempdir().unwrap();
    let spill = dir.path().join("spill");
    std::fs::create_dir_all(&spill).unwrap();
    start_server(spill.clone());

    let prefix = format!("/shoal-e2e-rw-{}", std::process::id());
    let client = mount_client(&spill, &prefix);
    let super_name = client.superblock_region_name();

    // Name-length boundary: one byte under the cap passes the length
    // check, at the cap fails.
    let room = proto_shoal::MAX_FILENAME - 1 - prefix.len() - 1;
    let longest = format!("{prefix}/{}", "x".repeat(room));
    assert_eq!(longest.len(), proto_shoal::MAX_FILENAME - 1);
    let err = client
        .open(&format!("{longest}x"), libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap_err();
    assert_eq!(err.errno(), proto_shoal::errno::ENAMETOOLONG);

    let path = format!("{prefix}/f");
    let mut pattern = vec![0u8; 64 * 1024];
    SmallRng::seed_from_u64(11).fill_bytes(&mut pattern);

    // Writer: create, write 64 KiB, close (which harvests).
    let fd = client
        .open(&path, libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    assert_eq!(client.write(fd, &pattern).unwrap(), pattern.len());
    client.close(fd).unwrap();

    // Reader: size is visible and the bytes come back intact.
    let sb = client.stat(&path).unwrap();
    assert_eq!(sb.size, pattern.len() as u64);

    let fd = client.open(&path, libc::O_RDONLY, 0).unwrap();
    let mut readback = vec![0u8; pattern.len()];
    let mut got = 0;
    while got < readback.len() {
        let n = client.read(fd, &mut readback[got..]).unwrap();
        assert!(n > 0, "unexpected EOF at {got}");
        got += n;
    }
    assert_eq!(readback, pattern);

    // EOF after the last byte.
    let mut probe = [0u8; 16];
    assert_eq!(client.read(fd, &mut probe).unwrap(), 0);

    // A batched read answers several ranges in one round trip.
    let mut first = vec![0u8; 512];
    let mut second = vec![0u8; 512];
    let total = client
        .mread(
            fd,
            &mut [(0, first.as_mut_slice()), (32 * 1024, second.as_mut_slice())],
        )
        .unwrap();
    assert_eq!(total, 1024);
    assert_eq!(first, pattern[..512]);
    assert_eq!(second, pattern[32 * 1024..32 * 1024 + 512]);

    client.close(fd).unwrap();

    // Clearing the write bits laminates; writable opens and truncate are
    // refused from then on.
    client.chmod(&path, 0o444).unwrap();
    let err = client.open(&path, libc::O_WRONLY, 0).unwrap_err();
    assert_eq!(err.errno(), proto_shoal::errno::EROFS);
    let err = client.truncate(&path, 0).unwrap_err();
    assert_eq!(err.errno(), proto_shoal::errno::EINVAL);

    // Laminated size answers from the cached global size.
    let sb = client.stat(&path).unwrap();
    assert_eq!(sb.size, pattern.len() as u64);

    client.unmount().unwrap();
    // The superblock region survives unmount by design; scrub it so the
    // next run starts fresh.
    let _ = shoal_shm::Region::unlink(&super_name);
}

#[test]
fn lseek_and_sparse_read() {
    let dir = tempfile::tempdir().unwrap();
    let spill = dir.path().join("spill");
    std::fs::create_dir_all(&spill).unwrap();
    start_server(spill.clone());

    let prefix = format!("/shoal-e2e-seek-{}", std::process::id());
    let client = mount_client(&spill, &prefix);
    let super_name = client.superblock_region_name();

    let path = format!("{prefix}/sparse");
    let fd = client
        .open(&path, libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();

    // Two writes with a hole between them.
    client.write(fd, b"head").unwrap();
    client.lseek(fd, 8192, libc::SEEK_SET).unwrap();
    client.write(fd, b"tail").unwrap();
    client.close(fd).unwrap();

    let sb = client.stat(&path).unwrap();
    assert_eq!(sb.size, 8196);

    let fd = client.open(&path, libc::O_RDONLY, 0).unwrap();
    let mut buf = vec![0u8; 8196];
    let mut got = 0;
    while got < buf.len() {
        let n = client.read(fd, &mut buf[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(&buf[..4], b"head");
    assert!(buf[4..8192].iter().all(|b| *b == 0));
    assert_eq!(&buf[8192..], b"tail");
    client.close(fd).unwrap();

    client.unmount().unwrap();
    // The superblock region survives unmount by design; scrub it so the
    // next run starts fresh.
    let _ = shoal_shm::Region::unlink(&super_name);
}

#[test]
fn stage_in_laminates_the_destination() {
    let dir = tempfile::tempdir().unwrap();
    let spill = dir.path().join("spill");
    std::fs::create_dir_all(&spill).unwrap();
    start_server(spill.clone());

    let prefix = format!("/shoal-e2e-stage-{}", std::process::id());
    let client = mount_client(&spill, &prefix);
    let super_name = client.superblock_region_name();

    // A 200 KiB source outside the mount.
    let src = dir.path().join("source.bin");
    let mut payload = vec![0u8; 200 * 1024];
    SmallRng::seed_from_u64(23).fill_bytes(&mut payload);
    std::fs::write(&src, &payload).unwrap();

    let dst = format!("{prefix}/staged");
    client
        .transfer_file(src.to_str().unwrap(), &dst, true)
        .unwrap();

    // The destination is laminated at the source size...
    let sb = client.stat(&dst).unwrap();
    assert_eq!(sb.size, payload.len() as u64);
    let err = client.open(&dst, libc::O_WRONLY, 0).unwrap_err();
    assert_eq!(err.errno(), proto_shoal::errno::EROFS);

    // ...and reads back the original bytes.
    let fd = client.open(&dst, libc::O_RDONLY, 0).unwrap();
    let mut readback = vec![0u8; payload.len()];
    let mut got = 0;
    while got < readback.len() {
        let n = client.read(fd, &mut readback[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(readback, payload);
    client.close(fd).unwrap();

    client.unmount().unwrap();
    // The superblock region survives unmount by design; scrub it so the
    // next run starts fresh.
    let _ = shoal_shm::Region::unlink(&super_name);
}
