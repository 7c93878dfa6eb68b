use bytes::Bytes;
use proto_shoal::messages::{MdsFilelenRequest, MdsFilelenResponse};
use proto_shoal::wire::Wire;
use proto_shoal::{errno, op};
use shoal_rpc::{Channel, Error, Handler};
use std::sync::Arc;

/// Answers mds_filelen with the pathname length; pulls and re-registers
/// any bulk region named in a "bulk_echo" request.
struct EchoService;

#[async_trait::async_trait]
impl Handler for EchoService {
    async fn handle(&self, peer: Channel, op: &str, payload: Bytes) -> Result<Bytes, i32> {
        match op {
            op::MDS_FILELEN => {
                let req = MdsFilelenRequest::from_bytes(payload).map_err(|_| errno::EINVAL)?;
                let resp = MdsFilelenResponse {
                    status: 0,
                    size: req.pathname.len() as u64,
                };
                Ok(resp.to_bytes())
            }
            "bulk_echo" => {
                let req = proto_shoal::messages::MdsAddfmapRequest::from_bytes(payload)
                    .map_err(|_| errno::EINVAL)?;
                let data = peer.pull(req.fmap).await.map_err(|_| errno::EIO)?;

                // Push the bytes back, reversed, into the same-sized sink the
                // caller registered right after the source region.
                let reversed: Vec<u8> = data.iter().rev().copied().collect();
                let sink = proto_shoal::messages::BulkRef {
                    region: req.fmap.region + 1,
                    len: req.fmap.len,
                };
                peer.push(sink, &reversed).await.map_err(|_| errno::EIO)?;

                Ok(proto_shoal::messages::MdsAddfmapResponse { status: 0 }.to_bytes())
            }
            _ => Err(errno::ENOTSUP),
        }
    }
}

fn pair() -> (Channel, Channel) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let server = Channel::spawn(a, Some(Arc::new(EchoService)));
    let client = Channel::spawn(b, None);
    (server, client)
}

#[tokio::test]
async fn call_round_trips() {
    let (_server, client) = pair();

    let resp: MdsFilelenResponse = client
        .call(
            op::MDS_FILELEN,
            &MdsFilelenRequest {
                pathname: "/m/f".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 0);
    assert_eq!(resp.size, 4);
}

#[tokio::test]
async fn unknown_op_surfaces_the_dispatcher_errno() {
    let (_server, client) = pair();

    let result: shoal_rpc::Result<MdsFilelenResponse> = client
        .call(
            "no_such_op",
            &MdsFilelenRequest {
                pathname: "/m/f".to_string(),
            },
        )
        .await;
    match result {
        Err(Error::Remote(e)) => assert_eq!(e, errno::ENOTSUP),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn bulk_pull_and_push_move_large_payloads() {
    let (_server, client) = pair();

    // 300 KiB source exercises chunking in both directions.
    let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
    let source = client.bulk().register_ro(Bytes::from(payload.clone()));
    let sink = client.bulk().register_rw(payload.len());
    assert_eq!(sink.region, source.region + 1);

    let resp: proto_shoal::messages::MdsAddfmapResponse = client
        .call(
            "bulk_echo",
            &proto_shoal::messages::MdsAddfmapRequest {
                pathname: "/m/f".to_string(),
                fmap: source.as_ref(),
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.status, 0);

    let echoed = client.bulk().take(sink).unwrap();
    let expected: Vec<u8> = payload.iter().rev().copied().collect();
    assert_eq!(echoed, expected);

    client.bulk().unregister(source);
}

#[tokio::test]
async fn calls_fail_cleanly_after_the_peer_hangs_up() {
    let (server, client) = pair();
    server.shutdown();
    client.closed().await;

    // The demux task noticed the closed pipe; the call fails rather than
    // hanging.
    let result: shoal_rpc::Result<MdsFilelenResponse> = client
        .call(
            op::MDS_FILELEN,
            &MdsFilelenRequest {
                pathname: "/m/f".to_string(),
            },
        )
        .await;
    assert!(result.is_err());
}
