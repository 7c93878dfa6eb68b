use crate::{frame::Frame, BulkRegistry, Error, Handler, Result};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use proto_shoal::messages::BulkRef;
use proto_shoal::wire::Wire;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Bulk data moves in frames of at most this many bytes.
const BULK_CHUNK: usize = 128 * 1024;

/// Frames (headers plus one bulk chunk) never exceed this.
const MAX_FRAME: usize = 2 * 1024 * 1024;

/// A dialable endpoint: TCP for server peers, a Unix socket for the
/// co-located client/server pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Tcp(String),
    Unix(std::path::PathBuf),
}

impl std::str::FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Addr> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::BadAddr(s.to_string()));
            }
            Ok(Addr::Unix(path.into()))
        } else if s.contains(':') {
            Ok(Addr::Tcp(s.to_string()))
        } else {
            Err(Error::BadAddr(s.to_string()))
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Addr::Tcp(s) => write!(f, "{s}"),
            Addr::Unix(p) => write!(f, "unix:{}", p.display()),
        }
    }
}

/// One side of a connection. Cheap to clone; all clones share the socket,
/// the bulk registry, and the in-flight call table. Each [`Channel::call`]
/// is one in-flight request/response exchange; concurrent calls from
/// different tasks multiplex by call id.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    next_call: AtomicU64,
    next_xfer: AtomicU64,
    registry: BulkRegistry,
    out: mpsc::UnboundedSender<Frame>,
    calls: Mutex<HashMap<u64, oneshot::Sender<Bytes>>>,
    pulls: Mutex<HashMap<u64, PullState>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<i32>>>,
    failed_pushes: Mutex<HashSet<u64>>,
    shutdown: watch::Sender<bool>,
    closed: watch::Receiver<bool>,
}

struct PullState {
    buf: BytesMut,
    done: oneshot::Sender<Bytes>,
}

impl Channel {
    /// Dial `addr` once. `handler` serves requests the peer originates on
    /// this connection; pass `None` for call-only endpoints (bulk pulls and
    /// pushes against this side's registry are always served).
    pub async fn connect(addr: &Addr, handler: Option<Arc<dyn Handler>>) -> Result<Channel> {
        match addr {
            Addr::Tcp(host) => {
                let stream = tokio::net::TcpStream::connect(host).await?;
                stream.set_nodelay(true)?;
                Ok(Channel::spawn(stream, handler))
            }
            Addr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Channel::spawn(stream, handler))
            }
        }
    }

    /// Dial with bounded exponential backoff across transient connect
    /// failures.
    pub async fn connect_with_retry(
        addr: &Addr,
        handler: Option<Arc<dyn Handler>>,
        attempts: u32,
    ) -> Result<Channel> {
        let backoff = exponential_backoff::Backoff::new(
            attempts,
            Duration::from_millis(100),
            Some(Duration::from_secs(2)),
        );

        let mut errors = 0;
        loop {
            match Channel::connect(addr, handler.clone()).await {
                Ok(channel) => return Ok(channel),
                Err(err) => {
                    errors += 1;
                    let Some(pause) = backoff.next(errors) else {
                        return Err(err);
                    };
                    tracing::warn!(%addr, %err, ?pause, "connect failed; backing off");
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// Wrap an established stream. Spawns the writer and demux tasks; the
    /// connection lives until the peer hangs up or every clone is dropped.
    pub fn spawn<S>(io: S, handler: Option<Arc<dyn Handler>>) -> Channel
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME)
                .new_codec()
        };
        let mut frames_in = FramedRead::new(read_half, codec());
        let mut frames_out = FramedWrite::new(write_half, codec());

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            next_call: AtomicU64::new(1),
            next_xfer: AtomicU64::new(1),
            registry: BulkRegistry::new(),
            out: out_tx,
            calls: Mutex::new(HashMap::new()),
            pulls: Mutex::new(HashMap::new()),
            acks: Mutex::new(HashMap::new()),
            failed_pushes: Mutex::new(HashSet::new()),
            shutdown: shutdown_tx,
            closed: closed_rx,
        });

        let mut writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut scratch = BytesMut::new();
            loop {
                tokio::select! {
                    maybe = out_rx.recv() => {
                        let Some(frame) = maybe else { break };
                        scratch.clear();
                        frame.encode(&mut scratch);
                        if let Err(err) = frames_out.send(scratch.split().freeze()).await {
                            tracing::debug!(%err, "write side closed");
                            break;
                        }
                    }
                    _ = writer_shutdown.changed() => break,
                }
            }
            // Half-close so the peer's read side sees EOF.
            let _ = frames_out.close().await;
        });

        let channel = Channel {
            inner: inner.clone(),
        };
        let demux = channel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = frames_in.next() => next,
                    _ = shutdown_rx.changed() => break,
                };
                let Some(next) = next else { break };
                let raw = match next {
                    Ok(raw) => raw.freeze(),
                    Err(err) => {
                        tracing::debug!(%err, "read side closed");
                        break;
                    }
                };
                let frame = match Frame::decode(raw) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(%err, "dropping undecodable frame");
                        continue;
                    }
                };
                demux.dispatch(frame, handler.as_ref());
            }

            // Fail everything still waiting, then flag the closure.
            demux.inner.calls.lock().unwrap().clear();
            demux.inner.pulls.lock().unwrap().clear();
            demux.inner.acks.lock().unwrap().clear();
            let _ = closed_tx.send(true);
        });

        channel
    }

    /// Close the connection from this side. In-flight calls fail with
    /// [`Error::Closed`]; the peer observes EOF.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// Typed call: encode the request, wait for the peer's response, decode.
    /// The call blocks its task until the exchange completes or the
    /// connection dies.
    pub async fn call<Req: Wire, Resp: Wire>(&self, op: &str, req: &Req) -> Result<Resp> {
        let call_id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.calls.lock().unwrap().insert(call_id, tx);

        let sent = self.inner.out.send(Frame::Request {
            call_id,
            op: op.to_string(),
            payload: req.to_bytes(),
        });
        if sent.is_err() {
            self.inner.calls.lock().unwrap().remove(&call_id);
            return Err(Error::Closed);
        }

        // Also watch for closure: the demux task only fails entries present
        // when it exits, not ones registered afterward.
        let payload = tokio::select! {
            result = rx => result.map_err(|_| Error::Closed)?,
            _ = self.closed() => {
                self.inner.calls.lock().unwrap().remove(&call_id);
                return Err(Error::Closed);
            }
        };

        match Resp::from_bytes(payload.clone()) {
            Ok(resp) => Ok(resp),
            // A bare nonzero errno means the dispatcher itself refused the
            // request (unknown op, undecodable payload).
            Err(_) if payload.len() == 4 => {
                let errno = i32::from_le_bytes(payload[..].try_into().unwrap());
                Err(Error::Remote(errno))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Pull the peer's registered region in full.
    pub async fn pull(&self, at: BulkRef) -> Result<Bytes> {
        let xfer_id = self.inner.next_xfer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pulls.lock().unwrap().insert(
            xfer_id,
            PullState {
                buf: BytesMut::with_capacity(at.len as usize),
                done: tx,
            },
        );

        let sent = self.inner.out.send(Frame::BulkPull {
            xfer_id,
            region: at.region,
            offset: 0,
            len: at.len,
        });
        if sent.is_err() {
            self.inner.pulls.lock().unwrap().remove(&xfer_id);
            return Err(Error::Closed);
        }

        let data = tokio::select! {
            result = rx => result.map_err(|_| Error::Closed)?,
            _ = self.closed() => {
                self.inner.pulls.lock().unwrap().remove(&xfer_id);
                return Err(Error::Closed);
            }
        };
        if data.len() as u64 != at.len {
            return Err(Error::BulkSize {
                expected: at.len,
                got: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Push `data` into the peer's registered writable region.
    pub async fn push(&self, at: BulkRef, data: &[u8]) -> Result<()> {
        if data.len() as u64 > at.len {
            return Err(Error::BulkSize {
                expected: at.len,
                got: data.len() as u64,
            });
        }

        let xfer_id = self.inner.next_xfer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.acks.lock().unwrap().insert(xfer_id, tx);

        let mut offset = 0usize;
        loop {
            let end = (offset + BULK_CHUNK).min(data.len());
            let eof = end == data.len();
            let sent = self.inner.out.send(Frame::BulkPush {
                xfer_id,
                region: at.region,
                offset: offset as u64,
                eof,
                data: Bytes::copy_from_slice(&data[offset..end]),
            });
            if sent.is_err() {
                self.inner.acks.lock().unwrap().remove(&xfer_id);
                return Err(Error::Closed);
            }
            if eof {
                break;
            }
            offset = end;
        }

        let status = tokio::select! {
            result = rx => result.map_err(|_| Error::Closed)?,
            _ = self.closed() => {
                self.inner.acks.lock().unwrap().remove(&xfer_id);
                return Err(Error::Closed);
            }
        };
        if status != 0 {
            return Err(Error::Remote(status));
        }
        Ok(())
    }

    /// This endpoint's bulk registrations.
    pub fn bulk(&self) -> &BulkRegistry {
        &self.inner.registry
    }

    /// Resolves when the connection is gone.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    fn dispatch(&self, frame: Frame, handler: Option<&Arc<dyn Handler>>) {
        match frame {
            Frame::Request {
                call_id,
                op,
                payload,
            } => {
                let Some(handler) = handler.cloned() else {
                    tracing::warn!(%op, "peer sent a request to a call-only endpoint");
                    self.answer_errno(call_id, proto_shoal::errno::ENOTSUP);
                    return;
                };
                let peer = self.clone();
                tokio::spawn(async move {
                    match handler.handle(peer.clone(), &op, payload).await {
                        Ok(payload) => {
                            let _ = peer.inner.out.send(Frame::Response { call_id, payload });
                        }
                        Err(errno) => peer.answer_errno(call_id, errno),
                    }
                });
            }
            Frame::Response { call_id, payload } => {
                if let Some(tx) = self.inner.calls.lock().unwrap().remove(&call_id) {
                    let _ = tx.send(payload);
                } else {
                    tracing::warn!(call_id, "response for unknown call");
                }
            }
            Frame::BulkPull {
                xfer_id,
                region,
                offset,
                len,
            } => self.serve_pull(xfer_id, region, offset, len),
            Frame::BulkData { xfer_id, eof, data } => {
                let mut pulls = self.inner.pulls.lock().unwrap();
                let Some(state) = pulls.get_mut(&xfer_id) else {
                    tracing::warn!(xfer_id, "bulk data for unknown transfer");
                    return;
                };
                state.buf.extend_from_slice(&data);
                if eof {
                    let state = pulls.remove(&xfer_id).unwrap();
                    let _ = state.done.send(state.buf.freeze());
                }
            }
            Frame::BulkPush {
                xfer_id,
                region,
                offset,
                eof,
                data,
            } => {
                if !self.inner.registry.write(region, offset, &data) {
                    self.inner.failed_pushes.lock().unwrap().insert(xfer_id);
                }
                if eof {
                    let failed = self.inner.failed_pushes.lock().unwrap().remove(&xfer_id);
                    let status = if failed {
                        proto_shoal::errno::EINVAL
                    } else {
                        0
                    };
                    let _ = self.inner.out.send(Frame::BulkAck { xfer_id, status });
                }
            }
            Frame::BulkAck { xfer_id, status } => {
                if let Some(tx) = self.inner.acks.lock().unwrap().remove(&xfer_id) {
                    let _ = tx.send(status);
                }
            }
        }
    }

    fn serve_pull(&self, xfer_id: u64, region: u64, offset: u64, len: u64) {
        let mut sent = 0u64;
        loop {
            let chunk_len = (len - sent).min(BULK_CHUNK as u64);
            let eof = sent + chunk_len == len;
            let Some(data) = self.inner.registry.read(region, offset + sent, chunk_len) else {
                tracing::warn!(region, offset, len, "bulk pull of unknown or short region");
                // A short answer; the puller notices the size mismatch.
                let _ = self.inner.out.send(Frame::BulkData {
                    xfer_id,
                    eof: true,
                    data: Bytes::new(),
                });
                return;
            };
            let _ = self.inner.out.send(Frame::BulkData {
                xfer_id,
                eof,
                data,
            });
            if eof {
                return;
            }
            sent += chunk_len;
        }
    }

    fn answer_errno(&self, call_id: u64, errno: i32) {
        let _ = self.inner.out.send(Frame::Response {
            call_id,
            payload: Bytes::copy_from_slice(&errno.to_le_bytes()),
        });
    }
}
