use bytes::{Buf, BufMut, Bytes, BytesMut};
use proto_shoal::wire;

/// Everything that travels inside one length-delimited frame.
///
/// `Response` payloads are the encoded response struct of the operation; as
/// a special case a bare 4-byte payload is an errno answered by the
/// dispatcher itself (the handler could not run), which callers surface as
/// [`crate::Error::Remote`].
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        call_id: u64,
        op: String,
        payload: Bytes,
    },
    Response {
        call_id: u64,
        payload: Bytes,
    },
    /// Ask the peer to stream `len` bytes of its region starting at `offset`.
    BulkPull {
        xfer_id: u64,
        region: u64,
        offset: u64,
        len: u64,
    },
    /// One chunk of a pull in progress; `eof` marks the last chunk.
    BulkData {
        xfer_id: u64,
        eof: bool,
        data: Bytes,
    },
    /// One chunk written into the peer's writable region at `offset`.
    BulkPush {
        xfer_id: u64,
        region: u64,
        offset: u64,
        eof: bool,
        data: Bytes,
    },
    /// Final status of a push.
    BulkAck {
        xfer_id: u64,
        status: i32,
    },
}

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_BULK_PULL: u8 = 3;
const KIND_BULK_DATA: u8 = 4;
const KIND_BULK_PUSH: u8 = 5;
const KIND_BULK_ACK: u8 = 6;

impl Frame {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Request {
                call_id,
                op,
                payload,
            } => {
                buf.put_u8(KIND_REQUEST);
                buf.put_u64_le(*call_id);
                wire::put_str(buf, op);
                buf.put_slice(payload);
            }
            Frame::Response { call_id, payload } => {
                buf.put_u8(KIND_RESPONSE);
                buf.put_u64_le(*call_id);
                buf.put_slice(payload);
            }
            Frame::BulkPull {
                xfer_id,
                region,
                offset,
                len,
            } => {
                buf.put_u8(KIND_BULK_PULL);
                buf.put_u64_le(*xfer_id);
                buf.put_u64_le(*region);
                buf.put_u64_le(*offset);
                buf.put_u64_le(*len);
            }
            Frame::BulkData { xfer_id, eof, data } => {
                buf.put_u8(KIND_BULK_DATA);
                buf.put_u64_le(*xfer_id);
                buf.put_u8(*eof as u8);
                buf.put_slice(data);
            }
            Frame::BulkPush {
                xfer_id,
                region,
                offset,
                eof,
                data,
            } => {
                buf.put_u8(KIND_BULK_PUSH);
                buf.put_u64_le(*xfer_id);
                buf.put_u64_le(*region);
                buf.put_u64_le(*offset);
                buf.put_u8(*eof as u8);
                buf.put_slice(data);
            }
            Frame::BulkAck { xfer_id, status } => {
                buf.put_u8(KIND_BULK_ACK);
                buf.put_u64_le(*xfer_id);
                buf.put_i32_le(*status);
            }
        }
    }

    pub fn decode(mut buf: Bytes) -> wire::Result<Frame> {
        let kind = wire::get_u8(&mut buf)?;
        match kind {
            KIND_REQUEST => {
                let call_id = wire::get_u64(&mut buf)?;
                let op = wire::get_str(&mut buf)?;
                Ok(Frame::Request {
                    call_id,
                    op,
                    payload: buf,
                })
            }
            KIND_RESPONSE => {
                let call_id = wire::get_u64(&mut buf)?;
                Ok(Frame::Response {
                    call_id,
                    payload: buf,
                })
            }
            KIND_BULK_PULL => Ok(Frame::BulkPull {
                xfer_id: wire::get_u64(&mut buf)?,
                region: wire::get_u64(&mut buf)?,
                offset: wire::get_u64(&mut buf)?,
                len: wire::get_u64(&mut buf)?,
            }),
            KIND_BULK_DATA => {
                let xfer_id = wire::get_u64(&mut buf)?;
                let eof = wire::get_u8(&mut buf)? != 0;
                Ok(Frame::BulkData {
                    xfer_id,
                    eof,
                    data: buf,
                })
            }
            KIND_BULK_PUSH => {
                let xfer_id = wire::get_u64(&mut buf)?;
                let region = wire::get_u64(&mut buf)?;
                let offset = wire::get_u64(&mut buf)?;
                let eof = wire::get_u8(&mut buf)? != 0;
                Ok(Frame::BulkPush {
                    xfer_id,
                    region,
                    offset,
                    eof,
                    data: buf,
                })
            }
            KIND_BULK_ACK => Ok(Frame::BulkAck {
                xfer_id: wire::get_u64(&mut buf)?,
                status: wire::get_i32(&mut buf)?,
            }),
            other => Err(wire::Error::BadValue {
                field: "frame kind",
                value: other as u64,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let frames = vec![
            Frame::Request {
                call_id: 1,
                op: "mds_create".to_string(),
                payload: Bytes::from_static(b"abc"),
            },
            Frame::Response {
                call_id: 1,
                payload: Bytes::from_static(b"\0\0\0\0"),
            },
            Frame::BulkPull {
                xfer_id: 9,
                region: 4,
                offset: 0,
                len: 4096,
            },
            Frame::BulkData {
                xfer_id: 9,
                eof: true,
                data: Bytes::from_static(b"xyz"),
            },
            Frame::BulkPush {
                xfer_id: 10,
                region: 5,
                offset: 512,
                eof: false,
                data: Bytes::from_static(b"chunk"),
            },
            Frame::BulkAck {
                xfer_id: 10,
                status: 0,
            },
        ];
        for frame in frames {
            let mut buf = BytesMut::new();
            frame.encode(&mut buf);
            assert_eq!(Frame::decode(buf.freeze()).unwrap(), frame);
        }
    }
}
