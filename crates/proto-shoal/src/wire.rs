//! Buffer helpers for the hand-framed binary encoding: fixed-width
//! little-endian integers and length-prefixed strings bounded by
//! [`crate::MAX_FILENAME`].

use bytes::{Buf, BufMut};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame truncated: wanted {wanted} more bytes, {left} left")]
    Truncated { wanted: usize, left: usize },
    #[error("string of {0} bytes exceeds the filename bound")]
    StringTooLong(usize),
    #[error("string is not valid UTF-8")]
    BadUtf8(#[from] std::str::Utf8Error),
    #[error("invalid {field} value {value}")]
    BadValue { field: &'static str, value: u64 },
}

pub type Result<Ok> = std::result::Result<Ok, Error>;

/// Everything that travels inside a request or response frame.
pub trait Wire: Sized {
    fn encode<B: BufMut>(&self, buf: &mut B);
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;

    fn to_bytes(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn from_bytes(mut bytes: bytes::Bytes) -> Result<Self> {
        Self::decode(&mut bytes)
    }
}

pub fn need<B: Buf>(buf: &B, wanted: usize) -> Result<()> {
    if buf.remaining() < wanted {
        return Err(Error::Truncated {
            wanted,
            left: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8<B: Buf>(buf: &mut B) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16<B: Buf>(buf: &mut B) -> Result<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn get_u32<B: Buf>(buf: &mut B) -> Result<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_i32<B: Buf>(buf: &mut B) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn get_u64<B: Buf>(buf: &mut B) -> Result<u64> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

/// Strings are a u16 byte length followed by UTF-8 bytes, bounded by the
/// filename limit.
pub fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    debug_assert!(s.len() < crate::MAX_FILENAME);
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub fn get_str<B: Buf>(buf: &mut B) -> Result<String> {
    let len = get_u16(buf)? as usize;
    if len >= crate::MAX_FILENAME {
        return Err(Error::StringTooLong(len));
    }
    need(buf, len)?;
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    Ok(std::str::from_utf8(&raw)?.to_owned())
}
