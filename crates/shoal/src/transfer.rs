//! Bulk staging between the backing store and the mount: a serial mode
//! streamed by rank 0, and a parallel mode that splits the file into 64 KiB
//! chunks balanced across ranks. Staging into the mount ends by clearing
//! the write bits, which laminates the destination.

use crate::client::Client;
use crate::{Error, Result};
use proto_shoal::errno;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

pub const TX_BUFSIZE: u64 = 64 * 1024;

/// The chunk span `[offset, offset+len)` rank `rank` streams in parallel
/// mode: whole-file chunks split evenly, with the first `chunks % nranks`
/// ranks taking one extra.
pub(crate) fn chunk_span(size: u64, rank: u32, nranks: u32) -> (u64, u64) {
    let total_chunks = (size + TX_BUFSIZE - 1) / TX_BUFSIZE;
    let base = total_chunks / nranks as u64;
    let remainder = total_chunks % nranks as u64;

    let rank = rank as u64;
    let mut chunk_start = base * rank;
    let mut n_chunks = base;
    if rank < remainder {
        chunk_start += rank;
        n_chunks += 1;
    } else {
        chunk_start += remainder;
    }

    let offset = chunk_start * TX_BUFSIZE;
    let len = (n_chunks * TX_BUFSIZE).min(size.saturating_sub(offset));
    (offset, len)
}

/// One side of a staging copy: a native file, or a mount fd driven through
/// the client's own surface.
enum XFile<'a> {
    Native(File),
    Mount { client: &'a Client, fd: i64 },
}

impl XFile<'_> {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            XFile::Native(file) => Ok(file.read_at(buf, offset)?),
            XFile::Mount { client, fd } => {
                client.lseek(*fd, offset as i64, libc::SEEK_SET)?;
                client.read(*fd, buf)
            }
        }
    }

    /// Write `buf` at `offset`, resuming across partial writes. A write
    /// that makes no progress surfaces its errno.
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        match self {
            XFile::Native(file) => {
                let mut done = 0;
                while done < buf.len() {
                    match file.write_at(&buf[done..], offset + done as u64) {
                        Ok(0) => return Err(Error::Errno(errno::EIO)),
                        Ok(n) => done += n,
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }
            XFile::Mount { client, fd } => {
                client.lseek(*fd, offset as i64, libc::SEEK_SET)?;
                client.write(*fd, buf)?;
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            XFile::Native(file) => Ok(file.flush()?),
            XFile::Mount { client, fd } => client.fsync(*fd),
        }
    }
}

impl Drop for XFile<'_> {
    fn drop(&mut self) {
        if let XFile::Mount { client, fd } = self {
            if let Err(err) = client.close(*fd) {
                tracing::warn!(%err, "failed to close staged mount fd");
            }
        }
    }
}

impl Client {
    /// Stage `src` into `dst` (or the reverse). Exactly one side must be
    /// inside the mount; a directory destination gains the source's
    /// basename.
    pub fn transfer_file(&self, src: &str, dst: &str, parallel: bool) -> Result<()> {
        let src_in = self.intercepts_path(src);
        let dst_in = self.intercepts_path(dst);
        if usize::from(src_in) + usize::from(dst_in) != 1 {
            return Err(Error::Errno(errno::EINVAL));
        }

        let src_sb = self.xstat(src, src_in)?;
        let size = src_sb.size;

        let mut dst_path = dst.to_string();
        match self.xstat(&dst_path, dst_in) {
            Ok(sb) if sb.mode as u32 & libc::S_IFDIR != 0 => {
                let base = Path::new(src)
                    .file_name()
                    .ok_or(Error::Errno(errno::EINVAL))?;
                dst_path = format!("{}/{}", dst_path.trim_end_matches('/'), base.to_string_lossy());
            }
            Ok(sb) if sb.mode as u32 & libc::S_IFREG == 0 => {
                return Err(Error::Errno(errno::EEXIST));
            }
            _ => {}
        }

        if parallel {
            self.transfer_parallel(src, src_in, &dst_path, dst_in, size)?;
        } else if self.rank == 0 {
            self.transfer_range(src, src_in, &dst_path, dst_in, 0, size)?;
        }

        // Stage-in finishes by clearing the write bits, which the server
        // reads as the lamination trigger.
        if dst_in {
            let mode = (src_sb.mode as u32) & !0o222;
            self.chmod(&dst_path, mode)?;
        }

        tracing::info!(src, dst = %dst_path, size, parallel, "transfer complete");
        Ok(())
    }

    fn transfer_parallel(
        &self,
        src: &str,
        src_in: bool,
        dst: &str,
        dst_in: bool,
        size: u64,
    ) -> Result<()> {
        // Small files are not worth the fan-out.
        if size < TX_BUFSIZE * self.nranks as u64 {
            if self.rank == 0 {
                return self.transfer_range(src, src_in, dst, dst_in, 0, size);
            }
            return Ok(());
        }

        let (offset, len) = chunk_span(size, self.rank, self.nranks);
        tracing::debug!(
            rank = self.rank,
            nranks = self.nranks,
            offset,
            len,
            "parallel transfer share",
        );
        self.transfer_range(src, src_in, dst, dst_in, offset, len)
    }

    fn transfer_range(
        &self,
        src: &str,
        src_in: bool,
        dst: &str,
        dst_in: bool,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let mut from = self.xopen_read(src, src_in)?;
        let mut to = self.xopen_write(dst, dst_in)?;

        let mut buf = vec![0u8; TX_BUFSIZE as usize];
        let mut done = 0u64;
        while done < len {
            let want = (len - done).min(TX_BUFSIZE) as usize;
            let n = from.read_at(&mut buf[..want], offset + done)?;
            if n == 0 {
                break;
            }
            to.write_all_at(&buf[..n], offset + done)?;
            done += n as u64;
        }

        to.flush()
    }

    fn xstat(&self, path: &str, in_mount: bool) -> Result<proto_shoal::StatSnap> {
        if in_mount {
            self.stat(path)
        } else {
            let md = std::fs::metadata(path)?;
            Ok(crate::storage::statsnap_from_metadata(&md))
        }
    }

    fn xopen_read(&self, path: &str, in_mount: bool) -> Result<XFile<'_>> {
        if in_mount {
            let fd = self.open(path, libc::O_RDONLY, 0)?;
            Ok(XFile::Mount { client: self, fd })
        } else {
            Ok(XFile::Native(File::open(path)?))
        }
    }

    fn xopen_write(&self, path: &str, in_mount: bool) -> Result<XFile<'_>> {
        if in_mount {
            let fd = self.open(path, libc::O_CREAT | libc::O_WRONLY, 0o644)?;
            Ok(XFile::Mount { client: self, fd })
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            Ok(XFile::Native(file))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_spans_cover_the_file_exactly_once() {
        // 10 MiB over 8 ranks: 160 chunks, evenly divisible.
        let size = 10 * 1024 * 1024;
        let mut next = 0u64;
        for rank in 0..8 {
            let (offset, len) = chunk_span(size, rank, 8);
            assert_eq!(offset, next);
            next = offset + len;
        }
        assert_eq!(next, size);
    }

    #[test]
    fn remainder_chunks_go_to_the_first_ranks() {
        // 10 chunks over 4 ranks: ranks 0 and 1 take 3, ranks 2 and 3 take 2.
        let size = 10 * TX_BUFSIZE;
        let lens: Vec<u64> = (0..4).map(|r| chunk_span(size, r, 4).1).collect();
        assert_eq!(
            lens,
            vec![3 * TX_BUFSIZE, 3 * TX_BUFSIZE, 2 * TX_BUFSIZE, 2 * TX_BUFSIZE]
        );

        let mut next = 0;
        for rank in 0..4 {
            let (offset, len) = chunk_span(size, rank, 4);
            assert_eq!(offset, next);
            next += len;
        }
        assert_eq!(next, size);
    }

    #[test]
    fn trailing_partial_chunk_lands_on_the_last_owner() {
        let size = 2 * TX_BUFSIZE + 100;
        let spans: Vec<_> = (0..2).map(|r| chunk_span(size, r, 2)).collect();
        assert_eq!(spans[0], (0, 2 * TX_BUFSIZE));
        assert_eq!(spans[1], (2 * TX_BUFSIZE, 100));
    }

    #[test]
    fn ranks_past_the_chunk_count_stream_nothing() {
        let size = TX_BUFSIZE; // one chunk, four ranks
        assert_eq!(chunk_span(size, 0, 4).1, TX_BUFSIZE);
        for rank in 1..4 {
            assert_eq!(chunk_span(size, rank, 4).1, 0);
        }
    }
}
