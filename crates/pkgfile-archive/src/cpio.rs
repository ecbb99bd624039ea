//! Minimal cpio-newc codec for the cache format.
//!
//! Cache archives only ever contain regular-file entries written and read
//! sequentially, so this stays far smaller than a general cpio
//! implementation: fixed 110-byte ASCII headers, 4-byte alignment after
//! name and data, `TRAILER!!!` terminator.

use std::io::{self, BufRead, Read, Write};

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

// Entry names are package directory names; anything bigger is corrupt.
const MAX_NAME_SIZE: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CpioError {
    #[error("not a cpio archive")]
    BadMagic,
    #[error("malformed cpio header")]
    BadHeader,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Metadata carried over from the source archive entry. The inode is
/// deliberately absent: cache entries always get inode 0 so that source
/// filesystem details never leak into the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
}

/// Header of the entry most recently returned by [`CpioReader::next_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    pub name: String,
    pub ino: u64,
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
}

fn pad4(len: usize) -> usize {
    len.wrapping_neg() % 4
}

/// Sequential cpio-newc writer.
pub struct CpioWriter<W: Write> {
    inner: W,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_entry(&mut self, name: &str, meta: &EntryMeta, data: &[u8]) -> io::Result<()> {
        self.write_header(name, meta, 1, data.len())?;
        self.inner.write_all(data)?;
        self.write_padding(pad4(data.len()))
    }

    /// Writes the trailer and hands back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.write_header(TRAILER, &EntryMeta::default(), 1, 0)?;
        Ok(self.inner)
    }

    fn write_header(
        &mut self,
        name: &str,
        meta: &EntryMeta,
        nlink: u32,
        filesize: usize,
    ) -> io::Result<()> {
        let namesize = name.len() + 1;
        self.inner.write_all(MAGIC)?;
        write!(
            self.inner,
            "{ino:08X}{mode:08X}{uid:08X}{gid:08X}{nlink:08X}{mtime:08X}{filesize:08X}\
             {devmajor:08X}{devminor:08X}{rdevmajor:08X}{rdevminor:08X}{namesize:08X}{check:08X}",
            ino = 0,
            mode = meta.mode,
            uid = meta.uid,
            gid = meta.gid,
            nlink = nlink,
            mtime = meta.mtime & 0xFFFF_FFFF,
            filesize = filesize,
            devmajor = 0,
            devminor = 0,
            rdevmajor = 0,
            rdevminor = 0,
            namesize = namesize,
            check = 0,
        )?;
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(b"\0")?;
        self.write_padding(pad4(HEADER_LEN + namesize))
    }

    fn write_padding(&mut self, len: usize) -> io::Result<()> {
        self.inner.write_all(&b"\0\0\0"[..len.min(3)])
    }
}

/// Sequential cpio-newc reader.
///
/// After `next_entry` returns a header, the reader itself acts as the entry
/// body: its `Read`/`BufRead` impls are clamped to the body size. Unread
/// body bytes and alignment padding are skipped by the next `next_entry`
/// call, so partially consumed entries are fine.
pub struct CpioReader<R> {
    inner: R,
    remaining: u64,
    trailing_pad: u64,
}

impl<R: BufRead> CpioReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            trailing_pad: 0,
        }
    }

    /// Advances to the next entry. Returns `None` at the trailer.
    pub fn next_entry(&mut self) -> Result<Option<CpioEntry>, CpioError> {
        self.skip_current_body()?;

        let mut header = [0_u8; HEADER_LEN];
        self.inner.read_exact(&mut header)?;
        if &header[..6] != MAGIC {
            return Err(CpioError::BadMagic);
        }

        let field = |idx: usize| hex_field(&header[6 + idx * 8..6 + (idx + 1) * 8]);
        let ino = field(0)?;
        let mode = field(1)?;
        let mtime = field(5)?;
        let filesize = field(6)?;
        let namesize = field(11)?;
        if namesize == 0 || namesize > MAX_NAME_SIZE {
            return Err(CpioError::BadHeader);
        }

        let mut name = vec![0_u8; usize::try_from(namesize).map_err(|_| CpioError::BadHeader)?];
        self.inner.read_exact(&mut name)?;
        self.skip(pad4(HEADER_LEN + name.len()) as u64)?;
        while name.last() == Some(&0) {
            name.pop();
        }
        let name = String::from_utf8(name).map_err(|_| CpioError::BadHeader)?;

        if name == TRAILER {
            return Ok(None);
        }

        self.remaining = filesize;
        self.trailing_pad = pad4(usize::try_from(filesize).map_err(|_| CpioError::BadHeader)?) as u64;

        Ok(Some(CpioEntry {
            name,
            ino,
            mode: u32::try_from(mode).map_err(|_| CpioError::BadHeader)?,
            mtime,
            size: filesize,
        }))
    }

    fn skip_current_body(&mut self) -> io::Result<()> {
        let leftover = self.remaining + self.trailing_pad;
        self.remaining = 0;
        self.trailing_pad = 0;
        self.skip(leftover)
    }

    fn skip(&mut self, mut n: u64) -> io::Result<()> {
        while n > 0 {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "archive truncated",
                ));
            }
            let take = usize::try_from(n).map_or(buf.len(), |want| buf.len().min(want));
            self.inner.consume(take);
            n -= take as u64;
        }
        Ok(())
    }
}

impl<R: BufRead> Read for CpioReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = usize::try_from(self.remaining).map_or(buf.len(), |r| buf.len().min(r));
        let got = self.inner.read(&mut buf[..want])?;
        self.remaining -= got as u64;
        Ok(got)
    }
}

impl<R: BufRead> BufRead for CpioReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.remaining == 0 {
            return Ok(&[]);
        }
        let remaining = self.remaining;
        let buf = self.inner.fill_buf()?;
        let n = usize::try_from(remaining).map_or(buf.len(), |r| buf.len().min(r));
        Ok(&buf[..n])
    }

    fn consume(&mut self, amt: usize) {
        self.remaining = self.remaining.saturating_sub(amt as u64);
        self.inner.consume(amt);
    }
}

fn hex_field(bytes: &[u8]) -> Result<u64, CpioError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CpioError::BadHeader)?;
    u64::from_str_radix(text, 16).map_err(|_| CpioError::BadHeader)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::BufReader;

    use super::*;

    fn meta(mode: u32, mtime: u64) -> EntryMeta {
        EntryMeta {
            mode,
            uid: 0,
            gid: 0,
            mtime,
        }
    }

    #[test]
    fn header_bytes_are_exact() {
        let mut writer = CpioWriter::new(Vec::new());
        writer
            .write_entry("x", &meta(0o100_644, 0x1234), b"ab\n")
            .unwrap();
        let bytes = writer.finish().unwrap();

        let expected = b"070701\
            00000000\
            000081A4\
            00000000\
            00000000\
            00000001\
            00001234\
            00000003\
            00000000\
            00000000\
            00000000\
            00000000\
            00000002\
            00000000";
        assert_eq!(&bytes[..HEADER_LEN], &expected[..]);
        assert_eq!(&bytes[HEADER_LEN..HEADER_LEN + 2], b"x\0");
        // 110 + 2 is already aligned; data follows immediately, padded to 4.
        assert_eq!(&bytes[HEADER_LEN + 2..HEADER_LEN + 6], b"ab\n\0");
    }

    #[test]
    fn written_archives_read_back() {
        let mut writer = CpioWriter::new(Vec::new());
        writer
            .write_entry("bash-5.2.037-1", &meta(0o100_644, 1_700_000_000), b"/usr/bin/bash\n")
            .unwrap();
        writer
            .write_entry("gzip-1.13-3", &meta(0o100_644, 1_700_000_001), b"/usr/bin/gzip\n")
            .unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = CpioReader::new(BufReader::new(&bytes[..]));

        let first = reader.next_entry().unwrap().unwrap();
        assert_eq!(first.name, "bash-5.2.037-1");
        assert_eq!(first.size, 14);
        assert_eq!(first.mtime, 1_700_000_000);
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert_eq!(body, "/usr/bin/bash\n");

        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.name, "gzip-1.13-3");

        // Trailer, then stays exhausted.
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn inode_is_always_zero() {
        let mut writer = CpioWriter::new(Vec::new());
        writer
            .write_entry("pkg-1.0-1", &meta(0o100_644, 42), b"/etc/pkg.conf\n")
            .unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = CpioReader::new(BufReader::new(&bytes[..]));
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.ino, 0);
    }

    #[test]
    fn unread_bodies_are_skipped() {
        let mut writer = CpioWriter::new(Vec::new());
        writer
            .write_entry("a-1-1", &meta(0o100_644, 0), b"/one\n/two\n/three\n")
            .unwrap();
        writer
            .write_entry("b-2-2", &meta(0o100_644, 0), b"/four\n")
            .unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = CpioReader::new(BufReader::new(&bytes[..]));
        assert_eq!(reader.next_entry().unwrap().unwrap().name, "a-1-1");
        // Read nothing from the first body.
        assert_eq!(reader.next_entry().unwrap().unwrap().name, "b-2-2");
    }

    #[test]
    fn garbage_is_rejected() {
        let junk = vec![b'x'; 2 * HEADER_LEN];
        let mut reader = CpioReader::new(BufReader::new(&junk[..]));
        assert!(matches!(reader.next_entry(), Err(CpioError::BadMagic)));
    }

    #[test]
    fn truncated_archive_is_an_io_error() {
        let mut writer = CpioWriter::new(Vec::new());
        writer
            .write_entry("a-1-1", &meta(0o100_644, 0), b"/one\n")
            .unwrap();
        let bytes = writer.finish().unwrap();

        // Chop into the trailer header.
        let mut reader = CpioReader::new(BufReader::new(&bytes[..bytes.len() - 20]));
        assert_eq!(reader.next_entry().unwrap().unwrap().name, "a-1-1");
        assert!(reader.next_entry().is_err());
    }
}
