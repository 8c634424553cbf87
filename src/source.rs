//! Random-access byte source over a container.
//!
//! Wraps any `Read + Seek` and caches its total length so record decoding
//! can tell a truncated record from a well-formed one without probing the
//! end of the stream on every read.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take};
use std::path::Path;

pub struct ByteSource<R: Read + Seek> {
    inner: R,
    len:   u64,
}

impl ByteSource<BufReader<File>> {
    /// Open a container file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> ByteSource<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len })
    }

    /// Total length of the underlying stream in bytes.
    pub fn len(&self) -> u64 { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Bytes available from `offset` to the end of the stream.
    pub fn remaining_from(&self, offset: u64) -> u64 {
        self.len.saturating_sub(offset)
    }

    /// Position the stream at `offset` and hand out the raw reader.
    pub fn seek_to(&mut self, offset: u64) -> io::Result<&mut R> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(&mut self.inner)
    }

    /// Fill `buf` from `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek_to(offset)?.read_exact(buf)
    }

    /// Read `len` bytes starting at `offset` into a fresh buffer.
    pub fn read_span(&mut self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let len = usize::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "span does not fit in memory")
        })?;
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// A reader limited to `len` bytes starting at `offset`.
    pub fn reader_at(&mut self, offset: u64, len: u64) -> io::Result<Take<&mut R>> {
        Ok(self.seek_to(offset)?.take(len))
    }
}
