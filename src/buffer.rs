//! Sequential write buffering for container output.
//!
//! [`WriteBuffer`] accumulates small writes (record headers, names, entry
//! tables) and hands them to the underlying writer in large chunks. It also
//! counts every byte accepted, which lets writers check that each record
//! lands exactly at the offset the layout assigned to it.

use std::io::{self, Write};

/// 1 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

pub struct WriteBuffer<W: Write> {
    inner:    W,
    buf:      Vec<u8>,
    capacity: usize,
    pub bytes_written: u64,
}

impl<W: Write> WriteBuffer<W> {
    pub fn new(inner: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
            bytes_written: 0,
        }
    }

    fn flush_if_full(&mut self) -> io::Result<()> {
        if self.buf.len() >= self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for WriteBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Large writes skip the buffer.
        if buf.len() >= self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
            self.inner.write_all(buf)?;
        } else {
            self.buf.extend_from_slice(buf);
            self.flush_if_full()?;
        }
        self.bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_preserves_order() {
        let mut wb = WriteBuffer::new(Vec::new(), 4);
        wb.write_all(b"ab").unwrap();
        wb.write_all(b"cdefgh").unwrap();
        wb.write_all(b"i").unwrap();
        assert_eq!(wb.bytes_written, 9);
        assert_eq!(wb.into_inner().unwrap(), b"abcdefghi");
    }
}
