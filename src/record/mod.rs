//! Binary record codec.
//!
//! A container is a sequence of self-describing records. Every record starts
//! with the same 8-byte header:
//!
//! ```text
//! u32 length   total record length in bytes, header included
//! [u8; 4] tag  "GGPK" | "PDIR" | "FILE" | "FREE"
//! ```
//!
//! followed by a tag-specific body:
//!
//! | Tag    | Body                                                              |
//! |--------|-------------------------------------------------------------------|
//! | `GGPK` | `u32 count`, `count × u64 offset`                                 |
//! | `PDIR` | `u32 name_units`, `u32 count`, `[u8; 32] digest`, name, `count × (u32 key, u64 offset)` |
//! | `FILE` | `u32 name_units`, `[u8; 32] digest`, name, raw content            |
//! | `FREE` | `length − 8` bytes of padding                                     |
//!
//! # Endianness
//! Every scalar is little-endian. Names are UTF-16LE, NUL terminated; see
//! [`name`].
//!
//! `length` must equal the exact encoded size of the record. The compactor
//! relies on that to lay out offsets before writing a single byte, so the
//! decoder rejects any record whose declared length disagrees with its
//! contents.

pub mod name;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read, Seek, Write};

use crate::error::{Error, Result};
use crate::source::ByteSource;

/// SHA-256 digest as stored in directory and file records.
pub type Digest = [u8; 32];

pub const DIGEST_LEN: usize = 32;
/// Byte length of the common record header.
pub const HEADER_LEN: u64 = 8;
/// The signature record is always the first record in a container.
pub const SIGNATURE_OFFSET: u64 = 0;
/// Byte length of one directory entry (`u32 key` + `u64 offset`).
pub const ENTRY_LEN: u64 = 12;

const SIGNATURE_FIXED: u64 = HEADER_LEN + 4;
const DIRECTORY_FIXED: u64 = HEADER_LEN + 4 + 4 + DIGEST_LEN as u64;
const FILE_FIXED: u64 = HEADER_LEN + 4 + DIGEST_LEN as u64;

// ── Tag ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Signature,
    Directory,
    File,
    Free,
}

impl Tag {
    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Tag::Signature => b"GGPK",
            Tag::Directory => b"PDIR",
            Tag::File      => b"FILE",
            Tag::Free      => b"FREE",
        }
    }

    pub fn from_bytes(bytes: &[u8; 4]) -> Option<Self> {
        match bytes {
            b"GGPK" => Some(Tag::Signature),
            b"PDIR" => Some(Tag::Directory),
            b"FILE" => Some(Tag::File),
            b"FREE" => Some(Tag::Free),
            _       => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::Signature => "GGPK",
            Tag::Directory => "PDIR",
            Tag::File      => "FILE",
            Tag::Free      => "FREE",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub tag:    Tag,
}

impl RecordHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<LittleEndian>(self.length)?;
        writer.write_all(self.tag.as_bytes())?;
        Ok(())
    }

    /// Read and validate the header at `offset`.
    ///
    /// Fails with `UnknownRecordTag` for an unrecognised tag and with
    /// `TruncatedRecord` when the stream ends before `length` bytes.
    pub fn read_at<R: Read + Seek>(src: &mut ByteSource<R>, offset: u64) -> Result<Self> {
        let available = src.remaining_from(offset);
        if available < HEADER_LEN {
            return Err(Error::TruncatedRecord { offset, declared: HEADER_LEN, available });
        }
        let mut raw = [0u8; HEADER_LEN as usize];
        src.read_at(offset, &mut raw)?;

        let length = LittleEndian::read_u32(&raw[..4]);
        let tag_bytes = [raw[4], raw[5], raw[6], raw[7]];
        let tag = Tag::from_bytes(&tag_bytes)
            .ok_or(Error::UnknownRecordTag { offset, tag: tag_bytes })?;

        if u64::from(length) < HEADER_LEN {
            return Err(malformed(offset, format!("record length {length} is shorter than its header")));
        }
        if u64::from(length) > available {
            return Err(Error::TruncatedRecord { offset, declared: u64::from(length), available });
        }
        Ok(Self { length, tag })
    }

    /// Length of the body that follows the header.
    pub fn body_len(&self) -> u64 {
        u64::from(self.length).saturating_sub(HEADER_LEN)
    }
}

// ── Signature ────────────────────────────────────────────────────────────────

/// Root record listing the offsets of the top-level nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignatureRecord {
    pub root_offsets: Vec<u64>,
}

impl SignatureRecord {
    pub fn encoded_len(root_count: usize) -> u64 {
        SIGNATURE_FIXED + 8 * root_count as u64
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        let length = checked_len("<signature>", Self::encoded_len(self.root_offsets.len()))?;
        RecordHeader { length, tag: Tag::Signature }.write(&mut writer)?;
        writer.write_u32::<LittleEndian>(self.root_offsets.len() as u32)?;
        for offset in &self.root_offsets {
            writer.write_u64::<LittleEndian>(*offset)?;
        }
        Ok(())
    }

    fn parse(offset: u64, body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(malformed(offset, "signature body too short"));
        }
        let count = LittleEndian::read_u32(&body[..4]);
        let expected = 4 + 8 * u64::from(count);
        if body.len() as u64 != expected {
            return Err(malformed(offset, format!(
                "signature declares {count} roots but its body is {} bytes", body.len()
            )));
        }
        let mut cur = Cursor::new(&body[4..]);
        let mut root_offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            root_offsets.push(cur.read_u64::<LittleEndian>()?);
        }
        Ok(Self { root_offsets })
    }
}

// ── Directory ────────────────────────────────────────────────────────────────

/// One child reference inside a directory record.
///
/// `key` is an opaque 32-bit value stored alongside each offset. It is
/// carried through unchanged and never used for lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryEntry {
    pub key:    u32,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub name:    String,
    pub digest:  Digest,
    /// Stored order is significant: the directory digest hashes children in
    /// exactly this order.
    pub entries: Vec<DirectoryEntry>,
}

impl DirectoryRecord {
    pub fn encoded_len(name: &str, child_count: usize) -> u64 {
        DIRECTORY_FIXED + name::byte_len(name) + ENTRY_LEN * child_count as u64
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        let length = checked_len(&self.name, Self::encoded_len(&self.name, self.entries.len()))?;
        RecordHeader { length, tag: Tag::Directory }.write(&mut writer)?;
        writer.write_u32::<LittleEndian>(name::unit_count(&self.name) as u32)?;
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        writer.write_all(&self.digest)?;
        name::write_name(&mut writer, &self.name)?;
        for entry in &self.entries {
            writer.write_u32::<LittleEndian>(entry.key)?;
            writer.write_u64::<LittleEndian>(entry.offset)?;
        }
        Ok(())
    }

    /// Decode the body of the directory record whose header was read at
    /// `offset`.
    pub fn read_body<R: Read + Seek>(
        src:    &mut ByteSource<R>,
        offset: u64,
        header: &RecordHeader,
    ) -> Result<Self> {
        let body = src.read_span(offset + HEADER_LEN, header.body_len())?;
        Self::parse(offset, &body)
    }

    fn parse(offset: u64, body: &[u8]) -> Result<Self> {
        let fixed = (DIRECTORY_FIXED - HEADER_LEN) as usize;
        if body.len() < fixed {
            return Err(malformed(offset, "directory body too short"));
        }
        let name_units  = LittleEndian::read_u32(&body[0..4]);
        let child_count = LittleEndian::read_u32(&body[4..8]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&body[8..fixed]);

        let expected = fixed as u64 + 2 * u64::from(name_units) + ENTRY_LEN * u64::from(child_count);
        if body.len() as u64 != expected {
            return Err(malformed(offset, format!(
                "directory declares {name_units} name units and {child_count} entries \
                 but its body is {} bytes", body.len()
            )));
        }

        let mut cur = Cursor::new(&body[fixed..]);
        let name = name::read_name(&mut cur, name_units)?
            .map_err(|reason| malformed(offset, reason))?;

        let mut entries = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            let key    = cur.read_u32::<LittleEndian>()?;
            let offset = cur.read_u64::<LittleEndian>()?;
            entries.push(DirectoryEntry { key, offset });
        }
        Ok(Self { name, digest, entries })
    }
}

// ── File ─────────────────────────────────────────────────────────────────────

/// A byte range inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub offset: u64,
    pub len:    u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name:    String,
    /// SHA-256 of `content` exactly as stored (before any decompression).
    pub digest:  Digest,
    pub content: Vec<u8>,
}

/// File record fields without the content, which stays on disk as a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name:   String,
    pub digest: Digest,
    pub data:   Span,
}

impl FileRecord {
    pub fn encoded_len(name: &str, content_len: u64) -> u64 {
        FILE_FIXED + name::byte_len(name) + content_len
    }

    /// Write header, fixed fields and name; `content_len` bytes of content
    /// must follow.
    pub fn write_prefix<W: Write>(
        mut writer:  W,
        name:        &str,
        digest:      &Digest,
        content_len: u64,
    ) -> Result<()> {
        let length = checked_len(name, Self::encoded_len(name, content_len))?;
        RecordHeader { length, tag: Tag::File }.write(&mut writer)?;
        writer.write_u32::<LittleEndian>(name::unit_count(name) as u32)?;
        writer.write_all(digest)?;
        name::write_name(&mut writer, name)?;
        Ok(())
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        Self::write_prefix(&mut writer, &self.name, &self.digest, self.content.len() as u64)?;
        writer.write_all(&self.content)?;
        Ok(())
    }

    /// Decode everything but the content.
    pub fn read_meta<R: Read + Seek>(
        src:    &mut ByteSource<R>,
        offset: u64,
        header: &RecordHeader,
    ) -> Result<FileMeta> {
        let fixed = FILE_FIXED - HEADER_LEN;
        if header.body_len() < fixed {
            return Err(malformed(offset, "file body too short"));
        }
        let mut raw = [0u8; (FILE_FIXED - HEADER_LEN) as usize];
        src.read_at(offset + HEADER_LEN, &mut raw)?;
        let name_units = LittleEndian::read_u32(&raw[..4]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&raw[4..]);

        let name_bytes = 2 * u64::from(name_units);
        if fixed + name_bytes > header.body_len() {
            return Err(malformed(offset, format!("name of {name_units} units overruns the record")));
        }
        let name = name::read_name(src.reader_at(offset + FILE_FIXED, name_bytes)?, name_units)?
            .map_err(|reason| malformed(offset, reason))?;

        let data_offset = offset + FILE_FIXED + name_bytes;
        let data = Span {
            offset: data_offset,
            len:    offset + u64::from(header.length) - data_offset,
        };
        Ok(FileMeta { name, digest, data })
    }
}

// ── Free ─────────────────────────────────────────────────────────────────────

/// Unused space. Only its size is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeRecord {
    /// Bytes following the header.
    pub padding: u32,
}

impl FreeRecord {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        let length = checked_len("<free>", HEADER_LEN + u64::from(self.padding))?;
        RecordHeader { length, tag: Tag::Free }.write(&mut writer)?;
        std::io::copy(&mut std::io::repeat(0).take(u64::from(self.padding)), &mut writer)?;
        Ok(())
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Signature(SignatureRecord),
    Directory(DirectoryRecord),
    File(FileRecord),
    Free(FreeRecord),
}

impl Record {
    pub fn tag(&self) -> Tag {
        match self {
            Record::Signature(_) => Tag::Signature,
            Record::Directory(_) => Tag::Directory,
            Record::File(_)      => Tag::File,
            Record::Free(_)      => Tag::Free,
        }
    }

    /// Exact number of bytes [`Record::encode`] produces.
    pub fn encoded_len(&self) -> u64 {
        match self {
            Record::Signature(s) => SignatureRecord::encoded_len(s.root_offsets.len()),
            Record::Directory(d) => DirectoryRecord::encoded_len(&d.name, d.entries.len()),
            Record::File(f)      => FileRecord::encoded_len(&f.name, f.content.len() as u64),
            Record::Free(f)      => HEADER_LEN + u64::from(f.padding),
        }
    }

    /// Decode the record at `offset`, returning it with its total length.
    ///
    /// File content is read in full; the tree builder uses
    /// [`FileRecord::read_meta`] instead to keep content on disk.
    pub fn decode<R: Read + Seek>(src: &mut ByteSource<R>, offset: u64) -> Result<(Self, u64)> {
        let header = RecordHeader::read_at(src, offset)?;
        let record = match header.tag {
            Tag::File => {
                let meta = FileRecord::read_meta(src, offset, &header)?;
                let content = src.read_span(meta.data.offset, meta.data.len)?;
                Record::File(FileRecord { name: meta.name, digest: meta.digest, content })
            }
            Tag::Free => Record::Free(FreeRecord { padding: header.body_len() as u32 }),
            Tag::Signature => {
                let body = src.read_span(offset + HEADER_LEN, header.body_len())?;
                Record::Signature(SignatureRecord::parse(offset, &body)?)
            }
            Tag::Directory => Record::Directory(DirectoryRecord::read_body(src, offset, &header)?),
        };
        Ok((record, u64::from(header.length)))
    }

    pub fn write<W: Write>(&self, writer: W) -> Result<()> {
        match self {
            Record::Signature(s) => s.write(writer),
            Record::Directory(d) => d.write(writer),
            Record::File(f)      => f.write(writer),
            Record::Free(f)      => f.write(writer),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        self.write(&mut out)?;
        Ok(out)
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn checked_len(name: &str, len: u64) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::RecordTooLarge { name: name.to_owned(), len })
}

fn malformed(offset: u64, reason: impl Into<String>) -> Error {
    Error::MalformedRecord { offset, reason: reason.into() }
}
