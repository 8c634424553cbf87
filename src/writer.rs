//! Append-only builder for fresh containers.
//!
//! [`ContainerWriter`] reserves the signature slot at offset 0, appends
//! records bottom-up (children before the directory that lists them), and
//! patches the signature in place on [`ContainerWriter::finalize`]. Digests
//! are computed as records are added, so a finished container always
//! verifies.
//!
//! [`pack_directory`] builds a container from a directory on disk.

use std::fs;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::codec::{get_codec, CodecId};
use crate::compact::{publish, stage_next_to};
use crate::error::{Error, Result};
use crate::record::{
    Digest, DirectoryEntry, DirectoryRecord, FileRecord, FreeRecord, SignatureRecord, Tag,
    HEADER_LEN,
};
use crate::resolve::{is_texture, COMPRESSED_MAGIC};
use crate::verify::{directory_digest, file_digest};

/// Handle to a record already written, used to list it as a child or root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef {
    pub offset: u64,
    pub key:    u32,
    pub tag:    Tag,
    /// Zero for free-space records.
    pub digest: Digest,
}

pub struct ContainerWriter<W: Write + Seek> {
    writer:     W,
    position:   u64,
    root_count: usize,
    next_key:   u32,
}

impl<W: Write + Seek> ContainerWriter<W> {
    /// Writer for a container with a single top-level node.
    pub fn new(writer: W) -> Result<Self> {
        Self::with_root_count(writer, 1)
    }

    pub fn with_root_count(mut writer: W, root_count: usize) -> Result<Self> {
        writer.seek(SeekFrom::Start(0))?;
        // Placeholder of the right size; overwritten on finalize.
        SignatureRecord { root_offsets: vec![0; root_count] }.write(&mut writer)?;
        Ok(Self {
            writer,
            position: SignatureRecord::encoded_len(root_count),
            root_count,
            next_key: 1,
        })
    }

    /// Offset the next record will be written at.
    pub fn position(&self) -> u64 { self.position }

    fn entry(&mut self, offset: u64, tag: Tag, digest: Digest) -> EntryRef {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1);
        EntryRef { offset, key, tag, digest }
    }

    pub fn add_file(&mut self, name: &str, content: &[u8]) -> Result<EntryRef> {
        let offset = self.position;
        let digest = file_digest(content);
        FileRecord::write_prefix(&mut self.writer, name, &digest, content.len() as u64)?;
        self.writer.write_all(content)?;
        self.position += FileRecord::encoded_len(name, content.len() as u64);
        debug!(offset, name, size = content.len(), "file record");
        Ok(self.entry(offset, Tag::File, digest))
    }

    /// Write a directory listing `children` in the given order. Free-space
    /// children are listed but do not contribute to the digest.
    pub fn add_directory(&mut self, name: &str, children: &[EntryRef]) -> Result<EntryRef> {
        let offset = self.position;
        let digest = directory_digest(
            children.iter().filter(|c| c.tag != Tag::Free).map(|c| &c.digest),
        );
        let record = DirectoryRecord {
            name: name.to_owned(),
            digest,
            entries: children.iter()
                .map(|c| DirectoryEntry { key: c.key, offset: c.offset })
                .collect(),
        };
        record.write(&mut self.writer)?;
        self.position += DirectoryRecord::encoded_len(name, children.len());
        debug!(offset, name, children = children.len(), "directory record");
        Ok(self.entry(offset, Tag::Directory, digest))
    }

    /// Write `padding` bytes of free space.
    pub fn add_free(&mut self, padding: u32) -> Result<EntryRef> {
        let offset = self.position;
        FreeRecord { padding }.write(&mut self.writer)?;
        self.position += HEADER_LEN + u64::from(padding);
        Ok(self.entry(offset, Tag::Free, [0; 32]))
    }

    /// Patch the signature with `roots` and return the underlying writer,
    /// positioned at the end of the container.
    pub fn finalize(mut self, roots: &[EntryRef]) -> Result<W> {
        if roots.len() != self.root_count {
            return Err(Error::MalformedRecord {
                offset: 0,
                reason: format!(
                    "signature reserved for {} roots, finalize got {}",
                    self.root_count,
                    roots.len()
                ),
            });
        }
        self.writer.seek(SeekFrom::Start(0))?;
        SignatureRecord { root_offsets: roots.iter().map(|r| r.offset).collect() }
            .write(&mut self.writer)?;
        self.writer.seek(SeekFrom::Start(self.position))?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

// ── pack_directory ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PackOptions {
    /// When set, non-texture files are stored as `CMP` blocks.
    pub codec: Option<CodecId>,
    pub level: i32,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self { codec: None, level: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackStats {
    pub directories:   usize,
    pub files:         usize,
    pub bytes_written: u64,
}

/// Build a container at `dest` from the contents of `src_dir`.
///
/// The directory itself becomes the single unnamed root; entries are added
/// in byte order of their names. Output is staged next to `dest` and
/// renamed into place once complete.
pub fn pack_directory<P: AsRef<Path>, Q: AsRef<Path>>(
    src_dir: P,
    dest:    Q,
    opts:    &PackOptions,
) -> Result<PackStats> {
    let (src_dir, dest) = (src_dir.as_ref(), dest.as_ref());
    let mut staged = stage_next_to(dest)?;
    let mut stats = PackStats::default();
    // The staged file may live inside `src_dir`.
    let skip = fs::canonicalize(staged.path())?;

    let mut writer = ContainerWriter::new(BufWriter::new(staged.as_file_mut()))?;
    let root = pack_dir(&mut writer, src_dir, "", &skip, opts, &mut stats)?;
    stats.bytes_written = writer.position();
    writer.finalize(&[root])?.into_inner().map_err(io::Error::from)?;

    publish(staged, dest)?;
    info!(
        dest = %dest.display(),
        directories = stats.directories,
        files = stats.files,
        bytes = stats.bytes_written,
        "packed"
    );
    Ok(stats)
}

fn pack_dir<W: Write + Seek>(
    writer: &mut ContainerWriter<W>,
    dir:    &Path,
    name:   &str,
    skip:   &Path,
    opts:   &PackOptions,
    stats:  &mut PackStats,
) -> Result<EntryRef> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut children = Vec::with_capacity(entries.len());
    for entry in entries {
        let child_name = entry.file_name().into_string().map_err(|raw| {
            io::Error::new(io::ErrorKind::InvalidData, format!("non UTF-8 file name {raw:?}"))
        })?;
        let kind = entry.file_type()?;
        if kind.is_dir() {
            children.push(pack_dir(writer, &entry.path(), &child_name, skip, opts, stats)?);
        } else if kind.is_file() {
            if fs::canonicalize(entry.path())? == skip {
                continue;
            }
            let data = fs::read(entry.path())?;
            let stored = match opts.codec {
                Some(codec) if !is_texture(&child_name) => wrap_compressed(&child_name, &data, codec, opts.level)?,
                _ => data,
            };
            children.push(writer.add_file(&child_name, &stored)?);
            stats.files += 1;
        } else {
            warn!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    stats.directories += 1;
    writer.add_directory(name, &children)
}

/// `"CMP"` + `u32` declared length + compressed block.
fn wrap_compressed(name: &str, data: &[u8], codec: CodecId, level: i32) -> Result<Vec<u8>> {
    let declared = u32::try_from(data.len())
        .map_err(|_| Error::RecordTooLarge { name: name.to_owned(), len: data.len() as u64 })?;
    let block = get_codec(codec).compress(data, level)?;
    let mut out = Vec::with_capacity(7 + block.len());
    out.extend_from_slice(COMPRESSED_MAGIC);
    out.extend_from_slice(&declared.to_le_bytes());
    out.extend_from_slice(&block);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ByteSource;
    use crate::tree::Tree;
    use crate::verify::{verify, VerifyOptions};
    use std::io::Cursor;

    #[test]
    fn finished_container_parses_and_verifies() {
        let mut w = ContainerWriter::new(Cursor::new(Vec::new())).unwrap();
        let a = w.add_file("a.txt", b"hi").unwrap();
        let gap = w.add_free(16).unwrap();
        let b = w.add_file("b.txt", b"bye").unwrap();
        let root = w.add_directory("ROOT", &[a, gap, b]).unwrap();
        let bytes = w.finalize(&[root]).unwrap().into_inner();

        let mut src = ByteSource::new(Cursor::new(bytes)).unwrap();
        let tree = Tree::build(&mut src).unwrap();
        let paths: Vec<&str> = tree.walk().map(|n| n.path()).collect();
        assert_eq!(paths, ["/ROOT", "/a.txt", "/b.txt"]);
        assert!(verify(&tree, &mut src, VerifyOptions::default()).unwrap().is_ok());
    }

    #[test]
    fn finalize_rejects_wrong_root_count() {
        let mut w = ContainerWriter::with_root_count(Cursor::new(Vec::new()), 2).unwrap();
        let a = w.add_file("a", b"").unwrap();
        assert!(matches!(w.finalize(&[a]), Err(Error::MalformedRecord { offset: 0, .. })));
    }

    #[test]
    fn keys_are_distinct() {
        let mut w = ContainerWriter::new(Cursor::new(Vec::new())).unwrap();
        let a = w.add_file("a", b"1").unwrap();
        let b = w.add_file("b", b"2").unwrap();
        assert_ne!(a.key, b.key);
        assert_eq!(b.offset, a.offset + FileRecord::encoded_len("a", 1));
    }
}
