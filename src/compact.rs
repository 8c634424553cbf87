//! Defragmenting rewrite of a parsed tree into a fresh container.
//!
//! A directory record stores the absolute offset of every child, and no
//! offset is known until every record before it has been sized. The rewrite
//! therefore runs as three separate phases:
//!
//! 1. **Size**: compute the encoded length of every directory and file
//!    record (pre-order) without producing any bytes.
//! 2. **Assign**: lay the output out as
//!    `[signature][directories, pre-order][files, pre-order]`, give every
//!    record its cumulative offset, and patch entry offsets and the
//!    signature's root offsets.
//! 3. **Write**: emit the records sequentially, streaming file content
//!    from the source container.
//!
//! Phases 1 and 2 are the pure function [`plan`]; phase 3 is
//! [`write_layout`]. Free-space records never reach the tree, so they are
//! dropped. Names, digests, entry keys and entry order carry over
//! unchanged.
//!
//! [`compact_to_path`] stages output in a temporary file next to the
//! destination and renames it into place only after a complete, synced
//! write; a failed run leaves the destination untouched.

use std::io::{self, Read, Seek, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::buffer::{WriteBuffer, DEFAULT_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::record::{DirectoryEntry, DirectoryRecord, FileRecord, SignatureRecord};
use crate::source::ByteSource;
use crate::tree::{Directory, File, Node, Tree};

// ── Options & stats ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompactOptions {
    /// Write buffer capacity in bytes.
    pub buffer_size: usize,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self { buffer_size: DEFAULT_BUFFER_SIZE }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactStats {
    pub directories:   usize,
    pub files:         usize,
    pub bytes_written: u64,
}

// ── Layout ───────────────────────────────────────────────────────────────────

/// A directory record ready to serialise, entry offsets already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDir {
    pub offset: u64,
    pub len:    u64,
    pub record: DirectoryRecord,
}

/// A file record whose content is still in the source container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile<'t> {
    pub offset: u64,
    pub len:    u64,
    pub file:   &'t File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout<'t> {
    pub signature: SignatureRecord,
    pub dirs:      Vec<PlannedDir>,
    pub files:     Vec<PlannedFile<'t>>,
    /// Size of the output container.
    pub total_len: u64,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Dir(usize),
    File(usize),
}

struct SizedDir<'t> {
    dir:      &'t Directory,
    len:      u64,
    children: Vec<(u32, Slot)>,
}

#[derive(Default)]
struct SizePass<'t> {
    dirs:  Vec<SizedDir<'t>>,
    files: Vec<(&'t File, u64)>,
}

/// Phases 1 and 2: size every record and assign output offsets.
pub fn plan(tree: &Tree) -> Result<Layout<'_>> {
    // Phase 1: sizes.
    let mut sized = SizePass::default();
    let mut roots = Vec::with_capacity(tree.roots.len());
    for node in &tree.roots {
        roots.push(size_node(node, &mut sized)?);
    }
    debug!(directories = sized.dirs.len(), files = sized.files.len(), "size pass done");

    // Phase 2: offsets. Nothing is assigned until every record is sized.
    let mut cursor = SignatureRecord::encoded_len(roots.len());
    let dir_offsets: Vec<u64> = sized.dirs.iter().map(|d| {
        let at = cursor;
        cursor += d.len;
        at
    }).collect();
    let file_offsets: Vec<u64> = sized.files.iter().map(|(_, len)| {
        let at = cursor;
        cursor += len;
        at
    }).collect();

    let resolve = |slot: Slot| match slot {
        Slot::Dir(i)  => dir_offsets[i],
        Slot::File(i) => file_offsets[i],
    };

    let dirs = sized.dirs.iter().zip(&dir_offsets).map(|(d, &offset)| PlannedDir {
        offset,
        len: d.len,
        record: DirectoryRecord {
            name:    d.dir.name.clone(),
            digest:  d.dir.digest,
            entries: d.children.iter()
                .map(|&(key, slot)| DirectoryEntry { key, offset: resolve(slot) })
                .collect(),
        },
    }).collect();

    let files = sized.files.iter().zip(&file_offsets)
        .map(|(&(file, len), &offset)| PlannedFile { offset, len, file })
        .collect();

    let signature = SignatureRecord {
        root_offsets: roots.into_iter().map(resolve).collect(),
    };

    Ok(Layout { signature, dirs, files, total_len: cursor })
}

/// Size `node` and everything under it. Slots are numbered in pre-order;
/// the walk keeps its own stack of `(slot, directory, next child)`.
fn size_node<'t>(node: &'t Node, sized: &mut SizePass<'t>) -> Result<Slot> {
    let top = sized.push(node)?;
    let Slot::Dir(index) = top else { return Ok(top) };
    let mut stack = vec![(index, sized.dirs[index].dir, 0usize)];

    while let Some(frame) = stack.last_mut() {
        let (parent, dir) = (frame.0, frame.1);
        let Some(child) = dir.children.get(frame.2) else {
            stack.pop();
            continue;
        };
        frame.2 += 1;
        let slot = sized.push(child)?;
        sized.dirs[parent].children.push((child.key(), slot));
        if let (Slot::Dir(i), Node::Directory(sub)) = (slot, child) {
            stack.push((i, sub, 0));
        }
    }
    Ok(top)
}

impl<'t> SizePass<'t> {
    fn push(&mut self, node: &'t Node) -> Result<Slot> {
        match node {
            Node::File(f) => {
                let len = checked(&f.path, FileRecord::encoded_len(&f.name, f.size()))?;
                self.files.push((f, len));
                Ok(Slot::File(self.files.len() - 1))
            }
            Node::Directory(d) => {
                let len = checked(&d.path, DirectoryRecord::encoded_len(&d.name, d.children.len()))?;
                self.dirs.push(SizedDir { dir: d, len, children: Vec::with_capacity(d.children.len()) });
                Ok(Slot::Dir(self.dirs.len() - 1))
            }
        }
    }
}

fn checked(path: &str, len: u64) -> Result<u64> {
    if len > u64::from(u32::MAX) {
        return Err(Error::RecordTooLarge { name: path.to_owned(), len });
    }
    Ok(len)
}

// ── Write ────────────────────────────────────────────────────────────────────

/// Phase 3: serialise `layout`, copying file content out of `src`.
pub fn write_layout<R: Read + Seek, W: Write>(
    layout: &Layout<'_>,
    src:    &mut ByteSource<R>,
    out:    W,
    opts:   &CompactOptions,
) -> Result<CompactStats> {
    let mut out = WriteBuffer::new(out, opts.buffer_size);

    layout.signature.write(&mut out)?;

    for dir in &layout.dirs {
        expect_position(&out, dir.offset)?;
        dir.record.write(&mut out)?;
    }

    for planned in &layout.files {
        expect_position(&out, planned.offset)?;
        let file = planned.file;
        FileRecord::write_prefix(&mut out, &file.name, &file.digest, file.size())?;
        let copied = io::copy(&mut src.reader_at(file.data.offset, file.size())?, &mut out)?;
        if copied != file.size() {
            return Err(Error::TruncatedRecord {
                offset:    file.offset,
                declared:  file.size(),
                available: copied,
            });
        }
    }

    out.flush()?;
    expect_position(&out, layout.total_len)?;
    Ok(CompactStats {
        directories:   layout.dirs.len(),
        files:         layout.files.len(),
        bytes_written: out.bytes_written,
    })
}

fn expect_position<W: Write>(out: &WriteBuffer<W>, offset: u64) -> Result<()> {
    if out.bytes_written != offset {
        return Err(Error::Io(io::Error::new(io::ErrorKind::InvalidData, format!(
            "layout drift: record planned at {offset}, writer is at {}", out.bytes_written
        ))));
    }
    Ok(())
}

/// Plan and write in one go.
pub fn compact<R: Read + Seek, W: Write>(
    tree: &Tree,
    src:  &mut ByteSource<R>,
    out:  W,
    opts: &CompactOptions,
) -> Result<CompactStats> {
    let layout = plan(tree)?;
    write_layout(&layout, src, out, opts)
}

/// Compact into `dest`, publishing it only after a complete write.
pub fn compact_to_path<R: Read + Seek, P: AsRef<Path>>(
    tree: &Tree,
    src:  &mut ByteSource<R>,
    dest: P,
    opts: &CompactOptions,
) -> Result<CompactStats> {
    let dest = dest.as_ref();
    let layout = plan(tree)?;
    info!(
        directories = layout.dirs.len(),
        files = layout.files.len(),
        bytes = layout.total_len,
        "layout planned"
    );

    let mut staged = stage_next_to(dest)?;
    let stats = write_layout(&layout, src, staged.as_file_mut(), opts)?;
    publish(staged, dest)?;

    info!(dest = %dest.display(), bytes = stats.bytes_written, "container written");
    Ok(stats)
}

/// Temporary file in the same directory as `dest`, so the final rename
/// stays on one filesystem.
pub(crate) fn stage_next_to(dest: &Path) -> Result<NamedTempFile> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    Ok(NamedTempFile::new_in(dir)?)
}

/// Sync the staged file and atomically move it over `dest`.
pub(crate) fn publish(staged: NamedTempFile, dest: &Path) -> Result<()> {
    staged.as_file().sync_all()?;
    staged.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
