//! Logical tree reconstructed from offset-linked records.
//!
//! [`Tree::build`] starts at the signature record and follows every
//! directory entry. Directories own their children; files keep their
//! content on disk as a [`Span`] and are read on demand.
//!
//! # Paths
//! A top-level directory is addressed as `"/" + name` (an unnamed root is
//! `/`), but its children hang directly off the archive root: child `x` of
//! a top-level directory is `/x`. Below that, paths are `parent + "/" +
//! name`. Two nodes resolving to the same path are `MalformedRecord`, as
//! is nesting deeper than [`MAX_DEPTH`] or a path longer than
//! [`MAX_PATH_LEN`] bytes.
//!
//! # Corruption
//! The walk uses an explicit stack and a set of visited offsets. Reaching
//! any offset twice fails with `CycleDetected`, so a directory entry that
//! points back at an ancestor cannot send the builder into a loop.

use std::collections::HashSet;
use std::io::{Read, Seek};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::{
    Digest, DirectoryEntry, DirectoryRecord, FileRecord, Record, RecordHeader, Span, Tag,
    SIGNATURE_OFFSET,
};
use crate::source::ByteSource;

/// Deepest directory nesting accepted, counting the top-level directory.
pub const MAX_DEPTH: usize = 4096;

/// Longest derived path accepted, in UTF-8 bytes.
pub const MAX_PATH_LEN: usize = 32 * 1024;

// ── Nodes ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub name:     String,
    pub path:     String,
    pub digest:   Digest,
    /// Entry key under which the parent referenced this node.
    pub key:      u32,
    /// Offset of the record this node was read from.
    pub offset:   u64,
    pub children: Vec<Node>,
}

// Dropping a deep chain through the derived glue recurses once per level.
impl Drop for Directory {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(node) = pending.pop() {
            if let Node::Directory(mut dir) = node {
                pending.append(&mut dir.children);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub name:   String,
    pub path:   String,
    pub digest: Digest,
    pub key:    u32,
    pub offset: u64,
    /// Raw stored content.
    pub data:   Span,
}

impl File {
    pub fn size(&self) -> u64 { self.data.len }

    /// Read the raw stored bytes.
    pub fn read_content<R: Read + Seek>(&self, src: &mut ByteSource<R>) -> Result<Vec<u8>> {
        Ok(src.read_span(self.data.offset, self.data.len)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directory(Directory),
    File(File),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Directory(d) => &d.name,
            Node::File(f)      => &f.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::Directory(d) => &d.path,
            Node::File(f)      => &f.path,
        }
    }

    pub fn digest(&self) -> &Digest {
        match self {
            Node::Directory(d) => &d.digest,
            Node::File(f)      => &f.digest,
        }
    }

    pub fn key(&self) -> u32 {
        match self {
            Node::Directory(d) => d.key,
            Node::File(f)      => f.key,
        }
    }

    pub fn as_dir(&self) -> Option<&Directory> {
        match self {
            Node::Directory(d) => Some(d),
            Node::File(_)      => None,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            Node::File(f)      => Some(f),
            Node::Directory(_) => None,
        }
    }
}

// ── Tree ─────────────────────────────────────────────────────────────────────

/// Aggregate counts over a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub directories:   usize,
    pub files:         usize,
    pub content_bytes: u64,
}

/// The forest of top-level nodes listed by the signature record, in
/// signature order, with free-space roots dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    pub roots: Vec<Node>,
}

enum Visited {
    Skipped,
    File(File),
    Directory(Directory, Vec<DirectoryEntry>),
}

struct Frame {
    dir:        Directory,
    entries:    Vec<DirectoryEntry>,
    next:       usize,
    child_base: String,
    /// Child names seen so far. Children of a top-level directory share
    /// the build-wide set instead, since they all land at `/name`.
    names:      Option<HashSet<String>>,
}

impl Tree {
    /// Parse the container behind `src` into a tree.
    pub fn build<R: Read + Seek>(src: &mut ByteSource<R>) -> Result<Self> {
        let header = RecordHeader::read_at(src, SIGNATURE_OFFSET)?;
        if header.tag != Tag::Signature {
            return Err(Error::MalformedOffset {
                offset:  SIGNATURE_OFFSET,
                tag:     header.tag,
                context: "container must start with a signature record",
            });
        }
        let signature = match Record::decode(src, SIGNATURE_OFFSET)? {
            (Record::Signature(s), _) => s,
            (other, _) => {
                return Err(Error::MalformedOffset {
                    offset:  SIGNATURE_OFFSET,
                    tag:     other.tag(),
                    context: "container must start with a signature record",
                })
            }
        };
        debug!(roots = signature.root_offsets.len(), "read signature");

        let mut visited = HashSet::new();
        let mut shallow = HashSet::new();

        let mut roots = Vec::with_capacity(signature.root_offsets.len());
        for &offset in &signature.root_offsets {
            if let Some(node) = build_root(src, offset, &mut visited, &mut shallow)? {
                roots.push(node);
            }
        }

        let tree = Self { roots };
        let stats = tree.stats();
        info!(
            directories = stats.directories,
            files = stats.files,
            content_bytes = stats.content_bytes,
            "container parsed"
        );
        Ok(tree)
    }

    /// First top-level directory (real containers have exactly one).
    pub fn root_dir(&self) -> Option<&Directory> {
        self.roots.iter().find_map(Node::as_dir)
    }

    /// Pre-order traversal honouring stored entry order.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: self.roots.iter().rev().collect() }
    }

    /// Look a node up by absolute path. `/` (or an empty path) is the first
    /// top-level directory; a trailing slash is ignored.
    pub fn find(&self, path: &str) -> Option<&Node> {
        let wanted = path.trim_end_matches('/');
        if wanted.is_empty() {
            return self.roots.iter().find(|n| n.as_dir().is_some());
        }
        self.walk().find(|n| n.path() == wanted)
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        for node in self.walk() {
            match node {
                Node::Directory(_) => stats.directories += 1,
                Node::File(f) => {
                    stats.files += 1;
                    stats.content_bytes += f.size();
                }
            }
        }
        stats
    }
}

/// Iterator returned by [`Tree::walk`].
pub struct Walk<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<&'a Node> {
        let node = self.stack.pop()?;
        if let Node::Directory(d) = node {
            self.stack.extend(d.children.iter().rev());
        }
        Some(node)
    }
}

// ── builder internals ────────────────────────────────────────────────────────

fn build_root<R: Read + Seek>(
    src:     &mut ByteSource<R>,
    offset:  u64,
    visited: &mut HashSet<u64>,
    shallow: &mut HashSet<String>,
) -> Result<Option<Node>> {
    let root = visit(src, offset, 0, None, visited)?;
    if let Some(name) = root.name() {
        claim(shallow, name, offset)?;
    }
    let mut stack = match root {
        Visited::Skipped => return Ok(None),
        Visited::File(file) => return Ok(Some(Node::File(file))),
        Visited::Directory(dir, entries) => vec![Frame {
            dir,
            entries,
            next: 0,
            child_base: String::new(),
            names: None,
        }],
    };

    while let Some(frame) = stack.last_mut() {
        let Some(entry) = frame.entries.get(frame.next).copied() else {
            let Some(done) = stack.pop() else { break };
            match stack.last_mut() {
                Some(parent) => parent.dir.children.push(Node::Directory(done.dir)),
                None => return Ok(Some(Node::Directory(done.dir))),
            }
            continue;
        };
        frame.next += 1;

        let child = visit(src, entry.offset, entry.key, Some(frame.child_base.as_str()), visited)?;
        if let Some(name) = child.name() {
            let names = frame.names.as_mut().unwrap_or(&mut *shallow);
            claim(names, name, entry.offset)?;
        }
        match child {
            Visited::Skipped => {}
            Visited::File(file) => frame.dir.children.push(Node::File(file)),
            Visited::Directory(dir, entries) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(Error::MalformedRecord {
                        offset: entry.offset,
                        reason: format!("directories nested deeper than {MAX_DEPTH}"),
                    });
                }
                let child_base = dir.path.clone();
                let names = Some(HashSet::with_capacity(entries.len()));
                stack.push(Frame { dir, entries, next: 0, child_base, names });
            }
        }
    }
    Ok(None)
}

fn claim(names: &mut HashSet<String>, name: &str, offset: u64) -> Result<()> {
    if names.insert(name.to_owned()) {
        return Ok(());
    }
    Err(Error::MalformedRecord {
        offset,
        reason: format!("name {name:?} already used at the same path"),
    })
}

impl Visited {
    fn name(&self) -> Option<&str> {
        match self {
            Visited::Skipped            => None,
            Visited::File(f)            => Some(&f.name),
            Visited::Directory(d, _)    => Some(&d.name),
        }
    }
}

/// Decode the record at `offset`. `base` is the parent's child prefix, or
/// `None` for a top-level node.
fn visit<R: Read + Seek>(
    src:     &mut ByteSource<R>,
    offset:  u64,
    key:     u32,
    base:    Option<&str>,
    visited: &mut HashSet<u64>,
) -> Result<Visited> {
    let header = RecordHeader::read_at(src, offset)?;
    if header.tag != Tag::Signature && !visited.insert(offset) {
        return Err(Error::CycleDetected { offset });
    }
    let path_of = |name: &str| {
        let path = match base {
            Some(base) => format!("{base}/{name}"),
            None       => format!("/{name}"),
        };
        if path.len() > MAX_PATH_LEN {
            return Err(Error::MalformedRecord {
                offset,
                reason: format!("path longer than {MAX_PATH_LEN} bytes"),
            });
        }
        Ok(path)
    };

    match header.tag {
        Tag::Free => {
            debug!(offset, len = header.length, "skipping free space");
            Ok(Visited::Skipped)
        }
        Tag::Signature => Err(Error::MalformedOffset {
            offset,
            tag: header.tag,
            context: if base.is_some() {
                "signature record referenced from a directory"
            } else {
                "signature record listed as a root node"
            },
        }),
        Tag::File => {
            let meta = FileRecord::read_meta(src, offset, &header)?;
            let path = path_of(&meta.name)?;
            debug!(offset, path = %path, size = meta.data.len, "file");
            Ok(Visited::File(File {
                name:   meta.name,
                path,
                digest: meta.digest,
                key,
                offset,
                data:   meta.data,
            }))
        }
        Tag::Directory => {
            let record = DirectoryRecord::read_body(src, offset, &header)?;
            let path = path_of(&record.name)?;
            debug!(offset, path = %path, children = record.entries.len(), "directory");
            Ok(Visited::Directory(
                Directory {
                    name:     record.name,
                    path,
                    digest:   record.digest,
                    key,
                    offset,
                    children: Vec::with_capacity(record.entries.len()),
                },
                record.entries,
            ))
        }
    }
}
