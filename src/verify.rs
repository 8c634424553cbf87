//! Hash-tree integrity check.
//!
//! A file's digest is SHA-256 over its stored bytes. A directory's digest is
//! SHA-256 over the concatenation of its children's digests, in stored entry
//! order. Verification walks the tree post-order and recomputes both from
//! the bytes on disk; a directory hashes its children's *recomputed*
//! digests, so a single changed byte shows up on the file and on every
//! ancestor above it.

use std::io::{self, Read, Seek};

use sha2::{Digest as _, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::record::Digest;
use crate::source::ByteSource;
use crate::tree::{Directory, File, Node, Tree};

/// SHA-256 of a file's stored bytes.
pub fn file_digest(content: &[u8]) -> Digest {
    Sha256::digest(content).into()
}

/// SHA-256 over the concatenation of child digests, in the order given.
pub fn directory_digest<'a, I>(children: I) -> Digest
where
    I: IntoIterator<Item = &'a Digest>,
{
    let mut hasher = Sha256::new();
    for digest in children {
        hasher.update(digest);
    }
    hasher.finalize().into()
}

// ── Options & report ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Stop at the first mismatch.
    #[default]
    FailFast,
    /// Check everything and report every mismatch.
    CollectAll,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub mode: VerifyMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub path:     String,
    pub kind:     NodeKind,
    pub expected: Digest,
    pub actual:   Digest,
}

impl From<Mismatch> for Error {
    fn from(m: Mismatch) -> Self {
        Error::DigestMismatch { path: m.path, expected: m.expected, actual: m.actual }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub files_checked: usize,
    pub dirs_checked:  usize,
    pub bytes_hashed:  u64,
    /// In detection order: a file before the directories that contain it.
    pub mismatches:    Vec<Mismatch>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool { self.mismatches.is_empty() }

    /// The first mismatch as an error, if any.
    pub fn into_result(self) -> Result<Self> {
        match self.mismatches.first() {
            Some(m) => Err(m.clone().into()),
            None    => Ok(self),
        }
    }
}

// ── Verifier ─────────────────────────────────────────────────────────────────

pub struct Verifier<'s, R: Read + Seek> {
    src:     &'s mut ByteSource<R>,
    opts:    VerifyOptions,
    report:  VerifyReport,
}

impl<'s, R: Read + Seek> Verifier<'s, R> {
    pub fn new(src: &'s mut ByteSource<R>, opts: VerifyOptions) -> Self {
        Self { src, opts, report: VerifyReport::default() }
    }

    /// Verify every top-level node. I/O failures abort with `Err`; digest
    /// mismatches are collected in the report.
    pub fn verify_tree(mut self, tree: &Tree) -> Result<VerifyReport> {
        for node in &tree.roots {
            if self.verify_node(node)?.is_none() {
                break;
            }
        }
        Ok(self.report)
    }

    /// Recompute one node. Returns the recomputed digest, or `None` once a
    /// fail-fast run has hit its first mismatch.
    pub fn verify_node(&mut self, node: &Node) -> Result<Option<Digest>> {
        match node {
            Node::File(f)      => self.verify_file(f),
            Node::Directory(d) => self.verify_dir(d),
        }
    }

    pub fn verify_file(&mut self, file: &File) -> Result<Option<Digest>> {
        debug!("checking {} ({})", file.path, hex::encode(file.digest));
        let mut hasher = Sha256::new();
        let copied = io::copy(&mut self.src.reader_at(file.data.offset, file.data.len)?, &mut hasher)?;
        if copied != file.data.len {
            return Err(Error::TruncatedRecord {
                offset:    file.offset,
                declared:  file.data.len,
                available: copied,
            });
        }
        self.report.files_checked += 1;
        self.report.bytes_hashed += copied;

        let actual: Digest = hasher.finalize().into();
        Ok(self.compare(&file.path, NodeKind::File, file.digest, actual))
    }

    /// Post-order over an explicit stack; each frame accumulates the
    /// recomputed digests of the children finished so far.
    pub fn verify_dir(&mut self, dir: &Directory) -> Result<Option<Digest>> {
        let mut stack = vec![DirFrame::new(dir)];
        while let Some(frame) = stack.last_mut() {
            let dir = frame.dir;
            if let Some(child) = dir.children.get(frame.next) {
                frame.next += 1;
                match child {
                    Node::File(f) => match self.verify_file(f)? {
                        Some(d) => frame.digests.push(d),
                        None    => return Ok(None),
                    },
                    Node::Directory(sub) => stack.push(DirFrame::new(sub)),
                }
                continue;
            }

            let Some(done) = stack.pop() else { break };
            debug!("checking directory {} ({})", dir.path, hex::encode(dir.digest));
            self.report.dirs_checked += 1;
            let actual = directory_digest(&done.digests);
            let Some(digest) = self.compare(&dir.path, NodeKind::Directory, dir.digest, actual) else {
                return Ok(None);
            };
            match stack.last_mut() {
                Some(parent) => parent.digests.push(digest),
                None => return Ok(Some(digest)),
            }
        }
        Ok(None)
    }

    fn compare(&mut self, path: &str, kind: NodeKind, expected: Digest, actual: Digest) -> Option<Digest> {
        if expected == actual {
            return Some(actual);
        }
        warn!(
            path,
            expected = %hex::encode(expected),
            actual = %hex::encode(actual),
            "digest mismatch"
        );
        self.report.mismatches.push(Mismatch { path: path.to_owned(), kind, expected, actual });
        match self.opts.mode {
            VerifyMode::FailFast   => None,
            VerifyMode::CollectAll => Some(actual),
        }
    }
}

struct DirFrame<'t> {
    dir:     &'t Directory,
    next:    usize,
    digests: Vec<Digest>,
}

impl<'t> DirFrame<'t> {
    fn new(dir: &'t Directory) -> Self {
        Self { dir, next: 0, digests: Vec::with_capacity(dir.children.len()) }
    }
}

/// Verify `tree` against the bytes behind `src`.
pub fn verify<R: Read + Seek>(
    tree: &Tree,
    src:  &mut ByteSource<R>,
    opts: VerifyOptions,
) -> Result<VerifyReport> {
    Verifier::new(src, opts).verify_tree(tree)
}
