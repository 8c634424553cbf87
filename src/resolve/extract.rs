//! One extraction run: decode files and write them under a destination
//! directory.
//!
//! Texture links may point at files the run has not reached yet. Such a
//! link is parked in a pending table keyed by its target; when the target
//! is written, every parked dependent receives a copy, and dependents that
//! are themselves link targets release their own dependents in turn. A
//! link whose target is already on disk is copied straight away.
//!
//! [`Extractor::finish`] settles whatever is still pending: targets that
//! exist in the container but fell outside the extracted scope are decoded
//! on demand, and anything left over is a [`Error::BrokenLink`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Seek};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info};

use super::{ContentResolver, Resolved};
use crate::error::{Error, Result};
use crate::tree::{Directory, File, Node, Tree};

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub dest_dir:  PathBuf,
    /// Descend into subdirectories.
    pub recursive: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { dest_dir: PathBuf::from("."), recursive: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtractStats {
    pub files_written:  usize,
    pub links_resolved: usize,
    pub bytes_written:  u64,
}

pub struct Extractor<'s, R: Read + Seek> {
    resolver:     ContentResolver<'s, R>,
    opts:         ExtractOptions,
    /// target path -> link paths waiting for it
    pending:      BTreeMap<String, BTreeSet<String>>,
    /// container path -> file written for it
    materialized: HashMap<String, PathBuf>,
    stats:        ExtractStats,
}

impl<'s, R: Read + Seek> Extractor<'s, R> {
    pub fn new(resolver: ContentResolver<'s, R>, opts: ExtractOptions) -> Self {
        Self {
            resolver,
            opts,
            pending:      BTreeMap::new(),
            materialized: HashMap::new(),
            stats:        ExtractStats::default(),
        }
    }

    pub fn stats(&self) -> ExtractStats { self.stats }

    /// Number of links still waiting for their target.
    pub fn pending_links(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    /// Extract the file or directory at `path`.
    pub fn extract(&mut self, tree: &Tree, path: &str) -> Result<()> {
        match tree.find(path) {
            Some(Node::File(file))     => self.extract_file(file),
            Some(Node::Directory(dir)) => self.extract_dir(dir),
            None => Err(Error::NotFound { path: path.to_owned() }),
        }
    }

    fn extract_dir(&mut self, dir: &Directory) -> Result<()> {
        debug!(path = %dir.path, "extracting directory");
        let mut stack = vec![dir.children.iter()];
        while let Some(children) = stack.last_mut() {
            match children.next() {
                None => {
                    stack.pop();
                }
                Some(Node::File(file)) => self.extract_file(file)?,
                Some(Node::Directory(sub)) if self.opts.recursive => {
                    debug!(path = %sub.path, "extracting directory");
                    stack.push(sub.children.iter());
                }
                Some(Node::Directory(_)) => {}
            }
        }
        Ok(())
    }

    fn extract_file(&mut self, file: &File) -> Result<()> {
        if self.materialized.contains_key(&file.path) {
            return Ok(());
        }
        match self.resolver.resolve_file(file)? {
            Resolved::Content(bytes) => {
                self.write_out(&file.path, &bytes)?;
                self.release(&file.path)
            }
            Resolved::Link(target) => match self.materialized.get(&target).cloned() {
                Some(from) => {
                    self.copy_out(&file.path, &from)?;
                    self.stats.links_resolved += 1;
                    self.release(&file.path)
                }
                None => {
                    debug!(link = %file.path, target = %target, "deferring link");
                    self.pending.entry(target).or_default().insert(file.path.clone());
                    Ok(())
                }
            },
        }
    }

    /// Hand the freshly written `target` to everything waiting on it,
    /// following chains of links.
    fn release(&mut self, target: &str) -> Result<()> {
        let mut work = vec![target.to_owned()];
        while let Some(done) = work.pop() {
            let Some(dependents) = self.pending.remove(&done) else { continue };
            let Some(from) = self.materialized.get(&done).cloned() else { continue };
            for link in dependents {
                self.copy_out(&link, &from)?;
                self.stats.links_resolved += 1;
                work.push(link);
            }
        }
        Ok(())
    }

    /// Settle outstanding links and return the run's totals.
    pub fn finish(mut self, tree: &Tree) -> Result<ExtractStats> {
        while let Some((target, dependents)) = self.pending.pop_first() {
            if tree.find(&target).and_then(Node::as_file).is_none() {
                return Err(Error::BrokenLink {
                    target,
                    dependents: dependents.into_iter().collect(),
                });
            }
            debug!(target = %target, "reading link target outside the extracted scope");
            let bytes = self.resolver.read(tree, &target)?;
            for link in dependents {
                self.write_out(&link, &bytes)?;
                self.stats.links_resolved += 1;
                self.release(&link)?;
            }
        }
        info!(
            files = self.stats.files_written,
            links = self.stats.links_resolved,
            bytes = self.stats.bytes_written,
            "extraction finished"
        );
        Ok(self.stats)
    }

    fn write_out(&mut self, path: &str, bytes: &[u8]) -> Result<()> {
        let dest = self.dest_for(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, bytes)?;
        debug!(path, dest = %dest.display(), size = bytes.len(), "wrote");
        self.record(path, dest, bytes.len() as u64);
        Ok(())
    }

    fn copy_out(&mut self, path: &str, from: &Path) -> Result<()> {
        let dest = self.dest_for(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let copied = fs::copy(from, &dest)?;
        debug!(path, from = %from.display(), "copied link target");
        self.record(path, dest, copied);
        Ok(())
    }

    fn record(&mut self, path: &str, dest: PathBuf, len: u64) {
        self.stats.files_written += 1;
        self.stats.bytes_written += len;
        self.materialized.insert(path.to_owned(), dest);
    }

    /// Map a container path onto the destination directory. Every segment
    /// must be a plain file name.
    fn dest_for(&self, path: &str) -> Result<PathBuf> {
        let unsafe_path = || Error::UnsafePath { path: path.to_owned() };
        let rel = path.strip_prefix('/').unwrap_or(path);
        if rel.is_empty() {
            return Err(unsafe_path());
        }
        let mut dest = self.opts.dest_dir.clone();
        for segment in rel.split('/') {
            let mut parts = Path::new(segment).components();
            match (parts.next(), parts.next()) {
                (Some(Component::Normal(name)), None) if name == segment => dest.push(name),
                _ => return Err(unsafe_path()),
            }
        }
        Ok(dest)
    }
}
