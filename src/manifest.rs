//! Serializable listing of a parsed tree, for `ggpk list --json`.

use serde::Serialize;

use crate::tree::{Node, Tree, TreeStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub path:   String,
    pub kind:   EntryKind,
    /// Hex-encoded stored digest.
    pub digest: String,
    pub key:    u32,
    pub offset: u64,
    /// Stored content length; `None` for directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size:   Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub directories:   usize,
    pub files:         usize,
    pub content_bytes: u64,
    pub entries:       Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_tree(tree: &Tree) -> Self {
        let TreeStats { directories, files, content_bytes } = tree.stats();
        let entries = tree.walk().map(|node| match node {
            Node::Directory(d) => ManifestEntry {
                path:   d.path.clone(),
                kind:   EntryKind::Directory,
                digest: hex::encode(d.digest),
                key:    d.key,
                offset: d.offset,
                size:   None,
            },
            Node::File(f) => ManifestEntry {
                path:   f.path.clone(),
                kind:   EntryKind::File,
                digest: hex::encode(f.digest),
                key:    f.key,
                offset: f.offset,
                size:   Some(f.size()),
            },
        }).collect();
        Self { directories, files, content_bytes, entries }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
