//! Content decoding for stored files.
//!
//! Stored bytes come in three shapes:
//!
//! * **plain**: used as-is;
//! * **compressed**: `"CMP"`, a `u32` declared length, then one codec block;
//! * **texture** (`.dds`): verbatim when it starts with `"DDS "`, a link to
//!   another file when the first byte is `0x2A` (the rest is a UTF-8 path),
//!   and otherwise the compressed layout with three placeholder bytes where
//!   `"CMP"` would be.
//!
//! [`sniff`] classifies bytes without touching the container;
//! [`ContentResolver`] applies decompression and follows links. None of this
//! is involved in verification, which always hashes stored bytes.

pub mod extract;

pub use extract::{ExtractOptions, ExtractStats, Extractor};

use std::io::{Read, Seek};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::codec::{get_codec, Codec, CodecId};
use crate::error::{Error, Result};
use crate::source::ByteSource;
use crate::tree::{File, Node, Tree};

pub const COMPRESSED_MAGIC: &[u8; 3] = b"CMP";
pub const TEXTURE_MAGIC: &[u8; 4] = b"DDS ";
pub const LINK_SENTINEL: u8 = 0x2A;
/// Marker (or placeholder) bytes plus the `u32` declared length.
pub const COMPRESSED_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    Plain,
    Compressed { declared_len: u32, block_start: usize },
    /// Absolute path of the file whose content stands in for this one.
    Link { target: String },
}

/// Whether `name` carries the texture extension (ASCII case-insensitive).
pub fn is_texture(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b".dds")
}

/// Classify the stored bytes of the file at `path`.
pub fn sniff(path: &str, bytes: &[u8]) -> Result<Encoding> {
    let unsupported = |reason: &'static str| Error::UnsupportedEncoding { path: path.to_owned(), reason };

    if is_texture(path) {
        if bytes.starts_with(TEXTURE_MAGIC) {
            return Ok(Encoding::Plain);
        }
        match bytes.first() {
            None => return Err(unsupported("empty texture")),
            Some(&LINK_SENTINEL) => {
                let raw = &bytes[1..];
                let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                let target = std::str::from_utf8(&raw[..end])
                    .map_err(|_| unsupported("link target is not UTF-8"))?;
                if target.is_empty() {
                    return Err(unsupported("empty link target"));
                }
                let target = if target.starts_with('/') {
                    target.to_owned()
                } else {
                    format!("/{target}")
                };
                return Ok(Encoding::Link { target });
            }
            Some(_) if bytes.len() < COMPRESSED_HEADER_LEN => {
                return Err(unsupported("texture too short for a compressed header"));
            }
            Some(_) => return Ok(compressed(bytes)),
        }
    }

    if bytes.starts_with(COMPRESSED_MAGIC) && bytes.len() >= COMPRESSED_HEADER_LEN {
        return Ok(compressed(bytes));
    }
    Ok(Encoding::Plain)
}

fn compressed(bytes: &[u8]) -> Encoding {
    Encoding::Compressed {
        declared_len: LittleEndian::read_u32(&bytes[3..COMPRESSED_HEADER_LEN]),
        block_start:  COMPRESSED_HEADER_LEN,
    }
}

/// Outcome of decoding one file on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Content(Vec<u8>),
    Link(String),
}

pub struct ContentResolver<'s, R: Read + Seek> {
    src:   &'s mut ByteSource<R>,
    codec: Box<dyn Codec>,
}

impl<'s, R: Read + Seek> ContentResolver<'s, R> {
    pub fn new(src: &'s mut ByteSource<R>, codec: CodecId) -> Self {
        Self::with_codec(src, get_codec(codec))
    }

    pub fn with_codec(src: &'s mut ByteSource<R>, codec: Box<dyn Codec>) -> Self {
        Self { src, codec }
    }

    /// Decode raw stored bytes belonging to `path`.
    pub fn decode(&self, path: &str, raw: Vec<u8>) -> Result<Resolved> {
        match sniff(path, &raw)? {
            Encoding::Plain => Ok(Resolved::Content(raw)),
            Encoding::Compressed { declared_len, block_start } => {
                let out = self.codec.decompress(&raw[block_start..], declared_len)?;
                debug!(path, stored = raw.len(), decoded = out.len(), codec = self.codec.codec_id().name(), "decompressed");
                Ok(Resolved::Content(out))
            }
            Encoding::Link { target } => Ok(Resolved::Link(target)),
        }
    }

    /// Read and decode one file without following links.
    pub fn resolve_file(&mut self, file: &File) -> Result<Resolved> {
        let raw = file.read_content(self.src)?;
        self.decode(&file.path, raw)
    }

    /// Usable content of the file at `path`, following link chains.
    pub fn read(&mut self, tree: &Tree, path: &str) -> Result<Vec<u8>> {
        let mut chain: Vec<String> = Vec::new();
        let mut current = path.to_owned();
        loop {
            let file = match tree.find(&current).and_then(Node::as_file) {
                Some(file) => file,
                None if chain.is_empty() => return Err(Error::NotFound { path: current }),
                None => return Err(Error::BrokenLink { target: current, dependents: chain }),
            };
            match self.resolve_file(file)? {
                Resolved::Content(bytes) => return Ok(bytes),
                Resolved::Link(target) => {
                    debug!(from = %current, to = %target, "following link");
                    chain.push(current);
                    if chain.contains(&target) {
                        return Err(Error::BrokenLink { target, dependents: chain });
                    }
                    current = target;
                }
            }
        }
    }
}
