//! Crate-wide error type.
//!
//! Every inconsistency the engine detects is surfaced here with enough
//! context (offset, path, expected vs. actual) for the caller to act on.
//! Nothing is patched up or skipped silently.

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::record::{Digest, Tag};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown record tag {:?} at offset {offset}", String::from_utf8_lossy(.tag))]
    UnknownRecordTag { offset: u64, tag: [u8; 4] },

    #[error("Truncated record at offset {offset}: header declares {declared} bytes, only {available} available")]
    TruncatedRecord { offset: u64, declared: u64, available: u64 },

    #[error("Malformed record at offset {offset}: {reason}")]
    MalformedRecord { offset: u64, reason: String },

    /// A valid tag found where the traversal context does not allow it.
    #[error("Unexpected {tag} record at offset {offset} ({context})")]
    MalformedOffset { offset: u64, tag: Tag, context: &'static str },

    #[error("Cycle detected: offset {offset} is referenced more than once")]
    CycleDetected { offset: u64 },

    #[error("Digest mismatch at {path}: expected {}, got {}", hex::encode(.expected), hex::encode(.actual))]
    DigestMismatch { path: String, expected: Digest, actual: Digest },

    #[error("Unsupported encoding for {path}: {reason}")]
    UnsupportedEncoding { path: String, reason: &'static str },

    #[error("Broken link: {target} never resolved (wanted by {})", .dependents.join(", "))]
    BrokenLink { target: String, dependents: Vec<String> },

    #[error("Record for {name} is too large to encode ({len} bytes)")]
    RecordTooLarge { name: String, len: u64 },

    #[error("Refusing to write outside the destination: {path}")]
    UnsafePath { path: String },

    #[error("Not found in container: {path}")]
    NotFound { path: String },

    #[error("Decompression failed: {0}")]
    Decompression(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
