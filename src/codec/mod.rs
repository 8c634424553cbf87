//! Block codecs used by the content wrapper.
//!
//! The container stores compressed payloads as a bare block preceded by
//! its declared decompressed length. The block format itself is pluggable:
//! Brotli is what shipped containers use, the others exist for tooling and
//! tests.
//!
//! # Contract
//! `decompress(block, expected_len)` must return exactly `expected_len`
//! bytes. A codec that produces more or fewer bytes reports
//! [`CodecError::LengthMismatch`]; the caller never truncates or pads.
//!
//! The declared length comes from the container and is not trusted for
//! allocation: output buffers start at [`initial_capacity`] and grow only
//! as the codec actually produces bytes.

use std::io::{Read, Write};
use thiserror::Error;

// ── CodecId ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecId {
    /// Payload stored verbatim.
    None,
    #[default]
    Brotli,
    Zstd,
    Lz4,
}

impl CodecId {
    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Brotli => "brotli",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none"   => Some(CodecId::None),
            "brotli" => Some(CodecId::Brotli),
            "zstd"   => Some(CodecId::Zstd),
            "lz4"    => Some(CodecId::Lz4),
            _        => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Decompressed {actual} bytes, block declared {expected}")]
    LengthMismatch { expected: u32, actual: usize },
}

/// Floor for the output reservation when the block is tiny.
const MIN_RESERVE: usize = 64 * 1024;

/// Largest expansion an LZ4 block can encode.
const LZ4_MAX_RATIO: u64 = 255;

/// Bytes to reserve before decompressing `block_len` bytes that claim to
/// expand to `expected_len`.
pub fn initial_capacity(block_len: usize, expected_len: u32) -> usize {
    let bound = block_len.saturating_mul(4).max(MIN_RESERVE);
    (expected_len as usize).min(bound)
}

/// Read at most one byte past `expected_len` so an oversized stream is
/// caught by the length check instead of being cut silently.
fn read_bounded<R: Read>(reader: R, block_len: usize, expected_len: u32) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(initial_capacity(block_len, expected_len));
    reader
        .take(u64::from(expected_len) + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompression(e.to_string()))?;
    Ok(out)
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    /// Raw decompression; no length check.
    fn decompress_raw(&self, block: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError>;

    /// Decompress `block` and insist on exactly `expected_len` bytes.
    fn decompress(&self, block: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
        let out = self.decompress_raw(block, expected_len)?;
        if out.len() != expected_len as usize {
            return Err(CodecError::LengthMismatch { expected: expected_len, actual: out.len() });
        }
        Ok(out)
    }
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress_raw(&self, block: &[u8], _: u32) -> Result<Vec<u8>, CodecError> { Ok(block.to_vec()) }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(out)
    }
    fn decompress_raw(&self, block: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
        read_bounded(brotli::Decompressor::new(block, 4096), block.len(), expected_len)
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress_raw(&self, block: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
        let decoder = zstd::stream::read::Decoder::with_buffer(block)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        read_bounded(decoder, block.len(), expected_len)
    }
}

/// Raw LZ4 block; the size lives in the wrapper, not in the block.
pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress(data))
    }
    fn decompress_raw(&self, block: &[u8], expected_len: u32) -> Result<Vec<u8>, CodecError> {
        // lz4_flex sizes its output from `expected_len` up front.
        if u64::from(expected_len) > block.len() as u64 * LZ4_MAX_RATIO {
            return Err(CodecError::Decompression(format!(
                "{expected_len} bytes cannot come out of a {}-byte LZ4 block",
                block.len()
            )));
        }
        lz4_flex::decompress(block, expected_len as usize)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None   => Box::new(NoneCodec),
        CodecId::Brotli => Box::new(BrotliCodec),
        CodecId::Zstd   => Box::new(ZstdCodec),
        CodecId::Lz4    => Box::new(Lz4Codec),
    }
}
