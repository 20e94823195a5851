// SPDX-License-Identifier: Apache-2.0

//! Payload compression for serialized access log records.
//!
//! When compression is enabled every record is shipped inside a
//! [`CompressedEnvelope`], which declares the algorithm and the uncompressed
//! size next to the compressed bytes so consumers can tell both modes apart.

use bytes::Bytes;
use flate2::Compression as GzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use lz4_flex::block;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("lz4 compression failed: {0}")]
    Lz4(#[from] lz4_flex::block::CompressError),

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("gzip compression failed: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("payload too large: {0} bytes")]
    TooLarge(usize),

    #[error("unknown compression algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("envelope encoding failed: {0}")]
    Envelope(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CompressionError>;

/// Largest payload [`Compression::decompress`] will produce.
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;

/// Compression algorithm applied to each serialized record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Gzip,
}

impl Compression {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compression::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Gzip => "gzip",
        }
    }

    /// Compress `input`, the input is never modified.
    pub fn compress(&self, input: &[u8]) -> Result<Bytes> {
        match self {
            Compression::None => Ok(Bytes::copy_from_slice(input)),
            Compression::Lz4 => lz4_compress(input),
            Compression::Gzip => gzip_compress(input),
        }
    }

    /// Reverse of [`Compression::compress`]. `original_size` is the size
    /// declared in the envelope and is rejected above
    /// [`MAX_DECOMPRESSED_SIZE`] before anything is allocated.
    pub fn decompress(&self, input: &[u8], original_size: usize) -> Result<Vec<u8>> {
        if original_size > MAX_DECOMPRESSED_SIZE {
            return Err(CompressionError::TooLarge(original_size));
        }
        match self {
            Compression::None => Ok(input.to_vec()),
            Compression::Lz4 => Ok(block::decompress(input, original_size)?),
            Compression::Gzip => {
                let mut out = Vec::with_capacity(original_size);
                // the declared size may lie, stop one byte past the ceiling
                GzDecoder::new(input)
                    .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
                    .read_to_end(&mut out)?;
                if out.len() > MAX_DECOMPRESSED_SIZE {
                    return Err(CompressionError::TooLarge(out.len()));
                }
                Ok(out)
            }
        }
    }

    /// Wrap an already serialized record into an envelope.
    pub fn envelope(&self, serialized: &[u8]) -> Result<CompressedEnvelope> {
        let payload = self.compress(serialized)?;
        Ok(CompressedEnvelope {
            algorithm: *self,
            original_size: serialized.len() as u64,
            payload,
        })
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = CompressionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "gzip" => Ok(Compression::Gzip),
            other => Err(CompressionError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl Serialize for Compression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn lz4_compress(input: &[u8]) -> Result<Bytes> {
    if input.len() > u32::MAX as usize {
        return Err(CompressionError::TooLarge(input.len()));
    }
    let mut buffer = vec![0u8; block::get_maximum_output_size(input.len())];
    let compressed_size = block::compress_into(input, &mut buffer)?;
    buffer.truncate(compressed_size);
    Ok(Bytes::from(buffer))
}

fn gzip_compress(input: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::fast());
    encoder.write_all(input)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Compressed record as it is put on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedEnvelope {
    pub algorithm: Compression,
    pub original_size: u64,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
}

impl CompressedEnvelope {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Recover the original serialized bytes.
    pub fn open(&self) -> Result<Vec<u8>> {
        let original_size = usize::try_from(self.original_size)
            .map_err(|_| CompressionError::TooLarge(usize::MAX))?;
        self.algorithm.decompress(&self.payload, original_size)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
