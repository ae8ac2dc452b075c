//! Opaque gzip compression for build-log blobs.
//!
//! The contract in the data model is that log content is stored as an
//! opaque compressed byte blob and that append works by decompressing,
//! concatenating, and recompressing. This is O(total_size^2) per log across
//! its lifetime, which is accepted as correct-but-not-optimal given MB-scale
//! logs and a 10 KiB flush threshold.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::store::StoreError;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(out)
}
