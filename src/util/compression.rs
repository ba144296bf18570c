use std::io::{Read, Write};

use anyhow::bail;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

pub fn compress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates zlib data, failing if the result would be longer than `limit` bytes. This bounds
///  the memory a small malicious datagram can make us allocate.
pub fn decompress_with_limit(data: &[u8], limit: usize) -> anyhow::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data)
        .take(limit as u64 + 1);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;
    if result.len() > limit {
        bail!("decompressed data exceeds limit of {} bytes", limit);
    }
    Ok(result)
}
