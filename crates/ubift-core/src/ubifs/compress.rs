//! Data-node payload decompression.
//!
//! UBIFS compresses each data block independently; the node records the
//! compressor and the uncompressed length, which is authoritative.

use std::io::Read;

use anyhow::{bail, Context, Result};

use super::lzo;
use super::node::Compression;

/// Decompress a data-node payload. The returned buffer is exactly
/// `uncompressed_size` bytes or the call fails.
pub fn decompress(data: &[u8], compr: Compression, uncompressed_size: usize) -> Result<Vec<u8>> {
    let out = match compr {
        Compression::None => data.to_vec(),
        Compression::Lzo => {
            lzo::decompress(data, uncompressed_size).context("LZO1X stream is damaged")?
        }
        Compression::Zlib => {
            // UBIFS stores raw deflate streams, no zlib wrapper.
            let mut out = Vec::with_capacity(uncompressed_size);
            flate2::read::DeflateDecoder::new(data)
                .take(uncompressed_size as u64 + 1)
                .read_to_end(&mut out)
                .context("deflate stream is damaged")?;
            out
        }
        Compression::Zstd => {
            zstd::bulk::decompress(data, uncompressed_size).context("zstd frame is damaged")?
        }
    };
    if out.len() != uncompressed_size {
        bail!(
            "decompressed {} bytes where the node declares {} ({})",
            out.len(),
            uncompressed_size,
            compr
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn none_passthrough() {
        assert_eq!(
            decompress(b"hello", Compression::None, 5).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn none_length_mismatch_errors() {
        assert!(decompress(b"hello", Compression::None, 4).is_err());
    }

    #[test]
    fn zlib_roundtrip() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&plain).unwrap();
        let packed = enc.finish().unwrap();
        assert_eq!(
            decompress(&packed, Compression::Zlib, plain.len()).unwrap(),
            plain
        );
    }

    #[test]
    fn zstd_roundtrip() {
        let plain = vec![0xABu8; 4096];
        let packed = zstd::bulk::compress(&plain, 0).unwrap();
        assert_eq!(
            decompress(&packed, Compression::Zstd, plain.len()).unwrap(),
            plain
        );
    }

    #[test]
    fn lzo_literals() {
        let src = [22, b'h', b'e', b'l', b'l', b'o', 0x11, 0x00, 0x00];
        assert_eq!(decompress(&src, Compression::Lzo, 5).unwrap(), b"hello");
    }

    #[test]
    fn zlib_garbage_errors() {
        assert!(decompress(&[0xFF, 0x00, 0x12], Compression::Zlib, 16).is_err());
    }
}
