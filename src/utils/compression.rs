//! Block compression strategy backed by LZ4 or Zstd.
//!
//! Each compressed unit travels as `[u32 BE block length][block]`, so the receiving
//! side can tell an incomplete block (wait for more bytes) from a corrupt one.

use crate::error::{ProtocolError, Result};
use crate::protocol::strategy::{Compression, Decompressed};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

/// Maximum output size for one decompressed block (prevents decompression bombs)
const MAX_DECOMPRESSION_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix of every framed block
const FRAME_HEADER_LEN: usize = 4;

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data that was compressed with the specified algorithm
///
/// Enforces a maximum output size limit to prevent decompression bombs.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - Decompression fails
/// - Output size exceeds MAX_DECOMPRESSION_SIZE
pub fn decompress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match *kind {
        CompressionKind::Lz4 => {
            // Validate the claimed size before lz4_flex allocates for it
            if data.len() < 4 {
                return Err(ProtocolError::DecompressionFailure);
            }

            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }

            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;

            // Read in chunks to enforce size limit
            use std::io::Read;
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > MAX_DECOMPRESSION_SIZE {
                            return Err(ProtocolError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(ProtocolError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}

/// [`Compression`] strategy writing length-framed LZ4 or Zstd blocks.
#[derive(Debug, Clone, Copy)]
pub struct BlockCompression {
    kind: CompressionKind,
}

impl BlockCompression {
    pub fn new(kind: CompressionKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> CompressionKind {
        self.kind
    }
}

impl Compression for BlockCompression {
    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let block = compress(input, &self.kind)?;
        let needed = FRAME_HEADER_LEN + block.len();
        if needed > output.len() || block.len() > u32::MAX as usize {
            return Err(ProtocolError::BufferOverflow {
                needed,
                available: output.len(),
            });
        }

        output[..FRAME_HEADER_LEN].copy_from_slice(&(block.len() as u32).to_be_bytes());
        output[FRAME_HEADER_LEN..needed].copy_from_slice(&block);
        Ok(needed)
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<Decompressed> {
        let mut result = Decompressed::default();

        while input.len() - result.consumed >= FRAME_HEADER_LEN {
            let header = &input[result.consumed..result.consumed + FRAME_HEADER_LEN];
            let block_len =
                u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if block_len > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }

            let block_start = result.consumed + FRAME_HEADER_LEN;
            if input.len() - block_start < block_len {
                // incomplete block, wait for the rest
                break;
            }

            let plain = decompress(&input[block_start..block_start + block_len], &self.kind)?;
            let free = output.len() - result.produced;
            if plain.len() > free {
                // no room yet; the block stays queued upstream
                break;
            }

            output[result.produced..result.produced + plain.len()].copy_from_slice(&plain);
            result.produced += plain.len();
            result.consumed = block_start + block_len;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lz4_compression_roundtrip() {
        let original = b"Hello, World! This is a test of LZ4 compression.";
        let compressed = compress(original, &CompressionKind::Lz4).unwrap();
        let decompressed = decompress(&compressed, &CompressionKind::Lz4).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_lz4_oom_attack_prevention() {
        // Claims to decompress to 3+ GB
        let malicious_payload = vec![0x2b, 0x60, 0xbb, 0xbb];
        let result = decompress(&malicious_payload, &CompressionKind::Lz4);
        assert!(result.is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_block_frames_roundtrip_zstd() {
        let strategy = BlockCompression::new(CompressionKind::Zstd);
        let plain = vec![7u8; 2000];
        let mut framed = vec![0u8; 4096];
        let n = strategy.compress(&plain, &mut framed).unwrap();

        let mut out = vec![0u8; 4096];
        let d = strategy.decompress(&framed[..n], &mut out).unwrap();
        assert_eq!(d.consumed, n);
        assert_eq!(&out[..d.produced], plain.as_slice());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_incomplete_block_is_left_unconsumed() {
        let strategy = BlockCompression::new(CompressionKind::Lz4);
        let mut framed = vec![0u8; 1024];
        let n = strategy.compress(b"abcdefgh", &mut framed).unwrap();

        let mut out = vec![0u8; 1024];
        let d = strategy.decompress(&framed[..n - 1], &mut out).unwrap();
        assert_eq!(d, Decompressed::default());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_two_blocks_second_partial() {
        let strategy = BlockCompression::new(CompressionKind::Lz4);
        let mut framed = vec![0u8; 1024];
        let a = strategy.compress(b"first", &mut framed).unwrap();
        let b = strategy.compress(b"second", &mut framed[a..]).unwrap();

        let mut out = vec![0u8; 1024];
        let d = strategy.decompress(&framed[..a + b - 2], &mut out).unwrap();
        assert_eq!(d.consumed, a);
        assert_eq!(&out[..d.produced], b"first");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_full_output_defers_block() {
        let strategy = BlockCompression::new(CompressionKind::Lz4);
        let mut framed = vec![0u8; 1024];
        let n = strategy.compress(&[1u8; 100], &mut framed).unwrap();

        let mut out = vec![0u8; 10];
        let d = strategy.decompress(&framed[..n], &mut out).unwrap();
        assert_eq!(d.consumed, 0);
        assert_eq!(d.produced, 0);
    }

    #[test]
    fn test_compress_into_small_output_fails() {
        let strategy = BlockCompression::new(CompressionKind::Lz4);
        let mut out = [0u8; 4];
        let err = strategy.compress(b"does not fit", &mut out);
        assert!(matches!(err, Err(ProtocolError::BufferOverflow { .. })));
    }

    #[test]
    fn test_oversized_frame_header_rejected() {
        let strategy = BlockCompression::new(CompressionKind::Lz4);
        let bad = (u32::MAX).to_be_bytes();
        let mut out = [0u8; 16];
        assert!(strategy.decompress(&bad, &mut out).is_err());
    }
}
