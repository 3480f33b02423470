//! # Ferroz LZMA
//!
//! A pure Rust LZMA/LZMA2 compression engine: the sliding-window match
//! finders, the adaptive binary range coder, the price-driven optimal
//! parser, the paired decoder, and the LZMA2 chunk framing.
//!
//! ## Layout
//!
//! - [`range_coder`]: the entropy layer both directions share
//! - [`model`]: probability tables and the coder state machine
//! - [`price`]: fixed-point bit costs for encoding decisions
//! - [`lz`]: hash-chain and binary-tree match finders, plus the
//!   three-stage multi-threaded pipeline
//! - [`optimal`]: fast and dynamic-programming parsers
//! - [`encoder`] / [`decoder`]: the LZMA symbol coders
//! - [`lzma2`] / [`lzma2_chunk`]: the chunked framing above LZMA
//! - [`parallel`]: block-parallel LZMA2 encoding
//!
//! ## One-shot usage
//!
//! ```
//! let data = b"an example worth compressing, compressing, compressing";
//! let packed = ferroz_lzma::compress(data, 6).unwrap();
//! let unpacked = ferroz_lzma::decompress(&packed).unwrap();
//! assert_eq!(unpacked, data);
//! ```
//!
//! Streams produced here follow the LZMA/LZMA2 bit formats: any conforming
//! decoder reads them, and the decoder here reads any conforming stream.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod encoder;
pub mod lz;
pub mod lzma2;
pub mod lzma2_chunk;
pub mod model;
pub mod optimal;
pub mod parallel;
pub mod price;
pub mod range_coder;

pub use decoder::{DecodeOutcome, LzmaDecoder};
pub use encoder::{EncoderOptions, LzmaEncoder};
pub use ferroz_core::{CancelToken, FerrozError, Result};
pub use lz::MfKind;
pub use lzma2::{Lzma2Decoder, Lzma2Encoder, Lzma2Options, Lzma2Reader};
pub use model::LzmaProps;
pub use optimal::Mode;
pub use parallel::{ParallelEncoder, ParallelOptions};

use std::io::Cursor;

/// Compress `data` into a `.lzma`-style container: the five-byte
/// properties header, the eight-byte uncompressed size, then the raw
/// stream (no end marker, since the size is carried in the header).
pub fn compress(data: &[u8], level: u8) -> Result<Vec<u8>> {
    let encoder = LzmaEncoder::new(EncoderOptions::from_level(level))?;
    let mut out = Vec::new();
    out.extend_from_slice(&encoder.properties());
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    encoder.compress_raw(data, &mut out, false, &CancelToken::new())?;
    Ok(out)
}

/// Decompress a `.lzma`-style container produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    LzmaDecoder::with_header(Cursor::new(data))?.decode_to_end()
}

/// Compress `data` as a self-terminated LZMA2 stream.
pub fn compress_lzma2(data: &[u8], level: u8) -> Result<Vec<u8>> {
    let encoder = Lzma2Encoder::new(Lzma2Options::from_level(level))?;
    let mut out = Vec::new();
    encoder.encode(data, &mut out)?;
    Ok(out)
}

/// Decompress an LZMA2 stream.
///
/// `dict_size` bounds the back-reference window, exactly as stored in
/// container metadata next to the stream.
pub fn decompress_lzma2(data: &[u8], dict_size: u32) -> Result<Vec<u8>> {
    Lzma2Decoder::new(dict_size).decode(&mut Cursor::new(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_byte() {
        let packed = compress(b"A", 6).unwrap();
        assert_eq!(decompress(&packed).unwrap(), b"A");
    }

    #[test]
    fn test_roundtrip_empty() {
        let packed = compress(b"", 6).unwrap();
        assert_eq!(decompress(&packed).unwrap(), b"");
    }

    #[test]
    fn test_roundtrip_text() {
        let data = b"The quick brown fox jumps over the lazy dog. \
                     The quick brown fox jumps over the lazy dog again.";
        for level in [0u8, 1, 4, 5, 6, 9] {
            let packed = compress(data, level).unwrap();
            assert_eq!(decompress(&packed).unwrap(), data, "level {level}");
        }
    }

    #[test]
    fn test_repeated_data_compresses_hard() {
        let data = vec![0x41u8; 4096];
        let packed = compress(&data, 6).unwrap();
        assert!(packed.len() < 13 + 30);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_lzma2_roundtrip() {
        let data = b"chunk me, chunk me, chunk me thoroughly".repeat(50);
        let packed = compress_lzma2(&data, 6).unwrap();
        let dict = EncoderOptions::from_level(6).dict_size;
        assert_eq!(decompress_lzma2(&packed, dict).unwrap(), data);
    }

    #[test]
    fn test_levels_differ_but_agree() {
        let data: Vec<u8> = (0..10_000u32)
            .flat_map(|i| (i % 100).to_le_bytes())
            .collect();
        let fast = compress(&data, 1).unwrap();
        let best = compress(&data, 9).unwrap();
        assert_eq!(decompress(&fast).unwrap(), data);
        assert_eq!(decompress(&best).unwrap(), data);
        // The optimal parser should not meaningfully lose to the greedy
        // one on structured data.
        assert!(best.len() <= fast.len() + 16);
    }

    #[test]
    fn test_header_carries_size() {
        let packed = compress(b"12345", 6).unwrap();
        assert_eq!(
            u64::from_le_bytes(packed[5..13].try_into().unwrap()),
            5
        );
    }
}
