//! Adaptive binary range coder.
//!
//! The entropy layer of LZMA: a 32-bit range, 11-bit adaptive probabilities
//! and byte-at-a-time renormalization. The encoder defers byte emission
//! through a one-byte cache plus a pending-0xFF counter so that carries out
//! of the 32-bit window propagate without backtracking.
//!
//! Encoder and decoder renormalize at the same point relative to the symbol
//! sequence (directly after each bit operation), so for a given symbol
//! sequence the decoder consumes exactly as many bytes as the encoder
//! produced: five initialization bytes up front, one byte per shared
//! renormalization, and the five flush bytes at the end. The LZMA2 framer
//! depends on this when it checks that a chunk consumed its declared packed
//! size.

use ferroz_core::error::{FerrozError, Result};
use std::io::{Read, Write};

/// Number of bits in the probability model.
pub const PROB_BITS: u32 = 11;

/// Initial (equiprobable) probability value.
pub const PROB_INIT: u16 = 1 << (PROB_BITS - 1);

/// Exclusive upper bound of probability values.
pub const PROB_MAX: u16 = 1 << PROB_BITS;

/// Adaptation shift: probabilities move by 1/32 of the remaining gap.
pub const MOVE_BITS: u32 = 5;

/// Renormalization threshold.
const TOP: u32 = 1 << 24;

/// Nudge a probability toward zero (a 0 bit was coded).
#[inline]
pub fn prob_dec_on_zero(prob: &mut u16) {
    *prob += (PROB_MAX - *prob) >> MOVE_BITS;
}

/// Nudge a probability toward one (a 1 bit was coded).
#[inline]
pub fn prob_inc_on_one(prob: &mut u16) {
    *prob -= *prob >> MOVE_BITS;
}

/// Range encoder writing to a byte sink.
#[derive(Debug)]
pub struct RangeEncoder<W: Write> {
    sink: W,
    low: u64,
    range: u32,
    cache: u8,
    cache_size: u64,
    written: u64,
}

impl<W: Write> RangeEncoder<W> {
    /// Create an encoder over `sink`.
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            low: 0,
            range: u32::MAX,
            cache: 0,
            cache_size: 1,
            written: 0,
        }
    }

    /// Bytes pushed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Emit the oldest byte of `low`, resolving any pending carry.
    ///
    /// While `low` sits in the ambiguous `[0xFF00_0000, 0xFFFF_FFFF]` band
    /// the byte cannot be emitted yet (a later carry could still bump it),
    /// so it is parked in `cache` and `cache_size` counts deferred 0xFF
    /// bytes.
    fn shift_low(&mut self) -> Result<()> {
        if self.low < 0xFF00_0000 || self.low > 0xFFFF_FFFF {
            let carry = (self.low >> 32) as u8;
            let mut byte = self.cache;
            loop {
                self.sink.write_all(&[byte.wrapping_add(carry)])?;
                self.written += 1;
                byte = 0xFF;
                self.cache_size -= 1;
                if self.cache_size == 0 {
                    break;
                }
            }
            self.cache = (self.low >> 24) as u8;
        }
        self.cache_size += 1;
        self.low = (self.low << 8) & 0xFFFF_FFFF;
        Ok(())
    }

    #[inline]
    fn normalize(&mut self) -> Result<()> {
        if self.range < TOP {
            self.range <<= 8;
            self.shift_low()?;
        }
        Ok(())
    }

    /// Encode one bit under an adaptive probability.
    pub fn encode_bit(&mut self, prob: &mut u16, bit: u32) -> Result<()> {
        let bound = (self.range >> PROB_BITS) * (*prob as u32);
        if bit == 0 {
            self.range = bound;
            prob_dec_on_zero(prob);
        } else {
            self.low += bound as u64;
            self.range -= bound;
            prob_inc_on_one(prob);
        }
        self.normalize()
    }

    /// Encode one bit with a fixed 50% split.
    pub fn encode_direct_bit(&mut self, bit: u32) -> Result<()> {
        self.range >>= 1;
        if bit != 0 {
            self.low += self.range as u64;
        }
        self.normalize()
    }

    /// Encode `count` bits of `value`, most significant first, uniformly.
    pub fn encode_direct_bits(&mut self, value: u32, count: u32) -> Result<()> {
        for i in (0..count).rev() {
            self.encode_direct_bit((value >> i) & 1)?;
        }
        Ok(())
    }

    /// Encode `num_bits` of `value` through a bit tree, MSB first.
    pub fn encode_bit_tree(&mut self, probs: &mut [u16], num_bits: u32, value: u32) -> Result<()> {
        let mut node = 1usize;
        for i in (0..num_bits).rev() {
            let bit = (value >> i) & 1;
            self.encode_bit(&mut probs[node], bit)?;
            node = (node << 1) | bit as usize;
        }
        Ok(())
    }

    /// Encode `num_bits` of `value` through a bit tree, LSB first.
    pub fn encode_bit_tree_reverse(
        &mut self,
        probs: &mut [u16],
        num_bits: u32,
        value: u32,
    ) -> Result<()> {
        let mut node = 1usize;
        for i in 0..num_bits {
            let bit = (value >> i) & 1;
            self.encode_bit(&mut probs[node], bit)?;
            node = (node << 1) | bit as usize;
        }
        Ok(())
    }

    /// Flush the five remaining bytes of `low`. The encoder must not be
    /// used afterwards.
    pub fn flush(&mut self) -> Result<()> {
        for _ in 0..5 {
            self.shift_low()?;
        }
        Ok(())
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> Result<W> {
        self.flush()?;
        Ok(self.sink)
    }
}

/// Range decoder pulling from a byte source.
#[derive(Debug)]
pub struct RangeDecoder<R: Read> {
    source: R,
    range: u32,
    code: u32,
}

impl<R: Read> RangeDecoder<R> {
    /// Create a decoder, consuming the five initialization bytes.
    ///
    /// The first stream byte is always zero; anything else means the data
    /// is not a range-coded stream.
    pub fn new(mut source: R) -> Result<Self> {
        let mut init = [0u8; 5];
        source
            .read_exact(&mut init)
            .map_err(|_| FerrozError::unexpected_eof(5))?;
        if init[0] != 0 {
            return Err(FerrozError::corrupted(
                0,
                "range coder stream does not start with a zero byte",
            ));
        }
        let code = u32::from_be_bytes([init[1], init[2], init[3], init[4]]);
        Ok(Self {
            source,
            range: u32::MAX,
            code,
        })
    }

    #[inline]
    fn next_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.source
            .read_exact(&mut buf)
            .map_err(|_| FerrozError::unexpected_eof(1))?;
        Ok(buf[0])
    }

    #[inline]
    fn normalize(&mut self) -> Result<()> {
        if self.range < TOP {
            let byte = self.next_byte()?;
            self.range <<= 8;
            self.code = (self.code << 8) | byte as u32;
        }
        Ok(())
    }

    /// Decode one bit under an adaptive probability.
    pub fn decode_bit(&mut self, prob: &mut u16) -> Result<u32> {
        let bound = (self.range >> PROB_BITS) * (*prob as u32);
        let bit = if self.code < bound {
            self.range = bound;
            prob_dec_on_zero(prob);
            0
        } else {
            self.code -= bound;
            self.range -= bound;
            prob_inc_on_one(prob);
            1
        };
        self.normalize()?;
        Ok(bit)
    }

    /// Decode one uniformly distributed bit.
    pub fn decode_direct_bit(&mut self) -> Result<u32> {
        self.range >>= 1;
        self.code = self.code.wrapping_sub(self.range);
        let negative = (self.code as i32) < 0;
        if negative {
            self.code = self.code.wrapping_add(self.range);
        }
        self.normalize()?;
        Ok(if negative { 0 } else { 1 })
    }

    /// Decode `count` uniformly distributed bits, most significant first.
    pub fn decode_direct_bits(&mut self, count: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.decode_direct_bit()?;
        }
        Ok(value)
    }

    /// Decode `num_bits` through a bit tree, MSB first.
    pub fn decode_bit_tree(&mut self, probs: &mut [u16], num_bits: u32) -> Result<u32> {
        let mut node = 1usize;
        for _ in 0..num_bits {
            let bit = self.decode_bit(&mut probs[node])?;
            node = (node << 1) | bit as usize;
        }
        Ok(node as u32 - (1 << num_bits))
    }

    /// Decode `num_bits` through a bit tree, LSB first.
    pub fn decode_bit_tree_reverse(&mut self, probs: &mut [u16], num_bits: u32) -> Result<u32> {
        let mut node = 1usize;
        let mut value = 0u32;
        for i in 0..num_bits {
            let bit = self.decode_bit(&mut probs[node])?;
            node = (node << 1) | bit as usize;
            value |= bit << i;
        }
        Ok(value)
    }

    /// Whether the code register drained to zero (clean end of stream).
    pub fn is_finished(&self) -> bool {
        self.code == 0
    }

    /// Give back the byte source.
    pub fn into_source(self) -> R {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_prob_constants() {
        assert_eq!(PROB_INIT, 1024);
        assert_eq!(PROB_MAX, 2048);
    }

    #[test]
    fn test_prob_update_bounds() {
        // Repeated one-sided updates converge to the fixed points where the
        // shifted delta underflows to zero; neither end ever saturates.
        let mut prob = PROB_INIT;
        for _ in 0..1000 {
            prob_inc_on_one(&mut prob);
        }
        assert_eq!(prob, 31);

        let mut prob = PROB_INIT;
        for _ in 0..1000 {
            prob_dec_on_zero(&mut prob);
        }
        assert_eq!(prob, 2017);
    }

    #[test]
    fn test_bit_roundtrip() {
        let pattern = [0u32, 1, 0, 1, 1, 1, 0, 0, 1, 0, 1, 1, 0, 0, 0, 1];

        let mut enc = RangeEncoder::new(Vec::new());
        let mut prob = PROB_INIT;
        for &bit in &pattern {
            enc.encode_bit(&mut prob, bit).unwrap();
        }
        let bytes = enc.finish().unwrap();

        let mut dec = RangeDecoder::new(Cursor::new(bytes)).unwrap();
        let mut prob = PROB_INIT;
        for &bit in &pattern {
            assert_eq!(dec.decode_bit(&mut prob).unwrap(), bit);
        }
    }

    #[test]
    fn test_direct_bits_roundtrip() {
        let values = [(0x2Au32, 6), (0x1FFFF, 17), (0, 1), (1, 1), (0xFFFF_FFFF, 32)];

        let mut enc = RangeEncoder::new(Vec::new());
        for &(value, count) in &values {
            enc.encode_direct_bits(value, count).unwrap();
        }
        let bytes = enc.finish().unwrap();

        let mut dec = RangeDecoder::new(Cursor::new(bytes)).unwrap();
        for &(value, count) in &values {
            assert_eq!(dec.decode_direct_bits(count).unwrap(), value);
        }
    }

    #[test]
    fn test_bit_tree_roundtrip() {
        let mut enc = RangeEncoder::new(Vec::new());
        let mut probs = [PROB_INIT; 64];
        let mut rev_probs = [PROB_INIT; 16];
        for symbol in [0u32, 5, 63, 17, 42] {
            enc.encode_bit_tree(&mut probs, 6, symbol).unwrap();
        }
        for symbol in [0u32, 15, 9, 3] {
            enc.encode_bit_tree_reverse(&mut rev_probs, 4, symbol).unwrap();
        }
        let bytes = enc.finish().unwrap();

        let mut dec = RangeDecoder::new(Cursor::new(bytes)).unwrap();
        let mut probs = [PROB_INIT; 64];
        let mut rev_probs = [PROB_INIT; 16];
        for symbol in [0u32, 5, 63, 17, 42] {
            assert_eq!(dec.decode_bit_tree(&mut probs, 6).unwrap(), symbol);
        }
        for symbol in [0u32, 15, 9, 3] {
            assert_eq!(dec.decode_bit_tree_reverse(&mut rev_probs, 4).unwrap(), symbol);
        }
    }

    #[test]
    fn test_decoder_consumes_exactly_what_encoder_wrote() {
        // Mixed workload; the byte counts must match so that chunked
        // framing can account for every packed byte.
        let mut enc = RangeEncoder::new(Vec::new());
        let mut probs = [PROB_INIT; 256];
        for i in 0..1000u32 {
            enc.encode_bit(&mut probs[(i % 251) as usize], i & 1).unwrap();
            if i % 7 == 0 {
                enc.encode_direct_bits(i, 10).unwrap();
            }
        }
        let bytes = enc.finish().unwrap();
        let total = bytes.len() as u64;

        let mut cursor = Cursor::new(bytes);
        let mut dec = RangeDecoder::new(&mut cursor).unwrap();
        let mut probs = [PROB_INIT; 256];
        for i in 0..1000u32 {
            assert_eq!(dec.decode_bit(&mut probs[(i % 251) as usize]).unwrap(), i & 1);
            if i % 7 == 0 {
                assert_eq!(dec.decode_direct_bits(10).unwrap(), i & 0x3FF);
            }
        }
        assert_eq!(cursor.position(), total);
    }

    #[test]
    fn test_truncated_stream_is_detected() {
        let mut enc = RangeEncoder::new(Vec::new());
        let mut prob = PROB_INIT;
        for i in 0..64 {
            enc.encode_bit(&mut prob, i & 1).unwrap();
        }
        let mut bytes = enc.finish().unwrap();
        bytes.truncate(3);

        assert!(RangeDecoder::new(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_nonzero_first_byte_rejected() {
        let err = RangeDecoder::new(Cursor::new(vec![1u8, 0, 0, 0, 0])).unwrap_err();
        assert!(err.is_data_error());
    }
}
