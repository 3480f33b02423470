//! LZMA decoder.
//!
//! The symbol loop is the exact mirror of the encoder: the same probability
//! model, the same state transitions, driven by decoded bits instead of
//! parser decisions. It is shared between the raw-stream decoder here and
//! the LZMA2 framer, which re-enters it chunk by chunk with a fresh range
//! decoder while the window and model persist.
//!
//! Decoded history lives in a ring buffer bounded by the dictionary size.
//! The ring grows on demand up to that bound, so declaring a huge
//! dictionary for a small stream does not allocate it all.

use std::io::Read;

use ferroz_core::error::{FerrozError, Result};

use crate::model::{
    self, DICT_SIZE_MIN, END_MARKER_DIST, END_POS_MODEL_INDEX, LengthModel, LzmaModel, LzmaProps,
    MATCH_LEN_MIN, State,
};
use crate::range_coder::RangeDecoder;

/// Why a decode call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The in-band end marker was decoded.
    EndMarker,
    /// The requested number of bytes was produced.
    OutputLimit,
}

/// Ring buffer of decoded history.
#[derive(Debug)]
pub(crate) struct DecoderWindow {
    buf: Vec<u8>,
    pos: usize,
    full: bool,
    dict_size: usize,
    total: u64,
}

impl DecoderWindow {
    pub(crate) fn new(dict_size: u32) -> Self {
        let dict_size = dict_size.max(DICT_SIZE_MIN) as usize;
        Self {
            buf: vec![0; dict_size.min(1 << 16)],
            pos: 0,
            full: false,
            dict_size,
            total: 0,
        }
    }

    /// Forget all history (LZMA2 dictionary reset).
    pub(crate) fn reset(&mut self) {
        self.pos = 0;
        self.full = false;
        self.total = 0;
    }

    /// Bytes produced since the last reset.
    #[inline]
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    /// Bytes of valid back-reference history.
    #[inline]
    pub(crate) fn history(&self) -> u64 {
        if self.full {
            self.dict_size as u64
        } else {
            self.pos as u64
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, byte: u8) {
        if self.pos == self.buf.len() && !self.full {
            if self.buf.len() < self.dict_size {
                let next = (self.buf.len() * 2).min(self.dict_size);
                self.buf.resize(next, 0);
            } else {
                self.full = true;
                self.pos = 0;
            }
        } else if self.pos == self.buf.len() {
            self.pos = 0;
        }
        self.buf[self.pos] = byte;
        self.pos += 1;
        self.total += 1;
    }

    /// The byte `back + 1` positions before the write head.
    #[inline]
    pub(crate) fn byte_back(&self, back: usize) -> u8 {
        debug_assert!((back as u64) < self.history());
        let idx = if self.pos > back {
            self.pos - back - 1
        } else {
            self.buf.len() - (back - self.pos) - 1
        };
        self.buf[idx]
    }
}

/// Probability model plus coder state, persisted across LZMA2 chunks.
#[derive(Debug)]
pub(crate) struct LzmaState {
    pub model: LzmaModel,
    pub state: State,
    pub reps: [u32; 4],
}

impl LzmaState {
    pub(crate) fn new(props: LzmaProps) -> Self {
        Self {
            model: LzmaModel::new(props),
            state: State::new(),
            reps: [0; 4],
        }
    }

    /// LZMA2 state reset, optionally with new properties.
    pub(crate) fn reset(&mut self, props: Option<LzmaProps>) {
        match props {
            Some(p) => self.model.reset_with_props(p),
            None => self.model.reset(),
        }
        self.state = State::new();
        self.reps = [0; 4];
    }
}

fn decode_length<R: Read>(
    rc: &mut RangeDecoder<R>,
    lengths: &mut LengthModel,
    pos_state: usize,
) -> Result<u32> {
    if rc.decode_bit(&mut lengths.choice)? == 0 {
        let sym = rc.decode_bit_tree(&mut lengths.low[pos_state], model::LEN_LOW_BITS)?;
        return Ok(sym + MATCH_LEN_MIN as u32);
    }
    if rc.decode_bit(&mut lengths.choice2)? == 0 {
        let sym = rc.decode_bit_tree(&mut lengths.mid[pos_state], model::LEN_MID_BITS)?;
        return Ok(sym + (MATCH_LEN_MIN + model::LEN_LOW_SYMBOLS) as u32);
    }
    let sym = rc.decode_bit_tree(&mut lengths.high, model::LEN_HIGH_BITS)?;
    Ok(sym + (MATCH_LEN_MIN + model::LEN_LOW_SYMBOLS + model::LEN_MID_SYMBOLS) as u32)
}

fn decode_distance<R: Read>(
    rc: &mut RangeDecoder<R>,
    lzma: &mut LzmaModel,
    len: u32,
) -> Result<u32> {
    let ds = model::dist_state(len);
    let slot = rc.decode_bit_tree(&mut lzma.distance.slot[ds], model::DIST_SLOT_BITS)?;
    if slot < 4 {
        return Ok(slot);
    }

    let footer_bits = (slot >> 1) - 1;
    let mut back = (2 | (slot & 1)) << footer_bits;

    if (slot as usize) < END_POS_MODEL_INDEX {
        let offset = model::spec_offset(slot);
        let mut node = 1usize;
        for i in 0..footer_bits {
            let bit = rc.decode_bit(&mut lzma.distance.special[offset + node - 1])?;
            node = (node << 1) | bit as usize;
            back |= bit << i;
        }
    } else {
        let direct = rc.decode_direct_bits(footer_bits - model::DIST_ALIGN_BITS)?;
        back |= direct << model::DIST_ALIGN_BITS;
        back |= rc.decode_bit_tree_reverse(&mut lzma.distance.align, model::DIST_ALIGN_BITS)?;
    }
    Ok(back)
}

/// Decode symbols until `limit` bytes are produced or the end marker
/// appears.
///
/// The limit is symbol-granular: a match that starts below the limit is
/// copied in full, so the call can overshoot by up to one maximum match
/// length. Length-delimited callers treat overshoot as corruption.
pub(crate) fn decode_core<R: Read>(
    rc: &mut RangeDecoder<R>,
    lzma: &mut LzmaState,
    window: &mut DecoderWindow,
    out: &mut Vec<u8>,
    limit: u64,
) -> Result<DecodeOutcome> {
    let pos_mask = lzma.model.props.pos_mask();
    let mut produced = 0u64;

    while produced < limit {
        let pos_state = (window.total() & pos_mask as u64) as usize;
        let st = lzma.state.index();

        if rc.decode_bit(&mut lzma.model.is_match[st][pos_state])? == 0 {
            let byte = decode_literal(rc, lzma, window)?;
            window.push(byte);
            out.push(byte);
            produced += 1;
            lzma.state.update_literal();
            continue;
        }

        let (back, len) = if rc.decode_bit(&mut lzma.model.is_rep[st])? == 0 {
            let len = decode_length(rc, &mut lzma.model.match_len, pos_state)?;
            let back = decode_distance(rc, &mut lzma.model, len)?;
            if back == END_MARKER_DIST {
                return Ok(DecodeOutcome::EndMarker);
            }
            lzma.reps = [back, lzma.reps[0], lzma.reps[1], lzma.reps[2]];
            lzma.state.update_match();
            (back, len)
        } else if rc.decode_bit(&mut lzma.model.is_rep_g0[st])? == 0 {
            if rc.decode_bit(&mut lzma.model.is_rep0_long[st][pos_state])? == 0 {
                // Short rep: a single byte from rep0.
                let back = lzma.reps[0];
                if back as u64 >= window.history() {
                    return Err(FerrozError::invalid_distance(
                        back as u64 + 1,
                        window.history(),
                    ));
                }
                let byte = window.byte_back(back as usize);
                window.push(byte);
                out.push(byte);
                produced += 1;
                lzma.state.update_short_rep();
                continue;
            }
            let len = decode_length(rc, &mut lzma.model.rep_len, pos_state)?;
            lzma.state.update_rep();
            (lzma.reps[0], len)
        } else {
            let back = if rc.decode_bit(&mut lzma.model.is_rep_g1[st])? == 0 {
                let b = lzma.reps[1];
                lzma.reps[1] = lzma.reps[0];
                b
            } else if rc.decode_bit(&mut lzma.model.is_rep_g2[st])? == 0 {
                let b = lzma.reps[2];
                lzma.reps[2] = lzma.reps[1];
                lzma.reps[1] = lzma.reps[0];
                b
            } else {
                let b = lzma.reps[3];
                lzma.reps[3] = lzma.reps[2];
                lzma.reps[2] = lzma.reps[1];
                lzma.reps[1] = lzma.reps[0];
                b
            };
            lzma.reps[0] = back;
            let len = decode_length(rc, &mut lzma.model.rep_len, pos_state)?;
            lzma.state.update_rep();
            (back, len)
        };

        if back as u64 >= window.history() {
            return Err(FerrozError::invalid_distance(
                back as u64 + 1,
                window.history(),
            ));
        }
        // Byte-by-byte: source and destination overlap whenever the
        // distance is shorter than the length.
        for _ in 0..len {
            let byte = window.byte_back(back as usize);
            window.push(byte);
            out.push(byte);
        }
        produced += len as u64;
    }

    Ok(DecodeOutcome::OutputLimit)
}

fn decode_literal<R: Read>(
    rc: &mut RangeDecoder<R>,
    lzma: &mut LzmaState,
    window: &DecoderWindow,
) -> Result<u8> {
    let prev = if window.total() > 0 {
        window.byte_back(0)
    } else {
        0
    };
    let literal_ctx = lzma.model.literal.context(window.total(), prev);
    let probs = &mut lzma.model.literal.probs[literal_ctx];

    let mut node = 1usize;
    if lzma.state.is_literal() {
        while node < 0x100 {
            let bit = rc.decode_bit(&mut probs[node])?;
            node = (node << 1) | bit as usize;
        }
    } else {
        if lzma.reps[0] as u64 >= window.history() {
            return Err(FerrozError::corrupted(
                window.total(),
                "matched literal with no history at its distance",
            ));
        }
        let mut match_byte = window.byte_back(lzma.reps[0] as usize) as usize;
        while node < 0x100 {
            let match_bit = (match_byte >> 7) & 1;
            match_byte = (match_byte << 1) & 0xFF;
            let bit = rc.decode_bit(&mut probs[0x100 + (match_bit << 8) + node])? as usize;
            node = (node << 1) | bit;
            if bit != match_bit {
                while node < 0x100 {
                    let bit = rc.decode_bit(&mut probs[node])?;
                    node = (node << 1) | bit as usize;
                }
                break;
            }
        }
    }
    Ok((node - 0x100) as u8)
}

/// Raw-stream LZMA decoder.
#[derive(Debug)]
pub struct LzmaDecoder<R: Read> {
    rc: RangeDecoder<R>,
    lzma: LzmaState,
    window: DecoderWindow,
    unpacked_size: Option<u64>,
    produced: u64,
    finished: bool,
}

impl<R: Read> LzmaDecoder<R> {
    /// Decode a headerless stream with known parameters.
    ///
    /// Dictionary sizes below 4 KiB are rounded up, per the format.
    pub fn new(source: R, props: LzmaProps, dict_size: u32) -> Result<Self> {
        Ok(Self {
            rc: RangeDecoder::new(source)?,
            lzma: LzmaState::new(props),
            window: DecoderWindow::new(dict_size),
            unpacked_size: None,
            produced: 0,
            finished: false,
        })
    }

    /// Parse the 13-byte `.lzma` header (5 properties bytes, 8-byte
    /// little-endian uncompressed size) and build a decoder.
    pub fn with_header(mut source: R) -> Result<Self> {
        let mut header = [0u8; 13];
        source
            .read_exact(&mut header)
            .map_err(|_| FerrozError::unexpected_eof(13))?;
        let props = LzmaProps::from_byte(header[0])?;
        let dict_size = u32::from_le_bytes(header[1..5].try_into().expect("4 bytes"));
        let unpacked = u64::from_le_bytes(header[5..13].try_into().expect("8 bytes"));

        let mut decoder = Self::new(source, props, dict_size)?;
        if unpacked != u64::MAX {
            decoder.unpacked_size = Some(unpacked);
        }
        Ok(decoder)
    }

    /// Expected number of output bytes, when the header carried one.
    pub fn unpacked_size(&self) -> Option<u64> {
        self.unpacked_size
    }

    /// Decode up to `max` more bytes into `out`.
    ///
    /// Returns the byte count produced by this call and why it stopped.
    /// The cap is symbol-granular; a match crossing it is copied whole.
    pub fn decode_into(&mut self, out: &mut Vec<u8>, max: u64) -> Result<(u64, DecodeOutcome)> {
        if self.finished {
            return Ok((0, DecodeOutcome::EndMarker));
        }
        let before = out.len() as u64;
        let limit = match self.unpacked_size {
            Some(size) => max.min(size - self.produced),
            None => max,
        };
        let outcome = decode_core(&mut self.rc, &mut self.lzma, &mut self.window, out, limit)?;
        let produced = out.len() as u64 - before;
        self.produced += produced;
        if outcome == DecodeOutcome::EndMarker {
            self.finished = true;
            if let Some(size) = self.unpacked_size {
                if self.produced != size {
                    return Err(FerrozError::size_mismatch(size, self.produced));
                }
            }
        }
        Ok((produced, outcome))
    }

    /// Decode the remainder of the stream.
    ///
    /// With a size-carrying header this stops exactly at that size;
    /// otherwise it runs to the end marker.
    pub fn decode_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self.unpacked_size {
            Some(size) => {
                let (produced, _) = self.decode_into(&mut out, size)?;
                if produced < size && !self.finished {
                    return Err(FerrozError::size_mismatch(size, produced));
                }
                if out.len() as u64 != size {
                    return Err(FerrozError::size_mismatch(size, out.len() as u64));
                }
            }
            None => loop {
                let (_, outcome) = self.decode_into(&mut out, 1 << 20)?;
                if outcome == DecodeOutcome::EndMarker {
                    break;
                }
            },
        }
        Ok(out)
    }

    /// Give back the byte source.
    pub fn into_source(self) -> R {
        self.rc.into_source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_window_linear_then_wraps() {
        let mut w = DecoderWindow::new(4096);
        for i in 0..4096u32 {
            w.push((i % 251) as u8);
        }
        assert_eq!(w.history(), 4096);
        assert_eq!(w.byte_back(0), (4095 % 251) as u8);
        assert_eq!(w.byte_back(4095), 0);
        // Wrap: the oldest byte is gone, history stays at dict size.
        w.push(0xEE);
        assert_eq!(w.history(), 4096);
        assert_eq!(w.byte_back(0), 0xEE);
        assert_eq!(w.total(), 4097);
    }

    #[test]
    fn test_window_grows_lazily() {
        let mut w = DecoderWindow::new(1 << 24);
        assert!(w.buf.len() <= 1 << 16);
        for _ in 0..(1 << 17) {
            w.push(0xAB);
        }
        assert!(w.buf.len() >= 1 << 17);
        assert!(w.buf.len() < 1 << 24);
        assert_eq!(w.byte_back((1 << 17) - 1), 0xAB);
    }

    #[test]
    fn test_window_reset_clears_history() {
        let mut w = DecoderWindow::new(4096);
        w.push(1);
        w.push(2);
        w.reset();
        assert_eq!(w.history(), 0);
        assert_eq!(w.total(), 0);
    }

    #[test]
    fn test_rounds_tiny_dict_up() {
        let w = DecoderWindow::new(16);
        assert_eq!(w.dict_size, DICT_SIZE_MIN as usize);
    }

    #[test]
    fn test_garbage_stream_is_rejected_not_panicking() {
        // A stream of 0xFF after a valid init cannot produce valid
        // distances for long; expect a data error, never a panic.
        let mut data = vec![0u8; 5];
        data.extend(std::iter::repeat(0xFF).take(64));
        let mut dec =
            LzmaDecoder::new(Cursor::new(data), LzmaProps::default(), 1 << 16).unwrap();
        let mut out = Vec::new();
        let result = dec.decode_into(&mut out, 1 << 16);
        match result {
            Ok((_, outcome)) => assert_eq!(outcome, DecodeOutcome::EndMarker),
            Err(e) => assert!(e.is_data_error(), "unexpected error kind: {e}"),
        }
    }

    #[test]
    fn test_header_with_unknown_size() {
        let mut header = vec![0x5D, 0x00, 0x10, 0x00, 0x00];
        header.extend_from_slice(&u64::MAX.to_le_bytes());
        header.extend_from_slice(&[0u8; 5]);
        let dec = LzmaDecoder::with_header(Cursor::new(header)).unwrap();
        assert_eq!(dec.unpacked_size(), None);
    }

    #[test]
    fn test_header_too_short() {
        let err = LzmaDecoder::with_header(Cursor::new(vec![0x5D, 0x00])).unwrap_err();
        assert!(matches!(err, FerrozError::UnexpectedEof { .. }));
    }
}
