//! LZMA encoder.
//!
//! The block encoder drives one probability model over one window of input:
//! it asks the parser for decisions, emits them through the range coder and
//! keeps the state machine, rep distances and position context in sync.
//! Raw `.lzma`-style streams wrap it directly; the LZMA2 framer re-enters
//! it chunk by chunk with a fresh range coder each time, which is why the
//! range coder travels as a parameter instead of living inside.

use std::io::Write;

use ferroz_core::CancelToken;
use ferroz_core::error::{FerrozError, Result};
use log::debug;

use crate::lz::mt::{MT_MIN_INPUT, MtConfig, spawn_pipeline};
use crate::lz::{FinderConfig, Hc4, MatchFinder, MfKind};
use crate::model::{
    self, DICT_SIZE_MIN, END_MARKER_DIST, END_POS_MODEL_INDEX, LengthModel, LzmaModel, LzmaProps,
    MATCH_LEN_MIN, State,
};
use crate::optimal::{Decision, MatchSource, MatchStream, Mode, ParseCtx, Parser};
use crate::lz::Bt4;
use crate::range_coder::RangeEncoder;

/// Cancellation is polled every this many input bytes.
const CANCEL_CHECK_INTERVAL: usize = 1 << 17;

/// Encoder configuration.
///
/// `from_level` gives the usual 0..=9 presets; individual fields can be
/// adjusted afterwards and are validated once at encoder construction.
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// Window size in bytes (4 KiB ..= 4 GiB - 1).
    pub dict_size: u32,
    /// Literal context bits.
    pub lc: u32,
    /// Literal position bits.
    pub lp: u32,
    /// Position bits.
    pub pb: u32,
    /// Parsing strategy.
    pub mode: Mode,
    /// Match length that stops searching and parsing (5..=273).
    pub nice_len: u32,
    /// Match finder strategy.
    pub mf: MfKind,
    /// 2 enables the pipelined match finder, 1 keeps everything on the
    /// calling thread.
    pub mt_threads: u32,
    /// Chain/tree traversal bound; 0 picks the finder default.
    pub depth: u32,
}

impl EncoderOptions {
    /// Preset for a compression level (0..=9, clamped).
    pub fn from_level(level: u8) -> Self {
        let level = level.min(9);
        let dict_size = match level {
            0 => 1 << 16,
            1 => 1 << 18,
            2 => 1 << 19,
            3 => 1 << 20,
            4 => 1 << 21,
            5 => 1 << 22,
            6 => 1 << 23,
            7 => 1 << 24,
            8 => 1 << 25,
            _ => 1 << 26,
        };
        let (mode, mf) = if level <= 4 {
            (Mode::Fast, MfKind::Hc4)
        } else {
            (Mode::Normal, MfKind::Bt4)
        };
        let nice_len = match level {
            0..=6 => 32,
            7 | 8 => 64,
            _ => 128,
        };
        Self {
            dict_size,
            lc: 3,
            lp: 0,
            pb: 2,
            mode,
            mf,
            nice_len,
            mt_threads: 1,
            depth: 0,
        }
    }

    /// The literal/position context parameters.
    pub fn props(&self) -> LzmaProps {
        LzmaProps::new(self.lc, self.lp, self.pb)
    }

    /// Reject invalid combinations before any output is produced.
    pub fn validate(&self) -> Result<()> {
        self.props().validate_for_encoding()?;
        if self.dict_size < DICT_SIZE_MIN {
            return Err(FerrozError::invalid_config(format!(
                "dictionary size {} below the 4 KiB minimum",
                self.dict_size
            )));
        }
        if !(5..=273).contains(&self.nice_len) {
            return Err(FerrozError::invalid_config(format!(
                "nice_len {} outside 5..=273",
                self.nice_len
            )));
        }
        if !(1..=2).contains(&self.mt_threads) {
            return Err(FerrozError::invalid_config(format!(
                "mt_threads {} outside 1..=2",
                self.mt_threads
            )));
        }
        Ok(())
    }

    /// Rough bytes of working memory an encoder built from these options
    /// will allocate up front.
    pub fn memory_usage_estimate(&self) -> u64 {
        let finder = match self.mf {
            MfKind::Hc4 => Hc4::memory_usage(self.dict_size),
            MfKind::Bt4 => Bt4::memory_usage(self.dict_size),
        };
        let model = (self.props().num_literal_contexts() * 0x300 * size_of::<u16>()) as u64
            + 16 * 1024;
        finder + model + Parser::memory_usage(self.mode)
    }

    fn finder_config(&self, input_len: usize) -> FinderConfig {
        // The window never needs to exceed the block itself.
        let dict_size = (self.dict_size as u64).min(input_len.max(1) as u64) as u32;
        FinderConfig {
            dict_size: dict_size.max(1),
            nice_len: self.nice_len,
            depth: self.depth,
        }
    }
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self::from_level(6)
    }
}

/// Build a match source for `data` and hand it to `f`.
///
/// With two threads and a big enough input this spans the pipeline threads
/// around the call; otherwise the finder runs inline.
pub(crate) fn with_match_source<T>(
    options: &EncoderOptions,
    data: &[u8],
    cancel: &CancelToken,
    f: impl FnOnce(MatchSource) -> Result<T>,
) -> Result<T> {
    if options.mt_threads >= 2 && options.mf == MfKind::Bt4 && data.len() >= MT_MIN_INPUT {
        std::thread::scope(|scope| {
            let consumer = spawn_pipeline(
                scope,
                data,
                options.finder_config(data.len()),
                MtConfig::default(),
                cancel.clone(),
            );
            f(MatchSource::Mt(consumer))
        })
    } else {
        if options.mt_threads >= 2 {
            debug!(
                "match-finder pipeline unavailable ({} bytes, {:?}), staying single-threaded",
                data.len(),
                options.mf
            );
        }
        let finder = MatchFinder::new(options.mf, options.finder_config(data.len()));
        f(MatchSource::St(finder))
    }
}

/// Encoder state for one window of input.
pub(crate) struct BlockEncoder<'b> {
    buf: &'b [u8],
    pos: usize,
    model: LzmaModel,
    state: State,
    reps: [u32; 4],
    parser: Parser,
    stream: MatchStream,
    pos_mask: usize,
}

/// Snapshot for chunk rollback: the probability model plus coder state.
pub(crate) struct EncoderSnapshot {
    model: LzmaModel,
    state: State,
    reps: [u32; 4],
}

impl<'b> BlockEncoder<'b> {
    pub(crate) fn new(buf: &'b [u8], options: &EncoderOptions, source: MatchSource) -> Self {
        let props = options.props();
        Self {
            buf,
            pos: 0,
            model: LzmaModel::new(props),
            state: State::new(),
            reps: [0; 4],
            parser: Parser::new(options.mode, options.nice_len as usize, props.num_pos_states()),
            stream: MatchStream::new(source, options.nice_len as usize),
            pos_mask: props.pos_mask(),
        }
    }

    /// Position of the next byte to encode.
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn snapshot(&self) -> EncoderSnapshot {
        EncoderSnapshot {
            model: self.model.clone(),
            state: self.state,
            reps: self.reps,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: EncoderSnapshot) {
        self.model = snapshot.model;
        self.state = snapshot.state;
        self.reps = snapshot.reps;
    }

    /// Reset the probability model and coder state (LZMA2 state reset).
    pub(crate) fn reset_state(&mut self) {
        self.model.reset();
        self.state = State::new();
        self.reps = [0; 4];
    }

    /// Encode symbols until the input position reaches `limit`.
    pub(crate) fn encode_to<W: Write>(
        &mut self,
        rc: &mut RangeEncoder<W>,
        limit: usize,
    ) -> Result<()> {
        debug_assert!(limit <= self.buf.len());
        while self.pos < limit {
            let ctx = ParseCtx {
                buf: self.buf,
                pos: self.pos,
                limit,
                state: self.state,
                reps: self.reps,
                model: &self.model,
            };
            let decision = self.parser.next(&ctx, &mut self.stream);
            self.emit(rc, decision)?;
        }
        debug_assert_eq!(self.pos, limit);
        Ok(())
    }

    fn emit<W: Write>(&mut self, rc: &mut RangeEncoder<W>, decision: Decision) -> Result<()> {
        let pos_state = self.pos & self.pos_mask;
        let st = self.state.index();
        match decision {
            Decision::Literal => {
                rc.encode_bit(&mut self.model.is_match[st][pos_state], 0)?;
                self.encode_literal(rc)?;
                self.state.update_literal();
            }
            Decision::ShortRep => {
                debug_assert_eq!(
                    self.buf[self.pos],
                    self.buf[self.pos - 1 - self.reps[0] as usize]
                );
                rc.encode_bit(&mut self.model.is_match[st][pos_state], 1)?;
                rc.encode_bit(&mut self.model.is_rep[st], 1)?;
                rc.encode_bit(&mut self.model.is_rep_g0[st], 0)?;
                rc.encode_bit(&mut self.model.is_rep0_long[st][pos_state], 0)?;
                self.state.update_short_rep();
            }
            Decision::Rep { index, len } => {
                rc.encode_bit(&mut self.model.is_match[st][pos_state], 1)?;
                rc.encode_bit(&mut self.model.is_rep[st], 1)?;
                match index {
                    0 => {
                        rc.encode_bit(&mut self.model.is_rep_g0[st], 0)?;
                        rc.encode_bit(&mut self.model.is_rep0_long[st][pos_state], 1)?;
                    }
                    1 => {
                        rc.encode_bit(&mut self.model.is_rep_g0[st], 1)?;
                        rc.encode_bit(&mut self.model.is_rep_g1[st], 0)?;
                    }
                    2 => {
                        rc.encode_bit(&mut self.model.is_rep_g0[st], 1)?;
                        rc.encode_bit(&mut self.model.is_rep_g1[st], 1)?;
                        rc.encode_bit(&mut self.model.is_rep_g2[st], 0)?;
                    }
                    _ => {
                        rc.encode_bit(&mut self.model.is_rep_g0[st], 1)?;
                        rc.encode_bit(&mut self.model.is_rep_g1[st], 1)?;
                        rc.encode_bit(&mut self.model.is_rep_g2[st], 1)?;
                    }
                }
                let dist = self.reps[index];
                self.reps.copy_within(0..index, 1);
                self.reps[0] = dist;
                encode_length(rc, &mut self.model.rep_len, len, pos_state)?;
                self.state.update_rep();
            }
            Decision::Match { dist, len } => {
                rc.encode_bit(&mut self.model.is_match[st][pos_state], 1)?;
                rc.encode_bit(&mut self.model.is_rep[st], 0)?;
                encode_length(rc, &mut self.model.match_len, len, pos_state)?;
                let back = dist - 1;
                encode_distance(rc, &mut self.model, back, len)?;
                self.reps = [back, self.reps[0], self.reps[1], self.reps[2]];
                self.state.update_match();
            }
        }
        self.pos += decision.advance();
        Ok(())
    }

    fn encode_literal<W: Write>(&mut self, rc: &mut RangeEncoder<W>) -> Result<()> {
        let pos = self.pos;
        let byte = self.buf[pos];
        let prev = if pos > 0 { self.buf[pos - 1] } else { 0 };
        let literal_ctx = self.model.literal.context(pos as u64, prev);
        let probs = &mut self.model.literal.probs[literal_ctx];

        if self.state.is_literal() {
            let mut node = 1usize;
            for i in (0..8usize).rev() {
                let bit = ((byte as usize) >> i) & 1;
                rc.encode_bit(&mut probs[node], bit as u32)?;
                node = (node << 1) | bit;
            }
        } else {
            let match_byte = self.buf[pos - 1 - self.reps[0] as usize];
            let mut node = 1usize;
            let mut diverged = false;
            for i in (0..8usize).rev() {
                let bit = ((byte as usize) >> i) & 1;
                if diverged {
                    rc.encode_bit(&mut probs[node], bit as u32)?;
                } else {
                    let match_bit = ((match_byte as usize) >> i) & 1;
                    rc.encode_bit(&mut probs[0x100 + (match_bit << 8) + node], bit as u32)?;
                    diverged = match_bit != bit;
                }
                node = (node << 1) | bit;
            }
        }
        Ok(())
    }

    /// Emit the six-symbol end marker: a match at the reserved distance.
    pub(crate) fn emit_end_marker<W: Write>(&mut self, rc: &mut RangeEncoder<W>) -> Result<()> {
        let pos_state = self.pos & self.pos_mask;
        let st = self.state.index();
        rc.encode_bit(&mut self.model.is_match[st][pos_state], 1)?;
        rc.encode_bit(&mut self.model.is_rep[st], 0)?;
        encode_length(rc, &mut self.model.match_len, MATCH_LEN_MIN as u32, pos_state)?;
        encode_distance(rc, &mut self.model, END_MARKER_DIST, MATCH_LEN_MIN as u32)?;
        self.state.update_match();
        Ok(())
    }
}

fn encode_length<W: Write>(
    rc: &mut RangeEncoder<W>,
    lengths: &mut LengthModel,
    len: u32,
    pos_state: usize,
) -> Result<()> {
    let mut sym = len as usize - MATCH_LEN_MIN;
    if sym < model::LEN_LOW_SYMBOLS {
        rc.encode_bit(&mut lengths.choice, 0)?;
        rc.encode_bit_tree(&mut lengths.low[pos_state], model::LEN_LOW_BITS, sym as u32)?;
        return Ok(());
    }
    rc.encode_bit(&mut lengths.choice, 1)?;
    sym -= model::LEN_LOW_SYMBOLS;
    if sym < model::LEN_MID_SYMBOLS {
        rc.encode_bit(&mut lengths.choice2, 0)?;
        rc.encode_bit_tree(&mut lengths.mid[pos_state], model::LEN_MID_BITS, sym as u32)?;
        return Ok(());
    }
    rc.encode_bit(&mut lengths.choice2, 1)?;
    sym -= model::LEN_MID_SYMBOLS;
    rc.encode_bit_tree(&mut lengths.high, model::LEN_HIGH_BITS, sym as u32)
}

fn encode_distance<W: Write>(
    rc: &mut RangeEncoder<W>,
    lzma: &mut LzmaModel,
    back: u32,
    len: u32,
) -> Result<()> {
    let ds = model::dist_state(len);
    let slot = model::dist_slot(back);
    rc.encode_bit_tree(&mut lzma.distance.slot[ds], model::DIST_SLOT_BITS, slot)?;
    if slot < 4 {
        return Ok(());
    }

    let footer_bits = (slot >> 1) - 1;
    let base = (2 | (slot & 1)) << footer_bits;
    let reduced = back - base;

    if (slot as usize) < END_POS_MODEL_INDEX {
        let offset = model::spec_offset(slot);
        let mut node = 1usize;
        for i in 0..footer_bits {
            let bit = (reduced >> i) & 1;
            rc.encode_bit(&mut lzma.distance.special[offset + node - 1], bit)?;
            node = (node << 1) | bit as usize;
        }
    } else {
        rc.encode_direct_bits(reduced >> model::DIST_ALIGN_BITS, footer_bits - model::DIST_ALIGN_BITS)?;
        rc.encode_bit_tree_reverse(
            &mut lzma.distance.align,
            model::DIST_ALIGN_BITS,
            reduced & (model::DIST_ALIGN_SIZE as u32 - 1),
        )?;
    }
    Ok(())
}

/// One-shot raw-stream LZMA encoder.
pub struct LzmaEncoder {
    options: EncoderOptions,
}

impl LzmaEncoder {
    /// Validate `options` and build an encoder.
    pub fn new(options: EncoderOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    /// The validated options.
    pub fn options(&self) -> &EncoderOptions {
        &self.options
    }

    /// The five-byte properties header: packed lc/lp/pb, then the
    /// dictionary size little-endian.
    pub fn properties(&self) -> [u8; 5] {
        let mut out = [0u8; 5];
        out[0] = self.options.props().to_byte();
        out[1..5].copy_from_slice(&self.options.dict_size.to_le_bytes());
        out
    }

    /// Compress `data` as one raw LZMA stream into `sink`.
    ///
    /// Returns the number of compressed bytes written. `end_marker`
    /// controls whether the stream is terminated in-band; callers that
    /// transmit the uncompressed size separately can omit it.
    pub fn compress_raw<W: Write>(
        &self,
        data: &[u8],
        sink: &mut W,
        end_marker: bool,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let options = &self.options;
        with_match_source(options, data, cancel, |source| {
            let mut block = BlockEncoder::new(data, options, source);
            let mut rc = RangeEncoder::new(&mut *sink);
            while block.pos() < data.len() {
                cancel.check()?;
                let limit = (block.pos() + CANCEL_CHECK_INTERVAL).min(data.len());
                block.encode_to(&mut rc, limit)?;
            }
            if end_marker {
                block.emit_end_marker(&mut rc)?;
            }
            rc.flush()?;
            Ok(rc.bytes_written())
        })
    }
}
