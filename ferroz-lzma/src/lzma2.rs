//! LZMA2 chunked framing.
//!
//! LZMA2 wraps LZMA in self-delimiting chunks so a stream can reset its
//! dictionary or probability state mid-way and can fall back to storing
//! raw bytes when compression would expand. The encoder here keeps one
//! window and one probability model alive across chunks (each chunk
//! restarts only the range coder, whose output is flushed per chunk) and
//! snapshots the model before each chunk so an expanding chunk can be
//! rolled back and stored raw instead. The decoder enforces that every
//! chunk consumes exactly its declared packed size and produces exactly
//! its declared unpacked size.

use std::io::{Cursor, Read, Write};

use ferroz_core::CancelToken;
use ferroz_core::control::Progress;
use ferroz_core::error::{FerrozError, Result};
use log::debug;

use crate::decoder::{DecodeOutcome, DecoderWindow, LzmaState, decode_core};
use crate::encoder::{BlockEncoder, EncoderOptions, with_match_source};
use crate::lzma2_chunk::{
    ChunkHeader, MAX_CHUNK_PACK, MAX_UNCOMPRESSED_CHUNK, ResetMode, prop_from_dict_size,
    read_chunk_header, write_lzma_header, write_uncompressed_header,
};
use crate::model::LzmaProps;
use crate::range_coder::{RangeDecoder, RangeEncoder};

/// LZMA2 encoder configuration.
#[derive(Debug, Clone)]
pub struct Lzma2Options {
    /// The embedded LZMA encoder options.
    pub lzma: EncoderOptions,
    /// Uncompressed bytes per chunk (4 KiB ..= 64 KiB). The upper bound
    /// keeps the packed size inside its 16-bit header field; the format
    /// allows chunks up to 2 MiB and the decoder accepts them.
    pub chunk_size: usize,
    /// Force a dictionary-reset chunk every this many input bytes.
    /// Resets bound how much history a damaged stream can poison, at some
    /// ratio cost.
    pub dict_reset_interval: Option<u64>,
}

impl Default for Lzma2Options {
    fn default() -> Self {
        Self {
            lzma: EncoderOptions::default(),
            chunk_size: MAX_UNCOMPRESSED_CHUNK,
            dict_reset_interval: None,
        }
    }
}

impl Lzma2Options {
    /// Preset for a compression level (0..=9).
    pub fn from_level(level: u8) -> Self {
        Self {
            lzma: EncoderOptions::from_level(level),
            ..Self::default()
        }
    }

    /// Reject invalid combinations.
    pub fn validate(&self) -> Result<()> {
        self.lzma.validate()?;
        if !(4096..=MAX_UNCOMPRESSED_CHUNK).contains(&self.chunk_size) {
            return Err(FerrozError::invalid_config(format!(
                "chunk_size {} outside 4096..=65536",
                self.chunk_size
            )));
        }
        if let Some(interval) = self.dict_reset_interval {
            if interval == 0 {
                return Err(FerrozError::invalid_config(
                    "dict_reset_interval must be positive",
                ));
            }
        }
        Ok(())
    }
}

/// LZMA2 stream encoder.
pub struct Lzma2Encoder {
    options: Lzma2Options,
}

impl Lzma2Encoder {
    /// Validate `options` and build an encoder.
    pub fn new(options: Lzma2Options) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    /// The one-byte LZMA2 properties (encoded dictionary size).
    pub fn properties(&self) -> [u8; 1] {
        [prop_from_dict_size(self.options.lzma.dict_size)]
    }

    /// Encode `data` as a complete LZMA2 stream, terminator included.
    pub fn encode<W: Write>(&self, data: &[u8], sink: &mut W) -> Result<u64> {
        self.encode_with(data, sink, &CancelToken::new(), None)
    }

    /// Encode with cancellation checks and optional progress reporting at
    /// chunk boundaries.
    pub fn encode_with<W: Write>(
        &self,
        data: &[u8],
        sink: &mut W,
        cancel: &CancelToken,
        progress: Option<Progress<'_>>,
    ) -> Result<u64> {
        let written = self.encode_fragment(data, sink, cancel, progress)?;
        sink.write_all(&[0x00])?;
        Ok(written + 1)
    }

    /// Encode without the trailing terminator, so fragments from several
    /// encoders can be concatenated into one stream.
    pub(crate) fn encode_fragment<W: Write>(
        &self,
        data: &[u8],
        sink: &mut W,
        cancel: &CancelToken,
        mut progress: Option<Progress<'_>>,
    ) -> Result<u64> {
        let interval = self
            .options
            .dict_reset_interval
            .map(|v| v as usize)
            .unwrap_or(usize::MAX);
        let mut written = 0u64;
        let mut start = 0usize;
        while start < data.len() {
            let end = data.len().min(start.saturating_add(interval));
            let segment = &data[start..end];
            written += self.encode_segment(
                segment,
                sink,
                cancel,
                &mut progress,
                start as u64,
                written,
            )?;
            start = end;
        }
        Ok(written)
    }

    /// Encode one dictionary-reset segment.
    fn encode_segment<W: Write>(
        &self,
        segment: &[u8],
        sink: &mut W,
        cancel: &CancelToken,
        progress: &mut Option<Progress<'_>>,
        consumed_base: u64,
        written_base: u64,
    ) -> Result<u64> {
        let options = &self.options;
        let props = options.lzma.props();
        with_match_source(&options.lzma, segment, cancel, |source| {
            let mut block = BlockEncoder::new(segment, &options.lzma, source);
            let mut packed = Vec::with_capacity(MAX_CHUNK_PACK + 16);
            let mut written = 0u64;
            let mut first = true;
            let mut need_state_reset = false;

            while block.pos() < segment.len() {
                cancel.check()?;
                let start = block.pos();
                let chunk_len = options.chunk_size.min(segment.len() - start);

                let reset = if first {
                    ResetMode::StatePropsDict
                } else if need_state_reset {
                    block.reset_state();
                    ResetMode::StateProps
                } else {
                    ResetMode::None
                };

                let snapshot = block.snapshot();
                packed.clear();
                let mut rc = RangeEncoder::new(&mut packed);
                block.encode_to(&mut rc, start + chunk_len)?;
                rc.flush()?;
                drop(rc);

                // A compressed chunk pays up to 6 header bytes against the
                // raw chunk's 3; anything that does not beat that is stored.
                if packed.len() + 3 < chunk_len && packed.len() <= MAX_CHUNK_PACK {
                    written += write_lzma_header(sink, chunk_len, packed.len(), reset, props)?;
                    sink.write_all(&packed)?;
                    written += packed.len() as u64;
                    need_state_reset = false;
                } else {
                    debug!(
                        "chunk at {} stored raw ({} -> {} bytes)",
                        consumed_base + start as u64,
                        chunk_len,
                        packed.len()
                    );
                    block.restore(snapshot);
                    written += write_uncompressed_header(sink, chunk_len, first)?;
                    sink.write_all(&segment[start..start + chunk_len])?;
                    written += chunk_len as u64;
                    need_state_reset = true;
                }
                first = false;

                if let Some(callback) = progress.as_deref_mut() {
                    callback(
                        consumed_base + block.pos() as u64,
                        written_base + written,
                    );
                }
            }
            Ok(written)
        })
    }
}

/// LZMA2 stream decoder.
///
/// Holds the dictionary and probability state across chunks; a single
/// instance decodes one stream and can then be handed the next via
/// [`Lzma2Decoder::reset`].
pub struct Lzma2Decoder {
    dict_size: u32,
    lzma: Option<LzmaState>,
    window: DecoderWindow,
    finished: bool,
}

impl Lzma2Decoder {
    /// Create a decoder with the given dictionary size.
    pub fn new(dict_size: u32) -> Self {
        Self {
            dict_size,
            lzma: None,
            window: DecoderWindow::new(dict_size),
            finished: false,
        }
    }

    /// Whether the stream terminator was seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The dictionary bound this decoder enforces.
    pub fn dict_size(&self) -> u32 {
        self.dict_size
    }

    /// Forget all stream state, ready for a fresh stream.
    pub fn reset(&mut self) {
        self.lzma = None;
        self.window.reset();
        self.finished = false;
    }

    /// Decode a whole stream, stopping right after its terminator byte.
    ///
    /// Bytes past the terminator are not consumed.
    pub fn decode<R: Read>(&mut self, source: &mut R) -> Result<Vec<u8>> {
        self.decode_with(source, &CancelToken::new())
    }

    /// Decode with a cancellation check after every chunk.
    pub fn decode_with<R: Read>(&mut self, source: &mut R, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while !self.finished {
            cancel.check()?;
            self.decode_next(source, &mut out)?;
        }
        Ok(out)
    }

    /// Decode the next chunk, appending its bytes to `out`.
    ///
    /// Returns `false` once the terminator byte has been consumed; calls
    /// after that are no-ops. This is the streaming building block under
    /// [`Lzma2Reader`].
    pub fn decode_next<R: Read>(&mut self, source: &mut R, out: &mut Vec<u8>) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        match read_chunk_header(source)? {
            ChunkHeader::End => {
                self.finished = true;
                return Ok(false);
            }
            ChunkHeader::Uncompressed { reset_dict, size } => {
                self.copy_uncompressed(source, size, reset_dict, out)?;
            }
            ChunkHeader::Lzma {
                reset,
                unpack,
                pack,
                props,
            } => {
                self.decode_chunk(source, reset, unpack, pack, props, out)?;
            }
        }
        Ok(true)
    }

    fn copy_uncompressed<R: Read>(
        &mut self,
        source: &mut R,
        size: usize,
        reset_dict: bool,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if reset_dict {
            self.window.reset();
        }
        let start = out.len();
        out.resize(start + size, 0);
        source
            .read_exact(&mut out[start..])
            .map_err(|_| FerrozError::unexpected_eof(size))?;
        for &byte in &out[start..] {
            self.window.push(byte);
        }
        Ok(())
    }

    fn decode_chunk<R: Read>(
        &mut self,
        source: &mut R,
        reset: ResetMode,
        unpack: usize,
        pack: usize,
        props: Option<LzmaProps>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if reset.resets_dict() {
            self.window.reset();
        }
        // The header parser only yields props when the reset mode carries
        // them, so their presence discriminates the two reset families.
        match props {
            Some(new_props) => match self.lzma.as_mut() {
                Some(state) => state.reset(Some(new_props)),
                None => self.lzma = Some(LzmaState::new(new_props)),
            },
            None => match self.lzma.as_mut() {
                Some(state) => {
                    if reset == ResetMode::State {
                        state.reset(None);
                    }
                }
                None => {
                    return Err(FerrozError::corrupted(
                        self.window.total(),
                        "LZMA2 chunk needs properties before any were set",
                    ));
                }
            },
        }
        let lzma = self.lzma.as_mut().expect("state initialized above");

        let mut packed = vec![0u8; pack];
        source
            .read_exact(&mut packed)
            .map_err(|_| FerrozError::unexpected_eof(pack))?;

        let produced_before = out.len();
        let mut cursor = Cursor::new(packed.as_slice());
        let mut rc = RangeDecoder::new(&mut cursor)?;
        let outcome = decode_core(
            &mut rc,
            lzma,
            &mut self.window,
            out,
            unpack as u64,
        )?;
        let produced = (out.len() - produced_before) as u64;
        if produced != unpack as u64 {
            return Err(FerrozError::size_mismatch(unpack as u64, produced));
        }
        let consumed = cursor.position();
        match outcome {
            // Chunks are length-delimited; a stray end marker is tolerated
            // as long as the sizes agree.
            DecodeOutcome::EndMarker => {
                if consumed > pack as u64 {
                    return Err(FerrozError::size_mismatch(pack as u64, consumed));
                }
            }
            DecodeOutcome::OutputLimit => {
                if consumed != pack as u64 {
                    return Err(FerrozError::size_mismatch(pack as u64, consumed));
                }
            }
        }
        Ok(())
    }
}

/// Streaming [`Read`] adapter over an LZMA2 stream.
///
/// Decodes one chunk at a time on demand, so memory stays bounded by the
/// dictionary plus a single chunk regardless of stream length. Reads
/// return `Ok(0)` once the terminator has been consumed; bytes past it are
/// left in the underlying source.
pub struct Lzma2Reader<R: Read> {
    source: R,
    decoder: Lzma2Decoder,
    buffer: Vec<u8>,
    offset: usize,
}

impl<R: Read> Lzma2Reader<R> {
    /// Create a reader over `source` with the given dictionary size.
    pub fn new(source: R, dict_size: u32) -> Self {
        Self {
            source,
            decoder: Lzma2Decoder::new(dict_size),
            buffer: Vec::new(),
            offset: 0,
        }
    }

    /// Whether the stream terminator was consumed.
    pub fn is_finished(&self) -> bool {
        self.decoder.is_finished() && self.offset == self.buffer.len()
    }

    /// Give back the byte source, positioned right after the terminator if
    /// the stream was read to its end.
    pub fn into_source(self) -> R {
        self.source
    }
}

impl<R: Read> Read for Lzma2Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.offset == self.buffer.len() {
            self.buffer.clear();
            self.offset = 0;
            let more = self
                .decoder
                .decode_next(&mut self.source, &mut self.buffer)
                .map_err(std::io::Error::other)?;
            if !more {
                return Ok(0);
            }
        }
        let n = (self.buffer.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(level: u8) -> Lzma2Options {
        let mut o = Lzma2Options::from_level(level);
        // Small dictionaries keep the tests quick.
        o.lzma.dict_size = 1 << 16;
        o
    }

    fn roundtrip(data: &[u8], o: Lzma2Options) -> (Vec<u8>, Vec<u8>) {
        let encoder = Lzma2Encoder::new(o.clone()).unwrap();
        let mut packed = Vec::new();
        encoder.encode(data, &mut packed).unwrap();
        let mut decoder = Lzma2Decoder::new(o.lzma.dict_size);
        let out = decoder.decode(&mut Cursor::new(&packed)).unwrap();
        (packed, out)
    }

    #[test]
    fn test_empty_stream_is_lone_terminator() {
        let (packed, out) = roundtrip(b"", options(5));
        assert_eq!(packed, vec![0x00]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_small_roundtrip() {
        let data = b"chunked framing around a raw lzma stream";
        let (_, out) = roundtrip(data, options(5));
        assert_eq!(out, data);
    }

    #[test]
    fn test_multi_chunk_roundtrip() {
        let mut data = Vec::new();
        while data.len() < 300_000 {
            let n = data.len();
            data.extend_from_slice(format!("record {n} with shared structure; ").as_bytes());
        }
        let (packed, out) = roundtrip(&data, options(5));
        assert_eq!(out, data);
        assert!(packed.len() < data.len() / 2);
    }

    #[test]
    fn test_incompressible_data_stored_raw() {
        // A pseudo-random chunk cannot shrink; it must be stored and still
        // round-trip.
        let mut data = Vec::with_capacity(100_000);
        let mut x = 0x9E3779B9u32;
        while data.len() < 100_000 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            data.extend_from_slice(&x.to_le_bytes());
        }
        let (packed, out) = roundtrip(&data, options(5));
        assert_eq!(out, data);
        // Overhead stays at the 3-bytes-per-chunk level.
        assert!(packed.len() < data.len() + 64);
    }

    #[test]
    fn test_forced_dict_resets() {
        let mut o = options(5);
        o.dict_reset_interval = Some(1 << 16);
        let data = vec![0x41u8; 200_000];
        let encoder = Lzma2Encoder::new(o.clone()).unwrap();
        let mut packed = Vec::new();
        encoder.encode(&data, &mut packed).unwrap();

        // Count dictionary-reset chunks by walking the headers.
        let mut cursor = Cursor::new(packed.as_slice());
        let mut dict_resets = 0;
        loop {
            match read_chunk_header(&mut cursor).unwrap() {
                ChunkHeader::End => break,
                ChunkHeader::Uncompressed { reset_dict, size } => {
                    if reset_dict {
                        dict_resets += 1;
                    }
                    cursor.set_position(cursor.position() + size as u64);
                }
                ChunkHeader::Lzma { reset, pack, .. } => {
                    if reset.resets_dict() {
                        dict_resets += 1;
                    }
                    cursor.set_position(cursor.position() + pack as u64);
                }
            }
        }
        assert_eq!(dict_resets, 200_000usize.div_ceil(1 << 16));

        let mut decoder = Lzma2Decoder::new(o.lzma.dict_size);
        let out = decoder.decode(&mut Cursor::new(&packed)).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let data = b"self delimiting";
        let encoder = Lzma2Encoder::new(options(5)).unwrap();
        let mut packed = Vec::new();
        encoder.encode(data, &mut packed).unwrap();
        let stream_len = packed.len() as u64;
        packed.extend_from_slice(b"GARBAGE AFTER THE STREAM");

        let mut cursor = Cursor::new(packed.as_slice());
        let mut decoder = Lzma2Decoder::new(1 << 16);
        let out = decoder.decode(&mut cursor).unwrap();
        assert_eq!(out, data);
        assert_eq!(cursor.position(), stream_len);
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_declared_sizes_are_enforced() {
        let data = vec![0x42u8; 5000];
        let encoder = Lzma2Encoder::new(options(5)).unwrap();
        let mut packed = Vec::new();
        encoder.encode(&data, &mut packed).unwrap();

        // Shrink the declared unpack size of the first chunk: the chunk
        // then produces more than declared and must be rejected.
        assert!(packed[0] & 0x80 != 0);
        let declared = (((packed[0] & 0x1F) as usize) << 16)
            | ((packed[1] as usize) << 8)
            | packed[2] as usize;
        let smaller = declared - 1;
        packed[1] = (smaller >> 8) as u8;
        packed[2] = smaller as u8;

        let mut decoder = Lzma2Decoder::new(1 << 16);
        let err = decoder.decode(&mut Cursor::new(&packed)).unwrap_err();
        assert!(err.is_data_error());
    }

    #[test]
    fn test_missing_props_rejected() {
        // A continuation chunk (no reset) arriving first has no properties
        // to decode with.
        let bytes = [0x80u8, 0x00, 0x00, 0x00, 0x00, 0xFF];
        let mut decoder = Lzma2Decoder::new(1 << 16);
        let err = decoder.decode(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(err.is_data_error());
    }

    #[test]
    fn test_reader_streams_in_small_pieces() {
        use std::io::Read;

        let mut data = Vec::new();
        while data.len() < 200_000 {
            let n = data.len();
            data.extend_from_slice(format!("streamed record {n}; ").as_bytes());
        }
        let encoder = Lzma2Encoder::new(options(5)).unwrap();
        let mut packed = Vec::new();
        encoder.encode(&data, &mut packed).unwrap();

        let mut reader = Lzma2Reader::new(Cursor::new(&packed), 1 << 16);
        let mut out = Vec::new();
        let mut piece = [0u8; 977];
        loop {
            let n = reader.read(&mut piece).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&piece[..n]);
        }
        assert_eq!(out, data);
        assert!(reader.is_finished());
    }

    #[test]
    fn test_reader_leaves_trailing_bytes() {
        use std::io::Read;

        let data = b"short stream";
        let encoder = Lzma2Encoder::new(options(5)).unwrap();
        let mut packed = Vec::new();
        encoder.encode(data, &mut packed).unwrap();
        let stream_len = packed.len() as u64;
        packed.extend_from_slice(b"TRAILER");

        let mut reader = Lzma2Reader::new(Cursor::new(&packed), 1 << 16);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.into_source().position(), stream_len);
    }

    #[test]
    fn test_chunk_size_validation() {
        let mut o = options(3);
        o.chunk_size = 1024;
        assert!(Lzma2Encoder::new(o).is_err());
        let mut o = options(3);
        o.dict_reset_interval = Some(0);
        assert!(Lzma2Encoder::new(o).is_err());
    }
}
