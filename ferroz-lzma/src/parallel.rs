//! Block-parallel LZMA2 encoding.
//!
//! Input is split into blocks of at least the dictionary size; each block
//! becomes a self-contained LZMA2 fragment whose first chunk resets the
//! dictionary, so blocks are independent and any LZMA2 decoder can read
//! the concatenation. Workers encode blocks on the rayon pool and the
//! indexed collect reassembles fragments in block order before a single
//! terminator closes the stream.
//!
//! The ratio cost is bounded by one lost window per block boundary;
//! the speedup is bounded by the block count.

use std::io::Write;

use ferroz_core::CancelToken;
use ferroz_core::control::Progress;
use ferroz_core::error::{FerrozError, Result};
use log::debug;
use rayon::prelude::*;

use crate::lzma2::{Lzma2Encoder, Lzma2Options};

/// Parallel encoder configuration.
#[derive(Debug, Clone)]
pub struct ParallelOptions {
    /// Per-block LZMA2 options.
    pub lzma2: Lzma2Options,
    /// Bytes per block; raised to the dictionary size when smaller.
    pub block_size: usize,
    /// Worker threads; `None` uses the rayon default.
    pub threads: Option<usize>,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            lzma2: Lzma2Options::default(),
            block_size: 4 << 20,
            threads: None,
        }
    }
}

impl ParallelOptions {
    /// Preset for a compression level (0..=9).
    pub fn from_level(level: u8) -> Self {
        Self {
            lzma2: Lzma2Options::from_level(level),
            ..Self::default()
        }
    }

    /// The block size actually used: never below the dictionary size, so
    /// a block can fill its whole window.
    pub fn effective_block_size(&self) -> usize {
        self.block_size.max(self.lzma2.lzma.dict_size as usize)
    }

    /// Reject invalid combinations.
    pub fn validate(&self) -> Result<()> {
        self.lzma2.validate()?;
        if self.block_size == 0 {
            return Err(FerrozError::invalid_config("block_size must be positive"));
        }
        if let Some(threads) = self.threads {
            if threads == 0 {
                return Err(FerrozError::invalid_config("threads must be positive"));
            }
        }
        Ok(())
    }
}

/// Encodes independent blocks in parallel into one LZMA2 stream.
pub struct ParallelEncoder {
    options: ParallelOptions,
}

impl ParallelEncoder {
    /// Validate `options` and build an encoder.
    pub fn new(options: ParallelOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    /// The one-byte LZMA2 properties for the produced stream.
    pub fn properties(&self) -> [u8; 1] {
        Lzma2Encoder::new(self.options.lzma2.clone())
            .expect("options validated at construction")
            .properties()
    }

    /// Compress `data` into `sink` as one LZMA2 stream.
    pub fn compress<W: Write>(&self, data: &[u8], sink: &mut W) -> Result<u64> {
        self.compress_with(data, sink, &CancelToken::new(), None)
    }

    /// Compress with cancellation and per-block progress reporting.
    pub fn compress_with<W: Write>(
        &self,
        data: &[u8],
        sink: &mut W,
        cancel: &CancelToken,
        mut progress: Option<Progress<'_>>,
    ) -> Result<u64> {
        let block_size = self.options.effective_block_size();
        let blocks: Vec<&[u8]> = data.chunks(block_size).collect();
        debug!(
            "parallel encode: {} bytes in {} blocks of up to {} bytes",
            data.len(),
            blocks.len(),
            block_size
        );

        let fragments: Vec<Vec<u8>> = match self.options.threads {
            Some(1) => self.encode_serial(&blocks, cancel)?,
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| FerrozError::invalid_config(e.to_string()))?
                .install(|| self.encode_pool(&blocks, cancel))?,
            None => self.encode_pool(&blocks, cancel)?,
        };

        let mut written = 0u64;
        let mut consumed = 0u64;
        for (block, fragment) in blocks.iter().zip(&fragments) {
            sink.write_all(fragment)?;
            written += fragment.len() as u64;
            consumed += block.len() as u64;
            if let Some(callback) = progress.as_deref_mut() {
                callback(consumed, written);
            }
        }
        sink.write_all(&[0x00])?;
        Ok(written + 1)
    }

    fn encode_pool(&self, blocks: &[&[u8]], cancel: &CancelToken) -> Result<Vec<Vec<u8>>> {
        blocks
            .par_iter()
            .map(|block| self.encode_block(block, cancel))
            .collect()
    }

    fn encode_serial(&self, blocks: &[&[u8]], cancel: &CancelToken) -> Result<Vec<Vec<u8>>> {
        blocks
            .iter()
            .map(|block| self.encode_block(block, cancel))
            .collect()
    }

    fn encode_block(&self, block: &[u8], cancel: &CancelToken) -> Result<Vec<u8>> {
        cancel.check()?;
        let encoder = Lzma2Encoder::new(self.options.lzma2.clone())?;
        let mut fragment = Vec::new();
        encoder.encode_fragment(block, &mut fragment, cancel, None)?;
        Ok(fragment)
    }
}
