//! Multi-threaded match-finder pipeline.
//!
//! Three stages connected by bounded rings:
//!
//! 1. the **hash stage** reads the window, computes the 2/3/4-byte hash
//!    heads for every position and streams them out in fixed-size batches;
//! 2. the **tree stage** owns the suffix-tree arena and turns each batch of
//!    heads into a batch of match lists, packed as counted runs;
//! 3. the **encoder** consumes match lists in position order.
//!
//! The rings are bounded channels, so a stage that runs ahead parks until
//! its consumer drains a batch; batch granularity amortizes the handoff.
//! Because the tree stage executes exactly the code the single-threaded
//! [`Bt4`](super::Bt4) finder runs, the encoder sees identical match lists
//! either way, and therefore produces an identical bitstream.
//!
//! Shutdown is cooperative: dropping the consumer disconnects the rings
//! and both stages unwind on their next send; a cancellation token covers
//! the case where a stage is mid-batch.

use crossbeam_channel::{Receiver, Sender, bounded};
use ferroz_core::CancelToken;
use log::debug;
use std::thread::Scope;

use super::bt4::Bt4Tree;
use super::hash234::{Hash234, HashHeads};
use super::{FinderConfig, MIN_HASHED_BYTES, Matches};

/// Tuning for the pipeline rings.
#[derive(Debug, Clone, Copy)]
pub struct MtConfig {
    /// Positions per batch.
    pub batch: usize,
    /// Batches a ring holds before the producer parks.
    pub ring: usize,
}

impl Default for MtConfig {
    fn default() -> Self {
        Self { batch: 4096, ring: 4 }
    }
}

/// Inputs below this size run single-threaded; the pipeline cannot
/// amortize its batches on less.
pub const MT_MIN_INPUT: usize = 128 * 1024;

/// Match lists for a batch of consecutive positions, packed as counted
/// runs over two flat arrays.
struct MatchBatch {
    counts: Vec<u32>,
    lens: Vec<u32>,
    dists: Vec<u32>,
}

/// Consumer handle owned by the encoder thread.
pub struct MtConsumer {
    rx: Receiver<MatchBatch>,
    batch: Option<MatchBatch>,
    run: usize,
    pair: usize,
    pos: usize,
}

impl MtConsumer {
    /// Match list for the current position; advances to the next.
    pub fn next(&mut self, out: &mut Matches) {
        out.clear();
        self.pos += 1;
        loop {
            match &self.batch {
                Some(batch) if self.run < batch.counts.len() => break,
                _ => {
                    self.run = 0;
                    self.pair = 0;
                    match self.rx.recv() {
                        Ok(batch) => self.batch = Some(batch),
                        // Producer gone: only happens on cancellation; the
                        // encoder checks its token right after.
                        Err(_) => return,
                    }
                }
            }
        }
        let batch = self.batch.as_ref().unwrap();
        let count = batch.counts[self.run] as usize;
        for i in 0..count {
            out.push(batch.lens[self.pair + i], batch.dists[self.pair + i]);
        }
        self.run += 1;
        self.pair += count;
    }

    /// Discard the match lists of the next `n` positions.
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            self.pos += 1;
            loop {
                match &self.batch {
                    Some(batch) if self.run < batch.counts.len() => break,
                    _ => {
                        self.run = 0;
                        self.pair = 0;
                        match self.rx.recv() {
                            Ok(batch) => self.batch = Some(batch),
                            Err(_) => return,
                        }
                    }
                }
            }
            let batch = self.batch.as_ref().unwrap();
            self.pair += batch.counts[self.run] as usize;
            self.run += 1;
        }
    }

    /// The next position `next`/`skip` will consume.
    pub fn pos(&self) -> usize {
        self.pos
    }
}

/// Spawn the hash and tree stages over `buf` inside `scope` and return the
/// encoder-side consumer.
pub fn spawn_pipeline<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    buf: &'env [u8],
    config: FinderConfig,
    mt: MtConfig,
    cancel: CancelToken,
) -> MtConsumer {
    let (hash_tx, hash_rx) = bounded::<Vec<HashHeads>>(mt.ring);
    let (match_tx, match_rx) = bounded::<MatchBatch>(mt.ring);
    debug!(
        "spawning match-finder pipeline: {} bytes, batch {}, ring {}",
        buf.len(),
        mt.batch,
        mt.ring
    );

    let hash_cancel = cancel.clone();
    scope.spawn(move || hash_stage(buf, config, mt, hash_tx, hash_cancel));
    scope.spawn(move || tree_stage(buf, config, hash_rx, match_tx, cancel));

    MtConsumer {
        rx: match_rx,
        batch: None,
        run: 0,
        pair: 0,
        pos: 0,
    }
}

fn hash_stage(
    buf: &[u8],
    config: FinderConfig,
    mt: MtConfig,
    tx: Sender<Vec<HashHeads>>,
    cancel: CancelToken,
) {
    let mut hash = Hash234::new(config.dict_size);
    let mut batch = Vec::with_capacity(mt.batch);
    for pos in 0..buf.len() {
        let heads = if buf.len() - pos >= MIN_HASHED_BYTES {
            hash.lookup_insert(buf, pos)
        } else {
            HashHeads { d2: 0, d3: 0, d4: 0 }
        };
        batch.push(heads);
        if batch.len() == mt.batch {
            if cancel.is_cancelled()
                || tx
                    .send(std::mem::replace(&mut batch, Vec::with_capacity(mt.batch)))
                    .is_err()
            {
                debug!("hash stage stopping early");
                return;
            }
        }
    }
    if !batch.is_empty() {
        let _ = tx.send(batch);
    }
}

fn tree_stage(
    buf: &[u8],
    config: FinderConfig,
    rx: Receiver<Vec<HashHeads>>,
    tx: Sender<MatchBatch>,
    cancel: CancelToken,
) {
    let mut tree = Bt4Tree::new(config);
    let mut scratch = Matches::with_capacity(config.nice_len as usize + 2);
    while let Ok(heads_batch) = rx.recv() {
        let mut out = MatchBatch {
            counts: Vec::with_capacity(heads_batch.len()),
            lens: Vec::new(),
            dists: Vec::new(),
        };
        for heads in heads_batch {
            tree.process(buf, heads, Some(&mut scratch));
            out.counts.push(scratch.count as u32);
            out.lens.extend_from_slice(&scratch.len[..scratch.count]);
            out.dists.extend_from_slice(&scratch.dist[..scratch.count]);
        }
        if cancel.is_cancelled() || tx.send(out).is_err() {
            debug!("tree stage stopping early");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lz::Bt4;

    fn config() -> FinderConfig {
        FinderConfig {
            dict_size: 1 << 16,
            nice_len: 32,
            depth: 0,
        }
    }

    fn test_input() -> Vec<u8> {
        let mut buf = Vec::new();
        let words = [b"alpha ".as_slice(), b"beta ", b"gamma ", b"alpha beta "];
        let mut seed = 0x2545F491u32;
        while buf.len() < 40_000 {
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            buf.extend_from_slice(words[(seed >> 16) as usize % words.len()]);
        }
        buf
    }

    #[test]
    fn test_pipeline_matches_single_threaded_finder() {
        let buf = test_input();
        let cfg = config();
        // Tiny batches force plenty of ring handoffs.
        let mt = MtConfig { batch: 64, ring: 2 };

        let mut st = Bt4::new(cfg);
        let mut st_out = Matches::with_capacity(64);
        let mut mt_out = Matches::with_capacity(64);

        std::thread::scope(|scope| {
            let mut consumer =
                spawn_pipeline(scope, &buf, cfg, mt, CancelToken::new());
            for _ in 0..buf.len() {
                st.find(&buf, &mut st_out);
                consumer.next(&mut mt_out);
                assert_eq!(st_out.count, mt_out.count);
                assert_eq!(st_out.len[..st_out.count], mt_out.len[..mt_out.count]);
                assert_eq!(st_out.dist[..st_out.count], mt_out.dist[..mt_out.count]);
            }
        });
    }

    #[test]
    fn test_pipeline_skip_stays_aligned() {
        let buf = test_input();
        let cfg = config();
        let mt = MtConfig { batch: 128, ring: 2 };

        let mut st = Bt4::new(cfg);
        let mut st_out = Matches::with_capacity(64);
        let mut mt_out = Matches::with_capacity(64);

        std::thread::scope(|scope| {
            let mut consumer =
                spawn_pipeline(scope, &buf, cfg, mt, CancelToken::new());
            let mut pos = 0usize;
            while pos < buf.len() {
                st.find(&buf, &mut st_out);
                consumer.next(&mut mt_out);
                assert_eq!(st_out.dist[..st_out.count], mt_out.dist[..mt_out.count]);
                pos += 1;
                // Jump over whatever the longest match covers, like the
                // encoder does after committing one.
                let jump = st_out.longest().map(|(l, _)| l as usize - 1).unwrap_or(0);
                let jump = jump.min(buf.len() - pos);
                st.skip(&buf, jump);
                consumer.skip(jump);
                pos += jump;
            }
        });
    }

    #[test]
    fn test_cancellation_unwinds_stages() {
        let buf = test_input();
        let cancel = CancelToken::new();
        std::thread::scope(|scope| {
            let mut consumer = spawn_pipeline(
                scope,
                &buf,
                config(),
                MtConfig { batch: 16, ring: 1 },
                cancel.clone(),
            );
            let mut out = Matches::with_capacity(64);
            consumer.next(&mut out);
            cancel.cancel();
            drop(consumer);
            // Scope exit joins both stages; reaching here means they quit.
        });
    }
}
