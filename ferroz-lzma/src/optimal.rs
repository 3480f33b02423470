//! Parsing: turning match candidates into a symbol sequence.
//!
//! Two strategies share one interface. Fast mode takes the longest usable
//! match at each position with a small rep-preference heuristic. Normal
//! mode runs a windowed dynamic program: every reachable lookahead
//! position is a node holding the cheapest known arrival (in 1/16-bit
//! price units), and relaxing literal, short-rep, rep and match edges from
//! left to right yields the cheapest symbol run, which is then replayed to
//! the range coder.
//!
//! The DP window is bounded by the node buffer; when it fills, only a
//! prefix of the backtracked run is committed so decisions near the cut
//! never suffer from the artificial boundary. A match or rep reaching
//! `nice_len` commits immediately instead of growing the window.
//!
//! Cost ties are resolved by strict less-than relaxation, so the earlier
//! computed decision wins.

use std::collections::VecDeque;

use crate::lz::mt::MtConsumer;
use crate::lz::{MatchFinder, Matches};
use crate::model::{LzmaModel, MATCH_LEN_MAX, MATCH_LEN_MIN, State};
use crate::price::{
    DistPrices, LenPrices, bit_price_0, bit_price_1, literal_price, matched_literal_price,
};

/// Upper bound on DP nodes per parse window.
const MAX_OPT_NODES: usize = 4096;

/// Fast mode ignores length-2 matches further away than this.
const SHORT_MATCH_MAX_DIST: u32 = 512;

/// One committed encoder step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Emit the byte at the current position.
    Literal,
    /// Length-1 copy from rep0.
    ShortRep,
    /// Copy through one of the four rep distances.
    Rep {
        /// Which rep slot (0..=3).
        index: usize,
        /// Copy length.
        len: u32,
    },
    /// Copy with an explicitly coded distance (1-based).
    Match {
        /// 1-based distance.
        dist: u32,
        /// Copy length.
        len: u32,
    },
}

impl Decision {
    /// Bytes of input this step consumes.
    pub(crate) fn advance(&self) -> usize {
        match *self {
            Decision::Literal | Decision::ShortRep => 1,
            Decision::Rep { len, .. } | Decision::Match { len, .. } => len as usize,
        }
    }
}

/// Where match lists come from: the in-thread finder or the pipeline.
pub(crate) enum MatchSource {
    St(MatchFinder),
    Mt(MtConsumer),
}

impl MatchSource {
    #[inline]
    fn find(&mut self, buf: &[u8], out: &mut Matches) {
        match self {
            MatchSource::St(f) => f.find(buf, out),
            MatchSource::Mt(c) => c.next(out),
        }
    }

    #[inline]
    fn skip(&mut self, buf: &[u8], n: usize) {
        match self {
            MatchSource::St(f) => f.skip(buf, n),
            MatchSource::Mt(c) => c.skip(n),
        }
    }
}

/// Buffers match lists between the finder and the parser.
///
/// The finder advances monotonically; the DP wants lists for positions it
/// has not committed yet. Lists stay cached until their position is
/// consumed, so nothing is ever searched twice.
pub(crate) struct MatchStream {
    source: MatchSource,
    cache: VecDeque<Matches>,
    pool: Vec<Matches>,
    capacity_hint: usize,
}

impl MatchStream {
    pub(crate) fn new(source: MatchSource, nice_len: usize) -> Self {
        Self {
            source,
            cache: VecDeque::new(),
            pool: Vec::new(),
            capacity_hint: nice_len + 2,
        }
    }

    /// Match list `ahead` positions past the current encode position.
    pub(crate) fn peek(&mut self, buf: &[u8], ahead: usize) -> &Matches {
        while self.cache.len() <= ahead {
            let mut m = self
                .pool
                .pop()
                .unwrap_or_else(|| Matches::with_capacity(self.capacity_hint));
            self.source.find(buf, &mut m);
            self.cache.push_back(m);
        }
        &self.cache[ahead]
    }

    /// Consume `n` positions.
    pub(crate) fn advance(&mut self, buf: &[u8], n: usize) {
        let cached = n.min(self.cache.len());
        for _ in 0..cached {
            self.pool.push(self.cache.pop_front().expect("cached"));
        }
        if n > cached {
            self.source.skip(buf, n - cached);
        }
    }
}

/// How a DP node was reached.
#[derive(Debug, Clone, Copy)]
enum Arrival {
    Start,
    Literal,
    ShortRep,
    Rep { index: u8 },
    Match { dist: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Node {
    price: u32,
    prev: u32,
    arrival: Arrival,
    state: State,
    reps: [u32; 4],
}

const UNREACHED: Node = Node {
    price: u32::MAX,
    prev: 0,
    arrival: Arrival::Start,
    state: State::new(),
    reps: [0; 4],
};

/// Everything a parse step needs to see from the encoder.
pub(crate) struct ParseCtx<'a> {
    pub buf: &'a [u8],
    /// Current encode position.
    pub pos: usize,
    /// Exclusive end of the region the parser may plan over (the chunk
    /// boundary; never past `buf.len()`).
    pub limit: usize,
    pub state: State,
    /// Rep distances as 0-based back values.
    pub reps: [u32; 4],
    pub model: &'a LzmaModel,
}

/// Parsing mode, selected by the encoder options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Greedy single-position decisions.
    Fast,
    /// Price-driven dynamic programming.
    #[default]
    Normal,
}

pub(crate) struct Parser {
    mode: Mode,
    nice_len: usize,
    nodes: Vec<Node>,
    queue: VecDeque<Decision>,
    match_len_prices: LenPrices,
    rep_len_prices: LenPrices,
    dist_prices: DistPrices,
    scratch: Vec<(u32, u32)>,
}

impl Parser {
    pub(crate) fn new(mode: Mode, nice_len: usize, num_pos_states: usize) -> Self {
        let nodes = if mode == Mode::Normal {
            vec![UNREACHED; MAX_OPT_NODES]
        } else {
            Vec::new()
        };
        Self {
            mode,
            nice_len,
            nodes,
            queue: VecDeque::new(),
            match_len_prices: LenPrices::new(num_pos_states),
            rep_len_prices: LenPrices::new(num_pos_states),
            dist_prices: DistPrices::new(),
            scratch: Vec::new(),
        }
    }

    /// Heap memory the DP node buffer occupies.
    pub(crate) fn memory_usage(mode: Mode) -> u64 {
        match mode {
            Mode::Fast => 0,
            Mode::Normal => (MAX_OPT_NODES * size_of::<Node>()) as u64,
        }
    }

    /// Produce the next decision at `ctx.pos`.
    pub(crate) fn next(&mut self, ctx: &ParseCtx<'_>, stream: &mut MatchStream) -> Decision {
        if let Some(d) = self.queue.pop_front() {
            return d;
        }
        match self.mode {
            Mode::Fast => self.parse_fast(ctx, stream),
            Mode::Normal => {
                self.parse_window(ctx, stream);
                self.queue.pop_front().expect("window commits at least one")
            }
        }
    }

    // ---- fast mode -------------------------------------------------------

    fn parse_fast(&mut self, ctx: &ParseCtx<'_>, stream: &mut MatchStream) -> Decision {
        let avail = ctx.limit - ctx.pos;
        let cap = avail.min(MATCH_LEN_MAX);
        let matches = stream.peek(ctx.buf, 0);

        let mut main: Option<(u32, u32)> = None;
        if cap >= MATCH_LEN_MIN {
            for i in (0..matches.count).rev() {
                let len = matches.len[i].min(cap as u32);
                let dist = matches.dist[i];
                if len < MATCH_LEN_MIN as u32 {
                    continue;
                }
                if len == 2 && dist > SHORT_MATCH_MAX_DIST {
                    continue;
                }
                main = Some((len, dist));
                break;
            }
        }

        let mut rep: Option<(u32, usize)> = None;
        for index in 0..4 {
            let delta = ctx.reps[index] as usize + 1;
            if delta > ctx.pos {
                continue;
            }
            let len = common_len(ctx.buf, ctx.pos, delta, cap) as u32;
            if len >= MATCH_LEN_MIN as u32 && rep.is_none_or(|(best, _)| len > best) {
                rep = Some((len, index));
            }
        }

        let decision = match (rep, main) {
            // A rep nearly as long as the best match is cheaper to code.
            (Some((rlen, index)), Some((mlen, _))) if rlen + 1 >= mlen => {
                Decision::Rep { index, len: rlen }
            }
            (_, Some((mlen, mdist))) => Decision::Match {
                dist: mdist,
                len: mlen,
            },
            (Some((rlen, index)), None) => Decision::Rep { index, len: rlen },
            (None, None) => Decision::Literal,
        };
        stream.advance(ctx.buf, decision.advance());
        decision
    }

    // ---- normal mode -----------------------------------------------------

    fn parse_window(&mut self, ctx: &ParseCtx<'_>, stream: &mut MatchStream) {
        let avail = ctx.limit - ctx.pos;
        if avail == 1 {
            self.queue.push_back(Decision::Literal);
            stream.advance(ctx.buf, 1);
            return;
        }

        // Price snapshots for this window.
        self.match_len_prices.rebuild(&ctx.model.match_len);
        self.rep_len_prices.rebuild(&ctx.model.rep_len);
        self.dist_prices.rebuild(&ctx.model.distance);

        let window_end = avail.min(MAX_OPT_NODES - 1);
        self.nodes[0] = Node {
            price: 0,
            prev: 0,
            arrival: Arrival::Start,
            state: ctx.state,
            reps: ctx.reps,
        };
        for node in self.nodes[1..=window_end].iter_mut() {
            *node = UNREACHED;
        }

        let pos_mask = ctx.model.props.pos_mask();
        let mut cut: Option<(usize, Decision)> = None;

        let mut cur = 0usize;
        while cur < window_end {
            let node = self.nodes[cur];
            debug_assert!(node.price != u32::MAX, "literal edges reach every node");
            let pos_cur = ctx.pos + cur;
            let pos_state = pos_cur & pos_mask;
            let st = node.state.index();
            // Candidate lengths stay inside the window and below nice_len;
            // anything at nice_len or longer commits the window instead.
            let cap = (window_end - cur).min(self.nice_len);

            let matches = stream.peek(ctx.buf, cur);
            self.scratch.clear();
            for i in 0..matches.count {
                self.scratch.push((matches.len[i], matches.dist[i]));
            }

            if let Some(&(mlen, mdist)) = self.scratch.last() {
                let usable = (mlen as usize).min(window_end - cur).min(MATCH_LEN_MAX);
                if usable >= self.nice_len && usable >= MATCH_LEN_MIN {
                    cut = Some((
                        cur,
                        Decision::Match {
                            dist: mdist,
                            len: usable as u32,
                        },
                    ));
                    break;
                }
            }

            let match_bit0 = bit_price_0(ctx.model.is_match[st][pos_state]);
            let match_bit1 = bit_price_1(ctx.model.is_match[st][pos_state]);
            let rep_bit0 = bit_price_0(ctx.model.is_rep[st]);
            let rep_bit1 = bit_price_1(ctx.model.is_rep[st]);

            // Literal edge.
            {
                let literal_ctx = literal_context(ctx, pos_cur);
                let probs = &ctx.model.literal.probs[literal_ctx];
                let byte = ctx.buf[pos_cur];
                let lit = if node.state.is_literal() {
                    literal_price(probs, byte)
                } else {
                    let match_byte = ctx.buf[pos_cur - 1 - node.reps[0] as usize];
                    matched_literal_price(probs, byte, match_byte)
                };
                let mut state = node.state;
                state.update_literal();
                self.relax(
                    cur + 1,
                    node.price + match_bit0 + lit,
                    cur,
                    Arrival::Literal,
                    state,
                    node.reps,
                );
            }

            // Short rep edge.
            let rep0_delta = node.reps[0] as usize + 1;
            if rep0_delta <= pos_cur && ctx.buf[pos_cur] == ctx.buf[pos_cur - rep0_delta] {
                let price = node.price
                    + match_bit1
                    + rep_bit1
                    + bit_price_0(ctx.model.is_rep_g0[st])
                    + bit_price_0(ctx.model.is_rep0_long[st][pos_state]);
                let mut state = node.state;
                state.update_short_rep();
                self.relax(cur + 1, price, cur, Arrival::ShortRep, state, node.reps);
            }

            // Rep edges, all lengths.
            let mut rep_cut: Option<(usize, Decision)> = None;
            for index in 0..4usize {
                let delta = node.reps[index] as usize + 1;
                if delta > pos_cur {
                    continue;
                }
                let rep_len = common_len(ctx.buf, pos_cur, delta, (window_end - cur).min(MATCH_LEN_MAX));
                if rep_len >= self.nice_len {
                    rep_cut = Some((
                        cur,
                        Decision::Rep {
                            index,
                            len: rep_len as u32,
                        },
                    ));
                    break;
                }
                let rep_len = rep_len.min(cap);
                if rep_len < MATCH_LEN_MIN {
                    continue;
                }
                let g0 = ctx.model.is_rep_g0[st];
                let prefix = match index {
                    0 => bit_price_0(g0) + bit_price_1(ctx.model.is_rep0_long[st][pos_state]),
                    1 => bit_price_1(g0) + bit_price_0(ctx.model.is_rep_g1[st]),
                    2 => {
                        bit_price_1(g0)
                            + bit_price_1(ctx.model.is_rep_g1[st])
                            + bit_price_0(ctx.model.is_rep_g2[st])
                    }
                    _ => {
                        bit_price_1(g0)
                            + bit_price_1(ctx.model.is_rep_g1[st])
                            + bit_price_1(ctx.model.is_rep_g2[st])
                    }
                };
                let base = node.price + match_bit1 + rep_bit1 + prefix;
                let mut state = node.state;
                state.update_rep();
                let reps = rotate_reps(node.reps, index);
                for len in MATCH_LEN_MIN..=rep_len {
                    let price = base + self.rep_len_prices.price(len as u32, pos_state);
                    self.relax(
                        cur + len,
                        price,
                        cur,
                        Arrival::Rep { index: index as u8 },
                        state,
                        reps,
                    );
                }
            }
            if let Some(c) = rep_cut {
                cut = Some(c);
                break;
            }

            // Match edges: the ascending list gives the nearest distance
            // for every length.
            let match_base = node.price + match_bit1 + rep_bit0;
            let mut prev_len = MATCH_LEN_MIN - 1;
            for i in 0..self.scratch.len() {
                let (mlen, mdist) = self.scratch[i];
                let mlen = (mlen as usize).min(cap);
                if mlen <= prev_len {
                    continue;
                }
                let back = mdist - 1;
                let mut state = node.state;
                state.update_match();
                let reps = [back, node.reps[0], node.reps[1], node.reps[2]];
                for len in (prev_len + 1)..=mlen {
                    let price = match_base
                        + self.match_len_prices.price(len as u32, pos_state)
                        + self.dist_prices.price(back, len as u32);
                    self.relax(cur + len, price, cur, Arrival::Match { dist: mdist }, state, reps);
                }
                prev_len = mlen;
            }

            cur += 1;
        }

        // Replay the cheapest path.
        let (target, tail) = match cut {
            Some((at, decision)) => (at, Some(decision)),
            None => (window_end, None),
        };
        let mut run = Vec::new();
        let mut i = target;
        while i > 0 {
            let node = self.nodes[i];
            let len = (i - node.prev as usize) as u32;
            let decision = match node.arrival {
                Arrival::Literal => Decision::Literal,
                Arrival::ShortRep => Decision::ShortRep,
                Arrival::Rep { index } => Decision::Rep {
                    index: index as usize,
                    len,
                },
                Arrival::Match { dist } => Decision::Match { dist, len },
                Arrival::Start => unreachable!("start node has no incoming edge"),
            };
            run.push(decision);
            i = node.prev as usize;
        }
        run.reverse();
        if let Some(decision) = tail {
            run.push(decision);
        }

        // When the window was cut by the node buffer rather than a real
        // boundary, keep a margin: decisions planned against the artificial
        // edge are recomputed in the next window.
        let mut committed = 0usize;
        let full_window = tail.is_none() && window_end < avail;
        let keep_until = if full_window {
            window_end.saturating_sub(self.nice_len)
        } else {
            usize::MAX
        };
        for decision in run {
            self.queue.push_back(decision);
            committed += decision.advance();
            if committed >= keep_until {
                break;
            }
        }
        debug_assert!(!self.queue.is_empty());
        stream.advance(ctx.buf, committed);
    }

    #[inline]
    #[allow(clippy::too_many_arguments)]
    fn relax(
        &mut self,
        idx: usize,
        price: u32,
        prev: usize,
        arrival: Arrival,
        state: State,
        reps: [u32; 4],
    ) {
        let node = &mut self.nodes[idx];
        if price < node.price {
            *node = Node {
                price,
                prev: prev as u32,
                arrival,
                state,
                reps,
            };
        }
    }
}

/// Length of the common prefix between `pos` and `pos - delta`.
#[inline]
fn common_len(buf: &[u8], pos: usize, delta: usize, cap: usize) -> usize {
    let cap = cap.min(buf.len() - pos);
    let mut len = 0;
    while len < cap && buf[pos + len] == buf[pos - delta + len] {
        len += 1;
    }
    len
}

#[inline]
fn literal_context(ctx: &ParseCtx<'_>, pos: usize) -> usize {
    let prev = if pos > 0 { ctx.buf[pos - 1] } else { 0 };
    ctx.model.literal.context(pos as u64, prev)
}

#[inline]
fn rotate_reps(reps: [u32; 4], index: usize) -> [u32; 4] {
    match index {
        0 => reps,
        1 => [reps[1], reps[0], reps[2], reps[3]],
        2 => [reps[2], reps[0], reps[1], reps[3]],
        _ => [reps[3], reps[0], reps[1], reps[2]],
    }
}
