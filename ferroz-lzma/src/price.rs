//! Bit-price tables for encoding decisions.
//!
//! The optimal parser compares alternatives by their cost in 1/16-bit
//! units. Prices for adaptive bits come from a 128-entry table holding
//! `-log2(p / 2048)` at fixed precision, computed at compile time with the
//! classic repeated-squaring recurrence. On top of that sit cached
//! per-length and per-distance tables that the parser rebuilds at every
//! parse window so prices track probability drift.

use crate::model::{
    self, DIST_ALIGN_BITS, DIST_ALIGN_SIZE, DIST_SLOTS, DIST_SLOT_BITS, DIST_STATES,
    END_POS_MODEL_INDEX, FULL_DISTANCES, LEN_HIGH_BITS, LEN_LOW_BITS, LEN_LOW_SYMBOLS,
    LEN_MID_BITS, LEN_MID_SYMBOLS, LEN_SYMBOLS, LengthModel, MATCH_LEN_MIN,
};
use crate::range_coder::{PROB_BITS, PROB_MAX};

/// Price resolution: one bit costs `1 << PRICE_SHIFT` units.
pub const PRICE_SHIFT: u32 = 4;

/// Probability values are quantized to this many price-table buckets.
const MOVE_REDUCING_BITS: u32 = 4;

const PRICE_TABLE_SIZE: usize = (PROB_MAX >> MOVE_REDUCING_BITS) as usize;

/// `PROB_PRICES[p >> 4]` is the cost of coding the zero bit when the
/// probability is `p`, in 1/16-bit units.
static PROB_PRICES: [u32; PRICE_TABLE_SIZE] = build_prob_prices();

const fn build_prob_prices() -> [u32; PRICE_TABLE_SIZE] {
    let mut prices = [0u32; PRICE_TABLE_SIZE];
    let mut i = (1usize << MOVE_REDUCING_BITS) / 2;
    while i < PROB_MAX as usize {
        // Square the scaled probability PRICE_SHIFT times, counting the
        // overflows past 16 bits; the count approximates -log2 at the
        // table's fixed precision.
        let mut w = i as u32;
        let mut bit_count = 0u32;
        let mut j = 0;
        while j < PRICE_SHIFT {
            w = w.wrapping_mul(w);
            bit_count <<= 1;
            while w >= 1 << 16 {
                w >>= 1;
                bit_count += 1;
            }
            j += 1;
        }
        prices[i >> MOVE_REDUCING_BITS] = (PROB_BITS << PRICE_SHIFT) - 15 - bit_count;
        i += 1 << MOVE_REDUCING_BITS;
    }
    prices
}

/// Cost of coding `bit` under probability `prob`.
#[inline]
pub fn bit_price(prob: u16, bit: u32) -> u32 {
    let p = if bit == 0 { prob } else { PROB_MAX - prob };
    PROB_PRICES[(p >> MOVE_REDUCING_BITS) as usize]
}

/// Cost of coding the zero side of `prob`.
#[inline]
pub fn bit_price_0(prob: u16) -> u32 {
    PROB_PRICES[(prob >> MOVE_REDUCING_BITS) as usize]
}

/// Cost of coding the one side of `prob`.
#[inline]
pub fn bit_price_1(prob: u16) -> u32 {
    PROB_PRICES[((PROB_MAX - prob) >> MOVE_REDUCING_BITS) as usize]
}

/// Cost of `count` uniformly coded bits.
#[inline]
pub fn direct_bits_price(count: u32) -> u32 {
    count << PRICE_SHIFT
}

/// Cost of coding `symbol` through a bit tree, MSB first.
pub fn tree_price(probs: &[u16], num_bits: u32, symbol: u32) -> u32 {
    let mut price = 0;
    let mut node = 1usize;
    for i in (0..num_bits).rev() {
        let bit = (symbol >> i) & 1;
        price += bit_price(probs[node], bit);
        node = (node << 1) | bit as usize;
    }
    price
}

/// Cost of coding `symbol` through a bit tree, LSB first.
pub fn reverse_tree_price(probs: &[u16], num_bits: u32, symbol: u32) -> u32 {
    let mut price = 0;
    let mut node = 1usize;
    for i in 0..num_bits {
        let bit = (symbol >> i) & 1;
        price += bit_price(probs[node], bit);
        node = (node << 1) | bit as usize;
    }
    price
}

/// Cached per-length prices for one [`LengthModel`].
#[derive(Debug)]
pub struct LenPrices {
    prices: Vec<[u32; LEN_SYMBOLS]>,
}

impl LenPrices {
    /// Create an empty cache sized for `num_pos_states`.
    pub fn new(num_pos_states: usize) -> Self {
        Self {
            prices: vec![[0; LEN_SYMBOLS]; num_pos_states],
        }
    }

    /// Rebuild from the current model probabilities.
    pub fn rebuild(&mut self, model: &LengthModel) {
        let choice0 = bit_price_0(model.choice);
        let choice1 = bit_price_1(model.choice);
        let choice2_0 = choice1 + bit_price_0(model.choice2);
        let choice2_1 = choice1 + bit_price_1(model.choice2);

        for (pos_state, row) in self.prices.iter_mut().enumerate() {
            for sym in 0..LEN_LOW_SYMBOLS {
                row[sym] = choice0 + tree_price(&model.low[pos_state], LEN_LOW_BITS, sym as u32);
            }
            for sym in 0..LEN_MID_SYMBOLS {
                row[LEN_LOW_SYMBOLS + sym] =
                    choice2_0 + tree_price(&model.mid[pos_state], LEN_MID_BITS, sym as u32);
            }
        }
        // The high tree is not position-state indexed; compute once.
        let base = LEN_LOW_SYMBOLS + LEN_MID_SYMBOLS;
        for sym in 0..(LEN_SYMBOLS - base) {
            let price = choice2_1 + tree_price(&model.high, LEN_HIGH_BITS, sym as u32);
            for row in &mut self.prices {
                row[base + sym] = price;
            }
        }
    }

    /// Price of length `len` (2..=273) in position state `pos_state`.
    #[inline]
    pub fn price(&self, len: u32, pos_state: usize) -> u32 {
        self.prices[pos_state][len as usize - MATCH_LEN_MIN]
    }
}

/// Cached distance prices, rebuilt alongside [`LenPrices`].
#[derive(Debug)]
pub struct DistPrices {
    slot: [[u32; DIST_SLOTS]; DIST_STATES],
    full: [[u32; FULL_DISTANCES]; DIST_STATES],
    align: [u32; DIST_ALIGN_SIZE],
}

impl DistPrices {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            slot: [[0; DIST_SLOTS]; DIST_STATES],
            full: [[0; FULL_DISTANCES]; DIST_STATES],
            align: [0; DIST_ALIGN_SIZE],
        }
    }

    /// Rebuild from the current model probabilities.
    pub fn rebuild(&mut self, model: &crate::model::DistanceModel) {
        for ds in 0..DIST_STATES {
            for slot in 0..DIST_SLOTS {
                let mut price = tree_price(&model.slot[ds], DIST_SLOT_BITS, slot as u32);
                // Slots past the special range pay their direct bits here,
                // so lookups only add the align price.
                if slot >= END_POS_MODEL_INDEX {
                    price += direct_bits_price((slot as u32 >> 1) - 1 - DIST_ALIGN_BITS);
                }
                self.slot[ds][slot] = price;
            }
            for dist in 0..DIST_STATES as u32 {
                self.full[ds][dist as usize] = self.slot[ds][dist as usize];
            }
            // Mid-range distances: slot plus the reverse-coded special bits.
            for dist in DIST_STATES as u32..FULL_DISTANCES as u32 {
                let slot = model::dist_slot(dist);
                let footer_bits = (slot >> 1) - 1;
                let base = (2 | (slot & 1)) << footer_bits;
                let offset = model::spec_offset(slot);
                let reduced = dist - base;

                let mut price = self.slot[ds][slot as usize];
                let mut node = 1usize;
                for i in 0..footer_bits {
                    let bit = (reduced >> i) & 1;
                    price += bit_price(model.special[offset + node - 1], bit);
                    node = (node << 1) | bit as usize;
                }
                self.full[ds][dist as usize] = price;
            }
        }
        for align in 0..DIST_ALIGN_SIZE as u32 {
            self.align[align as usize] = reverse_tree_price(&model.align, DIST_ALIGN_BITS, align);
        }
    }

    /// Price of a 0-based distance for a match of length `len`.
    #[inline]
    pub fn price(&self, dist: u32, len: u32) -> u32 {
        let ds = model::dist_state(len);
        if (dist as usize) < FULL_DISTANCES {
            self.full[ds][dist as usize]
        } else {
            self.slot[ds][model::dist_slot(dist) as usize]
                + self.align[(dist & (DIST_ALIGN_SIZE as u32 - 1)) as usize]
        }
    }
}

impl Default for DistPrices {
    fn default() -> Self {
        Self::new()
    }
}

/// Cost of coding a literal byte through the plain bit-tree coder.
pub fn literal_price(probs: &[u16; 0x300], byte: u8) -> u32 {
    let mut price = 0;
    let mut node = 1usize;
    for i in (0..8usize).rev() {
        let bit = ((byte as usize) >> i) & 1;
        price += bit_price(probs[node], bit as u32);
        node = (node << 1) | bit;
    }
    price
}

/// Cost of coding a literal under the matched-literal coder, where bits are
/// contexted by the byte at the last match distance until they diverge.
pub fn matched_literal_price(probs: &[u16; 0x300], byte: u8, match_byte: u8) -> u32 {
    let mut price = 0;
    let mut node = 1usize;
    for i in (0..8usize).rev() {
        let match_bit = ((match_byte as usize) >> i) & 1;
        let bit = ((byte as usize) >> i) & 1;
        price += bit_price(probs[0x100 + (match_bit << 8) + node], bit as u32);
        node = (node << 1) | bit;
        if match_bit != bit {
            // Diverged; the rest goes through the plain tree.
            for j in (0..i).rev() {
                let bit = ((byte as usize) >> j) & 1;
                price += bit_price(probs[node], bit as u32);
                node = (node << 1) | bit;
            }
            break;
        }
    }
    price
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DistanceModel;
    use crate::range_coder::PROB_INIT;

    #[test]
    fn test_even_probability_costs_one_bit() {
        let price = bit_price(PROB_INIT, 0);
        assert_eq!(price, 1 << PRICE_SHIFT);
        assert_eq!(bit_price(PROB_INIT, 1), price);
    }

    #[test]
    fn test_skewed_probability_is_cheaper_on_likely_side() {
        let mut prob = PROB_INIT;
        for _ in 0..50 {
            crate::range_coder::prob_dec_on_zero(&mut prob);
        }
        assert!(bit_price(prob, 0) < 1 << PRICE_SHIFT);
        assert!(bit_price(prob, 1) > 1 << PRICE_SHIFT);
    }

    #[test]
    fn test_prices_fall_as_probability_rises() {
        let mut last = u32::MAX;
        for bucket in 1..PRICE_TABLE_SIZE {
            let prob = (bucket << MOVE_REDUCING_BITS) as u16;
            let price = bit_price(prob, 0);
            assert!(price <= last);
            last = price;
        }
    }

    #[test]
    fn test_tree_price_matches_bit_sum() {
        // All probabilities even: a symbol costs exactly its bit count.
        let probs = [PROB_INIT; 64];
        assert_eq!(tree_price(&probs, 6, 33), 6 << PRICE_SHIFT);
        assert_eq!(reverse_tree_price(&probs[..16], 4, 9), 4 << PRICE_SHIFT);
    }

    #[test]
    fn test_len_prices_cover_all_lengths() {
        let model = LengthModel::new();
        let mut prices = LenPrices::new(4);
        prices.rebuild(&model);
        // The tiers step upward with the extra choice bits and tree depth.
        let low = prices.price(2, 0);
        let mid = prices.price(12, 0);
        let high = prices.price(200, 0);
        assert!(low < mid && mid < high);
        for len in MATCH_LEN_MIN as u32..=crate::model::MATCH_LEN_MAX as u32 {
            assert!(prices.price(len, 3) > 0);
        }
    }

    #[test]
    fn test_dist_prices_grow_with_distance() {
        let model = DistanceModel::new();
        let mut prices = DistPrices::new();
        prices.rebuild(&model);
        assert!(prices.price(0, 2) < prices.price(100, 2));
        assert!(prices.price(100, 2) < prices.price(1 << 20, 2));
    }

    #[test]
    fn test_dist_price_matches_explicit_tree_walk() {
        // Fresh model, mid-range distance: slot tree (6 bits) plus the
        // reverse special tree (footer bits), all at even probability.
        let model = DistanceModel::new();
        let mut prices = DistPrices::new();
        prices.rebuild(&model);
        let dist = 100u32;
        let slot = crate::model::dist_slot(dist);
        let footer_bits = (slot >> 1) - 1;
        assert_eq!(
            prices.price(dist, 2),
            (6 + footer_bits) << PRICE_SHIFT
        );
    }

    #[test]
    fn test_literal_price_even_probs() {
        let probs = [PROB_INIT; 0x300];
        assert_eq!(literal_price(&probs, 0xA5), 8 << PRICE_SHIFT);
        assert_eq!(matched_literal_price(&probs, 0xA5, 0xA5), 8 << PRICE_SHIFT);
        assert_eq!(matched_literal_price(&probs, 0xA5, 0x5A), 8 << PRICE_SHIFT);
    }
}
