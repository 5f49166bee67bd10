//! Deterministic pseudo-random source shared by the temporal memory and the connections.
//!
//! The generator wraps ChaCha20 and is fully reproducible:
//! - Two generators built from the same seed yield the same stream.
//! - Serialization stores the seed and the exact stream position, so a restored
//!   generator continues with the very next value the original would have produced.

use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::serialization::Serializable;

/// Seeded pseudo-random number generator.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "RandomState", into = "RandomState")]
pub struct Random {
    rng: ChaCha20Rng,
    seed: u64,
}

/// Persisted form of `Random`: the seed plus the 128-bit word position, split in halves.
#[derive(Serialize, Deserialize)]
struct RandomState {
    seed: u64,
    word_pos_hi: u64,
    word_pos_lo: u64,
}

impl From<Random> for RandomState {
    fn from(random: Random) -> Self {
        let pos = random.rng.get_word_pos();
        RandomState {
            seed: random.seed,
            word_pos_hi: (pos >> 64) as u64,
            word_pos_lo: pos as u64,
        }
    }
}

impl From<RandomState> for Random {
    fn from(state: RandomState) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(state.seed);
        rng.set_word_pos(((state.word_pos_hi as u128) << 64) | state.word_pos_lo as u128);
        Random {
            rng,
            seed: state.seed,
        }
    }
}

impl Random {
    /// Creates a generator from a seed.
    #[inline]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed,
        }
    }

    /// Returns the seed this generator was created with.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn get_uint32(&mut self) -> u32 {
        self.rng.random()
    }

    #[inline]
    pub fn get_uint64(&mut self) -> u64 {
        self.rng.random()
    }

    /// Uniform `f32` in `[0, 1)`.
    #[inline]
    pub fn get_real32(&mut self) -> f32 {
        self.rng.random()
    }

    /// Uniform `f64` in `[0, 1)`.
    #[inline]
    pub fn get_real64(&mut self) -> f64 {
        self.rng.random()
    }

    /// Uniform index in `[0, n)`; returns 0 when `n` is 0.
    #[inline]
    pub fn get_usize(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.rng.random_range(0..n)
    }

    /// Shuffles a slice in place.
    #[inline]
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        slice.shuffle(&mut self.rng);
    }

    /// Picks `k` distinct elements uniformly without replacement.
    ///
    /// - The picked elements keep their relative order from `population`.
    /// - When `k` exceeds the population size, the whole population is returned.
    pub fn sample<T: Copy>(&mut self, population: &[T], k: usize) -> Vec<T> {
        let n = population.len();
        let mut needed = k.min(n);
        let mut chosen = Vec::with_capacity(needed);

        for (i, item) in population.iter().enumerate() {
            if needed == 0 {
                break;
            }
            if self.get_usize(n - i) < needed {
                chosen.push(*item);
                needed -= 1;
            }
        }

        chosen
    }

    /// Fills `values` with uniform samples from `[0, 1)`.
    pub fn initialize_real32_array(&mut self, values: &mut [f32]) {
        for v in values.iter_mut() {
            *v = self.get_real32();
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PartialEq for Random {
    fn eq(&self, other: &Self) -> bool {
        self.seed == other.seed && self.rng.get_word_pos() == other.rng.get_word_pos()
    }
}

impl fmt::Debug for Random {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Random")
            .field("seed", &self.seed)
            .field("word_pos", &self.rng.get_word_pos())
            .finish_non_exhaustive()
    }
}

impl Serializable for Random {}
