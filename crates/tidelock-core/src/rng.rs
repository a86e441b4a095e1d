//! Seeded, serializable pseudo-random number generator.
//!
//! [`SeededRng`] is the single source of gameplay randomness. It wraps a
//! [`Pcg32`] stream seeded from a `u64`, and counts how many values have been
//! drawn. The whole state (seed, PCG word, call count) is captured by
//! [`RngState`], which round-trips exactly through serde so that snapshots,
//! saves and resyncs continue the same random sequence.
//!
//! # Example
//!
//! ```
//! use tidelock_core::rng::SeededRng;
//!
//! let mut a = SeededRng::new(42);
//! let _ = a.next_f64();
//! let state = a.state();
//!
//! let mut b = SeededRng::new(7);
//! b.set_state(state);
//! assert_eq!(a.next_f64(), b.next_f64());
//! ```

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RngState
// ---------------------------------------------------------------------------

/// Complete serializable state of a [`SeededRng`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    /// The seed the generator was created with.
    pub seed: u64,
    /// The PCG internal word (state + stream increment).
    pub word: Pcg32,
    /// Number of values drawn since seeding.
    pub calls: u64,
}

// ---------------------------------------------------------------------------
// SeededRng
// ---------------------------------------------------------------------------

/// Deterministic PRNG owned by the simulation context.
///
/// There is no global instance. The kernel owns exactly one `SeededRng` and
/// lends it to feature hooks for the duration of a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededRng {
    seed: u64,
    inner: Pcg32,
    calls: u64,
}

impl SeededRng {
    /// Create a generator from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            inner: Pcg32::seed_from_u64(seed),
            calls: 0,
        }
    }

    /// Draw the next value, uniformly distributed in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.calls += 1;
        self.inner.gen::<f64>()
    }

    /// Draw a value uniformly distributed in `[min, max)`.
    ///
    /// Returns `min` if the range is empty.
    pub fn next_range(&mut self, min: f64, max: f64) -> f64 {
        if max <= min {
            return min;
        }
        min + self.next_f64() * (max - min)
    }

    /// Draw an integer uniformly distributed in `[0, bound)`.
    ///
    /// Returns 0 if `bound` is 0.
    pub fn next_below(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        self.calls += 1;
        self.inner.gen_range(0..bound)
    }

    /// The seed this generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of values drawn since seeding.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Capture the complete generator state.
    pub fn state(&self) -> RngState {
        RngState {
            seed: self.seed,
            word: self.inner.clone(),
            calls: self.calls,
        }
    }

    /// Replace the generator state. The next draw continues exactly where
    /// the captured generator left off.
    pub fn set_state(&mut self, state: RngState) {
        self.seed = state.seed;
        self.inner = state.word;
        self.calls = state.calls;
    }

    /// Build a generator directly from a captured state.
    pub fn from_state(state: RngState) -> Self {
        Self {
            seed: state.seed,
            inner: state.word,
            calls: state.calls,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
