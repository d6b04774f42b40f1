//! Deterministic parameter initialisation and the Adagrad update rule.

use std::num::Wrapping;

/// Linear congruential generator with glibc constants, so weight
/// initialisation is identical across platforms and runs.
#[derive(Clone, Debug)]
pub struct LcgRng {
    state: Wrapping<i64>,
}

impl LcgRng {
    const MULTIPLIER: i64 = 1103515245;
    const INCREMENT: i64 = 12345;
    const MODULUS: i64 = 1 << 31;

    pub fn new(seed: i64) -> Self {
        Self {
            state: Wrapping(seed.wrapping_abs() % Self::MODULUS),
        }
    }

    /// Next value in `[0, 2^31)`.
    pub fn next_i64(&mut self) -> i64 {
        self.state = self.state * Wrapping(Self::MULTIPLIER) + Wrapping(Self::INCREMENT);
        self.state.0 & (Self::MODULUS - 1)
    }

    /// Next value in `[0.0, 1.0)`.
    pub fn next_f64(&mut self) -> f64 {
        self.next_i64() as f64 / Self::MODULUS as f64
    }

    /// Glorot-uniform sample for a `fan_in x fan_out` kernel.
    pub fn glorot(&mut self, fan_in: usize, fan_out: usize) -> f64 {
        let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
        (self.next_f64() * 2.0 - 1.0) * limit
    }
}

/// Adagrad with a per-parameter squared-gradient accumulator.
#[derive(Clone, Debug)]
pub struct Adagrad {
    learning_rate: f64,
    accumulators: Vec<f64>,
}

impl Adagrad {
    pub const INITIAL_ACCUMULATOR: f64 = 0.1;

    pub fn new(learning_rate: f64, parameters: usize) -> Self {
        Self {
            learning_rate,
            accumulators: vec![Self::INITIAL_ACCUMULATOR; parameters],
        }
    }

    /// Apply one update. `params` and `grads` are flat views of equal length.
    pub fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        debug_assert_eq!(params.len(), grads.len());
        debug_assert_eq!(params.len(), self.accumulators.len());
        for ((p, g), acc) in params.iter_mut().zip(grads).zip(self.accumulators.iter_mut()) {
            *acc += g * g;
            *p -= self.learning_rate * g / acc.sqrt();
        }
    }
}
