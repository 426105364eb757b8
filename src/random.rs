//! The precomputed random table shared by every backend.
//!
//! Both the reference engine and the accelerator kernels index the same table with the
//! same keys, which keeps runs on different backends in lockstep.

use crate::SimulationError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of values in a generated random table.
pub const RANDOM_LENGTH: usize = 1024 * 1024;

/// A fixed table of uniformly distributed values in `[0, 1)`.
#[derive(Clone)]
pub struct RandomTable {
    values: Box<[f32]>,
}

impl RandomTable {
    /// Generates a new table, seeded if a seed is given.
    pub fn new(seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let values = (0..RANDOM_LENGTH).map(|_| rng.gen::<f32>()).collect();
        Self { values }
    }

    /// Creates a table from explicit values.
    pub fn from_values(values: Vec<f32>) -> Result<Self, SimulationError> {
        if values.is_empty() || values.len() > i32::MAX as usize {
            return Err(SimulationError::InvalidRandomTable);
        }
        Ok(Self {
            values: values.into_boxed_slice(),
        })
    }

    /// The number of values in the table.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false; empty tables cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Gets the value for the given index, wrapping around the table length.
    pub fn get(&self, index: u32) -> f32 {
        self.values[index as usize % self.values.len()]
    }

    /// Gets the value for a key computed with wrapping `i32` arithmetic.
    pub fn at(&self, key: i32) -> f32 {
        self.get(key as u32)
    }

    /// The raw table values.
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// Samples an exponentially distributed interval with rate `lambda`.
pub fn exp_sample(rand: f32, lambda: f32) -> f32 {
    let complement = 1.0 - rand;
    (-(complement as f64).ln() / lambda as f64) as f32
}

/// Maps a random value onto a spawned car size in `1..=6`.
pub fn spawn_size(rand: f32) -> i32 {
    (1 + (rand * 6.0) as i32).clamp(1, 6)
}
