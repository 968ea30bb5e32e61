//! # Household Meter Simulation
//!
//! Uniform random consumption samples, the raw input of the producer.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::round_kw;

/// Meter generator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterGeneratorConfig {
    /// Lower bound of the consumption draw in kW
    pub min_kw: f64,
    /// Upper bound of the consumption draw in kW
    pub max_kw: f64,
    /// Random seed for reproducibility (None = random)
    pub random_seed: Option<u64>,
}

impl Default for MeterGeneratorConfig {
    fn default() -> Self {
        Self {
            min_kw: 0.5,
            max_kw: 10.0,
            random_seed: None,
        }
    }
}

/// Draws consumption values uniformly from `[min_kw, max_kw]`.
pub struct MeterGenerator {
    config: MeterGeneratorConfig,
    rng: StdRng,
}

impl MeterGenerator {
    pub fn new(config: MeterGeneratorConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// Next consumption sample in kW, rounded to two decimals.
    pub fn sample_kw(&mut self) -> f64 {
        if self.config.max_kw <= self.config.min_kw {
            return round_kw(self.config.min_kw);
        }
        round_kw(self.rng.gen_range(self.config.min_kw..=self.config.max_kw))
    }
}
