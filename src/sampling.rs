//! Probabilistic sampling applied before items reach the queue.

use rand::Rng;

use crate::error::BuildError;

/// Admits each item independently with a fixed probability.
///
/// The filter holds no randomness of its own: callers supply the RNG, so
/// tests can drive it with a seeded generator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingFilter {
    probability: f64,
}

impl Default for SamplingFilter {
    fn default() -> Self {
        Self { probability: 1.0 }
    }
}

impl SamplingFilter {
    /// Create a filter admitting items with `probability` in `[0, 1]`.
    pub fn new(probability: f64) -> Result<Self, BuildError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(BuildError::InvalidConfig(format!(
                "sampling probability must be in the range [0, 1], got {probability}"
            )));
        }
        Ok(Self { probability })
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Whether every item is admitted, in which case no RNG is needed.
    pub fn admits_all(&self) -> bool {
        self.probability >= 1.0
    }

    /// Decide whether the next item passes.
    pub fn allows<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if self.admits_all() {
            return true;
        }
        if self.probability <= 0.0 {
            return false;
        }
        rng.r#gen::<f64>() < self.probability
    }
}
