//! Head-based probabilistic sampling.
//!
//! The decision is made once per trace when its root span is created and
//! recorded on [`Span::sampled`]. Nothing downstream re-samples: the batch
//! stage only observes the flag and drops unsampled spans before queueing.

use crate::error::ValidationError;
use crate::span::Span;
use rand::Rng;

/// Fixed-probability sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    rate: f64,
}

impl Sampler {
    /// Creates a sampler keeping roughly `rate` of all traces.
    ///
    /// Fails if `rate` is outside `[0.0, 1.0]` or NaN.
    pub fn new(rate: f64) -> Result<Self, ValidationError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ValidationError::SampleRate(rate));
        }
        Ok(Self { rate })
    }

    /// Sampler that keeps every trace
    pub fn always() -> Self {
        Self { rate: 1.0 }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Draws from the thread-local RNG
    pub fn decide(&self) -> bool {
        self.decide_with(&mut rand::thread_rng())
    }

    /// Draws from the given RNG (useful for seeded, reproducible runs)
    ///
    /// Keeps the trace when the draw from `[0, 1)` is at most the rate. A rate
    /// of exactly 0.0 never samples, even on a draw of 0.0.
    pub fn decide_with<R: Rng>(&self, rng: &mut R) -> bool {
        if self.rate == 0.0 {
            return false;
        }
        let draw: f64 = rng.gen();
        draw <= self.rate
    }

    /// Records a fresh decision on a root span and returns it.
    ///
    /// Child spans inherit the flag from their parent at creation time and
    /// are left untouched.
    pub fn sample_root(&self, span: &mut Span) -> bool {
        if span.is_root() {
            span.sampled = self.decide();
        }
        span.sampled
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::always()
    }
}
