//! Controlled time and randomness for transitions.
//!
//! No transition reads an ambient clock or RNG. The engine asks a
//! [`ContextProvider`] for one [`ExecutionContext`] per loop iteration and
//! threads it through every transition and executor call of that iteration.

use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub now: DateTime<Utc>,
    pub seed: u64,
    /// Zero-based loop iteration this context was issued for.
    pub iteration: u32,
}

impl ExecutionContext {
    pub fn new(now: DateTime<Utc>, seed: u64) -> Self {
        Self {
            now,
            seed,
            iteration: 0,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Fresh RNG seeded from this context; identical contexts yield identical streams.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// First draw in `[0, 1)` from [`ExecutionContext::rng`].
    pub fn random(&self) -> f64 {
        self.rng().gen_range(0.0..1.0)
    }
}

/// Source of per-iteration execution contexts.
pub trait ContextProvider: Send + Sync {
    fn context(&self, iteration: u32) -> ExecutionContext;
}

/// Replayable provider: time advances by `tick` per iteration from `start`.
#[derive(Debug, Clone)]
pub struct FixedContextProvider {
    start: DateTime<Utc>,
    tick: TimeDelta,
    seed: u64,
}

impl FixedContextProvider {
    pub fn new(start: DateTime<Utc>, seed: u64) -> Self {
        Self {
            start,
            tick: TimeDelta::seconds(1),
            seed,
        }
    }

    pub fn with_tick(mut self, tick: TimeDelta) -> Self {
        self.tick = tick;
        self
    }
}

impl ContextProvider for FixedContextProvider {
    fn context(&self, iteration: u32) -> ExecutionContext {
        let now = self
            .tick
            .checked_mul(i32::try_from(iteration).unwrap_or(i32::MAX))
            .and_then(|offset| self.start.checked_add_signed(offset))
            .unwrap_or(if self.tick < TimeDelta::zero() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            });
        ExecutionContext {
            now,
            seed: self.seed.wrapping_add(u64::from(iteration)),
            iteration,
        }
    }
}
