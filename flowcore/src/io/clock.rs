//! Production execution contexts backed by the real clock and OS randomness.

use chrono::Utc;

use crate::core::context::{ContextProvider, ExecutionContext};

/// Issues a context with `Utc::now()` and a fresh random seed per iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemContextProvider;

impl ContextProvider for SystemContextProvider {
    fn context(&self, iteration: u32) -> ExecutionContext {
        ExecutionContext::new(Utc::now(), rand::random::<u64>()).with_iteration(iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_contexts_carry_iteration_and_move_forward() {
        let first = SystemContextProvider.context(0);
        let second = SystemContextProvider.context(1);
        assert_eq!(second.iteration, 1);
        assert!(second.now >= first.now);
    }
}
