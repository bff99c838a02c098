//! Runtime configuration, resolved once at [`crate::runtime::Runtime::init`]
//! (ambient — spec.md says nothing about configuration, but the compile-
//! time strategy switches spec.md §4.D.5 and §9 call for have to live
//! somewhere).

use crate::descriptor::MAX_RANK;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StridedStrategy {
    /// Build an indexed/vector datatype for the non-contiguous section and
    /// issue one transport call (spec.md §4.D.5, "Structured").
    Structured,
    /// Iterate the unravel loop and issue one transfer per element
    /// (spec.md §4.D.5, "Per-element").
    PerElement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockStrategyKind {
    /// Per-operation shared/exclusive lock around each RMA call.
    PerOperation,
    /// Permanent lock-all at window creation, flush after each operation
    /// (or batched under non-blocking-put mode).
    LockAllFlush,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub failure_handling: bool,
    pub strided_strategy: StridedStrategy,
    pub lock_strategy: LockStrategyKind,
    pub non_blocking_put: bool,
    pub max_rank: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            failure_handling: false,
            strided_strategy: StridedStrategy::PerElement,
            lock_strategy: LockStrategyKind::PerOperation,
            non_blocking_put: false,
            max_rank: MAX_RANK,
        }
    }
}

#[derive(Default)]
pub struct RuntimeConfigBuilder {
    cfg: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        RuntimeConfigBuilder { cfg: RuntimeConfig::default() }
    }

    pub fn failure_handling(mut self, on: bool) -> Self {
        self.cfg.failure_handling = on;
        self
    }

    pub fn strided_strategy(mut self, strategy: StridedStrategy) -> Self {
        self.cfg.strided_strategy = strategy;
        self
    }

    pub fn lock_strategy(mut self, strategy: LockStrategyKind) -> Self {
        self.cfg.lock_strategy = strategy;
        self
    }

    pub fn non_blocking_put(mut self, on: bool) -> Self {
        self.cfg.non_blocking_put = on;
        self
    }

    pub fn max_rank(mut self, rank: usize) -> Self {
        self.cfg.max_rank = rank.min(MAX_RANK);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.cfg
    }
}
