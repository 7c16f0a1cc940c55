//! Per-world resources used while stepping: scratch budget and job pool

use crate::physics::error::PhysicsError;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::mem::size_of;
use tracing::{debug, info};

/// Fixed byte budget for transient per-step memory
///
/// The world's step buffers are sized once at init and reused. Every buffer
/// a step fills is charged here first, with an upper bound when the exact
/// size is not known yet. The budget resets at the start of every update.
/// Running out fails the step instead of truncating work.
#[derive(Debug)]
pub struct ScratchAllocator {
    budget: usize,
    used: usize,
    high_water: usize,
}

impl ScratchAllocator {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            high_water: 0,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.budget - self.used
    }

    /// Most bytes used by a single update so far
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Charge `count` values of `T` against the budget
    pub fn reserve<T>(&mut self, count: usize) -> Result<(), PhysicsError> {
        let requested = count.saturating_mul(size_of::<T>());
        if requested > self.remaining() {
            return Err(PhysicsError::ScratchExhausted {
                requested,
                remaining: self.remaining(),
                budget: self.budget,
            });
        }
        self.used += requested;
        self.high_water = self.high_water.max(self.used);
        Ok(())
    }
}

/// Worker threads for the parallel parts of a step
pub struct JobPool {
    pool: ThreadPool,
}

impl JobPool {
    pub fn new(threads: usize) -> Result<Self, PhysicsError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("physics-worker-{index}"))
            .build()
            .map_err(|e| PhysicsError::JobSystem(e.to_string()))?;

        info!(threads, "Physics job pool started");
        Ok(Self { pool })
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` with the pool's workers available to rayon iterators inside it
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        debug!(threads = self.pool.current_num_threads(), "Physics job pool stopped");
    }
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool")
            .field("threads", &self.thread_count())
            .finish()
    }
}

/// Scratch budget and job pool, created at init and torn down at cleanup
#[derive(Debug)]
pub struct ResourcePool {
    pub scratch: ScratchAllocator,
    pub jobs: JobPool,
}

impl ResourcePool {
    pub fn new(scratch_bytes: usize, threads: usize) -> Result<Self, PhysicsError> {
        Ok(Self {
            scratch: ScratchAllocator::new(scratch_bytes),
            jobs: JobPool::new(threads)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_scratch_budget() {
        let mut scratch = ScratchAllocator::new(64);
        scratch.reserve::<u64>(4).unwrap();
        assert_eq!(scratch.used(), 32);

        let err = scratch.reserve::<u64>(5).unwrap_err();
        match err {
            PhysicsError::ScratchExhausted {
                requested,
                remaining,
                budget,
            } => {
                assert_eq!(requested, 40);
                assert_eq!(remaining, 32);
                assert_eq!(budget, 64);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // A failed request charges nothing
        assert_eq!(scratch.used(), 32);

        scratch.reset();
        assert_eq!(scratch.used(), 0);
        assert_eq!(scratch.high_water(), 32);
        scratch.reserve::<u8>(64).unwrap();
        assert_eq!(scratch.remaining(), 0);
    }

    #[test]
    fn test_job_pool_runs_work() {
        let pool = JobPool::new(2).unwrap();
        assert_eq!(pool.thread_count(), 2);
        let sum: u64 = pool.install(|| (0..1000u64).into_par_iter().sum());
        assert_eq!(sum, 499_500);
    }
}
