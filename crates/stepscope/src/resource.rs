//! Resource accounting for sandboxed guest execution.
//!
//! The interpreter is parameterized over a [`ResourceTracker`] so production
//! runs enforce strict ceilings while tests and throwaway evaluations use the
//! zero-cost [`NoLimitTracker`]. Both are monomorphized into the interpreter,
//! so the unlimited tracker compiles down to nothing.

use std::{
    fmt,
    time::{Duration, Instant},
};

/// Error returned when a resource ceiling is exceeded during execution.
///
/// These are uncatchable from guest code: the sandbox, not the guest,
/// decides when execution stops.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    /// Maximum number of heap allocations exceeded.
    #[error("allocation limit exceeded: {count} > {limit}")]
    Allocation { limit: usize, count: usize },
    /// Maximum interpreter operations exceeded.
    #[error("operation limit exceeded: {count} > {limit}")]
    Operation { limit: usize, count: usize },
    /// Maximum execution time exceeded.
    #[error("time limit exceeded: {elapsed:?} > {limit:?}")]
    Time { limit: Duration, elapsed: Duration },
    /// Maximum guest heap memory exceeded.
    #[error("memory limit exceeded: {used} bytes > {limit} bytes")]
    Memory { limit: usize, used: usize },
    /// Maximum call-stack depth exceeded.
    #[error("maximum recursion depth exceeded")]
    Recursion { limit: usize, depth: usize },
}

/// Trait for tracking guest resource usage.
///
/// The interpreter calls these hooks at allocation sites, statement
/// boundaries, and frame pushes. Implementations return `Err` to abort the
/// run with a [`ResourceError`].
pub trait ResourceTracker: fmt::Debug {
    /// Called before each heap allocation.
    ///
    /// `get_size` computes the approximate size in bytes; it is only invoked
    /// when a memory ceiling is configured.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called before growing an existing container in place.
    ///
    /// Growth counts against the allocation budget even though no new heap
    /// slot is created, so `while True: xs.append(0)` cannot grow unbounded.
    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        self.on_allocate(|| 0)
    }

    /// Called at statement boundaries to check operation and time ceilings.
    fn check_time(&mut self) -> Result<(), ResourceError>;

    /// Called before pushing a call frame, with the depth before the push.
    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError>;
}

/// Configuration for resource ceilings.
///
/// All ceilings are optional; `None` disables that check.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Maximum number of interpreter operations (statements evaluated).
    pub max_operations: Option<usize>,
    /// Maximum number of heap allocations.
    pub max_allocations: Option<usize>,
    /// Maximum execution time, checked at statement granularity.
    pub max_duration: Option<Duration>,
    /// Maximum guest heap memory in bytes (approximate).
    pub max_memory: Option<usize>,
    /// Maximum call-stack depth.
    pub max_recursion_depth: Option<usize>,
}

/// Default call-stack ceiling, matching CPython's recursion limit.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

impl ResourceLimits {
    /// Creates limits with everything disabled except the default recursion
    /// ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            ..Default::default()
        }
    }

    /// Sets the maximum number of heap allocations.
    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    /// Sets the maximum number of interpreter operations.
    #[must_use]
    pub fn max_operations(mut self, limit: usize) -> Self {
        self.max_operations = Some(limit);
        self
    }

    /// Sets the maximum execution duration.
    #[must_use]
    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    /// Sets the maximum guest heap memory in bytes.
    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }

    /// Sets the maximum call-stack depth.
    #[must_use]
    pub fn max_recursion_depth(mut self, limit: usize) -> Self {
        self.max_recursion_depth = Some(limit);
        self
    }
}

/// A resource tracker that enforces configured ceilings.
///
/// The start time is recorded at construction, so build the tracker
/// immediately before starting execution.
#[derive(Debug)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    start_time: Instant,
    allocation_count: usize,
    operation_count: usize,
    current_memory: usize,
}

impl LimitedTracker {
    /// Creates a tracker with the given limits, starting its clock now.
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            start_time: Instant::now(),
            allocation_count: 0,
            operation_count: 0,
            current_memory: 0,
        }
    }

    /// Returns the number of allocations recorded so far.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    /// Returns the approximate guest heap memory in use, in bytes.
    #[must_use]
    pub fn current_memory(&self) -> usize {
        self.current_memory
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_allocations
            && self.allocation_count >= max
        {
            return Err(ResourceError::Allocation {
                limit: max,
                count: self.allocation_count + 1,
            });
        }

        if let Some(max) = self.limits.max_memory {
            let new_memory = self.current_memory + get_size();
            if new_memory > max {
                return Err(ResourceError::Memory {
                    limit: max,
                    used: new_memory,
                });
            }
            self.current_memory = new_memory;
        }

        self.allocation_count += 1;
        Ok(())
    }

    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_allocations
            && self.allocation_count >= max
        {
            return Err(ResourceError::Allocation {
                limit: max,
                count: self.allocation_count + 1,
            });
        }
        self.allocation_count += 1;
        Ok(())
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_operations {
            self.operation_count += 1;
            if self.operation_count > max {
                return Err(ResourceError::Operation {
                    limit: max,
                    count: self.operation_count,
                });
            }
        }

        if let Some(max) = self.limits.max_duration {
            let elapsed = self.start_time.elapsed();
            if elapsed > max {
                return Err(ResourceError::Time { limit: max, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, current_depth: usize) -> Result<(), ResourceError> {
        if let Some(max) = self.limits.max_recursion_depth
            && current_depth >= max
        {
            return Err(ResourceError::Recursion {
                limit: max,
                depth: current_depth + 1,
            });
        }
        Ok(())
    }
}

/// A tracker with no ceilings at all, for tests and trusted evaluation.
///
/// Every hook is a no-op the compiler can eliminate entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn on_container_insert(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_time(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn check_recursion_depth(&self, _current_depth: usize) -> Result<(), ResourceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_ceiling() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(2));
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert!(matches!(
            tracker.on_allocate(|| 8),
            Err(ResourceError::Allocation { limit: 2, count: 3 })
        ));
    }

    #[test]
    fn memory_ceiling_counts_bytes() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_memory(100));
        assert!(tracker.on_allocate(|| 60).is_ok());
        assert!(matches!(
            tracker.on_allocate(|| 60),
            Err(ResourceError::Memory { limit: 100, used: 120 })
        ));
        assert_eq!(tracker.current_memory(), 60);
    }

    #[test]
    fn operation_ceiling() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_operations(3));
        for _ in 0..3 {
            assert!(tracker.check_time().is_ok());
        }
        assert!(matches!(tracker.check_time(), Err(ResourceError::Operation { .. })));
    }

    #[test]
    fn recursion_ceiling_is_depth_before_push() {
        let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(10));
        assert!(tracker.check_recursion_depth(9).is_ok());
        assert!(matches!(
            tracker.check_recursion_depth(10),
            Err(ResourceError::Recursion { limit: 10, depth: 11 })
        ));
    }

    #[test]
    fn no_limit_tracker_never_fails() {
        let mut tracker = NoLimitTracker;
        assert!(tracker.on_allocate(|| usize::MAX).is_ok());
        assert!(tracker.check_time().is_ok());
        assert!(tracker.check_recursion_depth(usize::MAX - 1).is_ok());
    }
}
