//! CPU profiler

use std::time::Duration;

#[cfg(miri)]
pub use std::time::Instant;

#[cfg(not(miri))]
pub use quanta::Instant;

/// Guard for profiling. When the guard goes out of scope, the time elapsed since its
/// creation is added to the `accumulation` metric
#[derive(Debug)]
pub struct ScopedTimerGuard<'a> {
    start: Instant,
    accumulation: &'a mut Duration,
}

impl<'a> ScopedTimerGuard<'a> {
    /// Start timing into `accumulation`
    #[inline]
    pub fn new(accumulation: &'a mut Duration) -> Self {
        Self {
            start: Instant::now(),
            accumulation,
        }
    }
}

impl Drop for ScopedTimerGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        *self.accumulation += self.start.elapsed();
    }
}
