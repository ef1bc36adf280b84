//! Common type alias

/// Degree of the parallelism
pub type ParallelismDegree = std::num::NonZeroU16;

/// Result type of the hash function. The highest bit is always zero, the grouper
/// uses it as the used flag of the bucket
pub type HashValue = u32;
