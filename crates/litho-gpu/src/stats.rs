//! Engine counters, cheap enough to keep always-on.

/// Counters accumulated by a device over its lifetime.
#[derive(Clone, Copy, Debug, Default)]
pub struct GpuStats {
    /// Submissions that reached the native queue.
    pub submissions: u64,
    /// Submissions skipped because the list recorded no work.
    pub no_work_submissions: u64,
    /// Command lists observed retired.
    pub lists_retired: u64,
    /// Native barrier submissions (each covering a coalesced batch).
    pub barrier_batches: u64,
    /// Individual state transitions across all batches.
    pub barrier_transitions: u64,
    /// Bytes handed out by the upload staging pool.
    pub staging_bytes: u64,
    /// Bytes handed out by the uniform ring.
    pub uniform_bytes: u64,
}
