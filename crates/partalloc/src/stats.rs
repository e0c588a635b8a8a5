//! Statistics snapshots handed to a caller-supplied dumper.

/// Partition-wide totals. Byte counts are snapshots of the root's relaxed
/// counters; `max_*` are monotone high-water marks.
#[derive(Clone, Copy, Debug, Default)]
pub struct PartitionStats {
    /// Bytes of system memory currently committed (resident or reclaimable).
    pub total_committed_bytes: usize,
    pub max_committed_bytes: usize,
    /// Slot capacity currently handed out (includes cached slots).
    pub total_allocated_bytes: usize,
    pub max_allocated_bytes: usize,
    /// Address space reserved for super pages.
    pub total_super_page_bytes: usize,
    /// Address space reserved for direct-mapped allocations.
    pub total_direct_map_bytes: usize,
    pub num_direct_mapped: usize,
}

/// Per-bucket detail, skipped for light dumps.
#[derive(Clone, Copy, Debug, Default)]
pub struct BucketStats {
    pub slot_size: usize,
    pub num_active_spans: usize,
    pub num_full_spans: usize,
    pub num_empty_spans: usize,
    pub num_decommitted_spans: usize,
    /// Live slots times slot size across this bucket's spans.
    pub active_bytes: usize,
    /// Committed bytes attributable to this bucket's spans.
    pub committed_bytes: usize,
}

/// Sink for `PartitionRoot::dump_stats`.
pub trait StatsDumper {
    fn dump_totals(&mut self, partition_name: &str, stats: &PartitionStats);
    /// Called once per bucket that has ever held a span; not called at all
    /// for light dumps.
    fn dump_bucket_stats(&mut self, partition_name: &str, stats: &BucketStats);
}
