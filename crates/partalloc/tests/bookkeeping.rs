//! Accounting invariants: committed, allocated, reserved, and stats dumps.

use partalloc::{
    purge_flags, BucketStats, PartitionOptions, PartitionRoot, PartitionStats, StatsDumper,
};

#[derive(Default)]
struct Collector {
    totals: Option<PartitionStats>,
    buckets: Vec<BucketStats>,
}

impl StatsDumper for Collector {
    fn dump_totals(&mut self, _name: &str, stats: &PartitionStats) {
        self.totals = Some(*stats);
    }
    fn dump_bucket_stats(&mut self, _name: &str, stats: &BucketStats) {
        self.buckets.push(*stats);
    }
}

fn snapshot(root: &PartitionRoot, light: bool) -> Collector {
    let mut c = Collector::default();
    root.dump_stats("test", light, &mut c);
    assert!(c.totals.is_some(), "totals must always be dumped");
    c
}

#[test]
fn counters_ordered_and_bounded() {
    let root = PartitionRoot::new(PartitionOptions::default());
    let ptrs: Vec<*mut u8> = [64usize, 4096, 100_000, 5_000_000]
        .iter()
        .map(|&s| root.alloc(s, None))
        .collect();
    let stats = snapshot(&root, true).totals.unwrap();
    let reserved = stats.total_super_page_bytes + stats.total_direct_map_bytes;
    assert!(stats.total_allocated_bytes > 0);
    assert!(
        stats.total_allocated_bytes <= stats.total_committed_bytes,
        "allocated {} > committed {}",
        stats.total_allocated_bytes,
        stats.total_committed_bytes
    );
    assert!(
        stats.total_committed_bytes <= reserved,
        "committed {} > reserved {}",
        stats.total_committed_bytes,
        reserved
    );
    assert!(stats.max_allocated_bytes >= stats.total_allocated_bytes);
    assert!(stats.max_committed_bytes >= stats.total_committed_bytes);
    assert_eq!(stats.num_direct_mapped, 1);
    for p in ptrs {
        root.free(p);
    }
}

#[test]
fn direct_map_free_returns_committed_memory() {
    let root = PartitionRoot::new(PartitionOptions::default());
    let size = 5_000_000;
    let before = snapshot(&root, true).totals.unwrap();
    let p = root.alloc(size, None);
    let with = snapshot(&root, true).totals.unwrap();
    assert!(
        with.total_committed_bytes >= before.total_committed_bytes + size,
        "committed did not grow by the allocation"
    );
    root.free(p);
    let after = snapshot(&root, true).totals.unwrap();
    assert!(
        with.total_committed_bytes - after.total_committed_bytes >= size,
        "committed did not drop when the direct map was freed"
    );
    assert_eq!(after.num_direct_mapped, 0);
    // High-water marks do not move backwards.
    assert!(after.max_committed_bytes >= with.total_committed_bytes);
}

#[test]
fn purge_decommits_empty_spans() {
    let root = PartitionRoot::new(PartitionOptions::default());
    // Fill and release several spans of one bucket so they park, still
    // committed, in the empty-span ring.
    let mut ptrs = Vec::new();
    for _ in 0..64 {
        ptrs.push(root.alloc(4096, None));
    }
    for p in ptrs.drain(..) {
        root.free(p);
    }
    let parked = snapshot(&root, true).totals.unwrap();
    root.purge_memory(purge_flags::DECOMMIT_EMPTY_SLOT_SPANS);
    let purged = snapshot(&root, true).totals.unwrap();
    assert!(
        purged.total_committed_bytes < parked.total_committed_bytes,
        "purge did not decommit parked spans ({} -> {})",
        parked.total_committed_bytes,
        purged.total_committed_bytes
    );
    // The memory is still usable afterwards.
    let p = root.alloc(4096, None);
    assert!(!p.is_null());
    unsafe { p.write(1) };
    root.free(p);
}

#[test]
fn full_dump_reports_used_buckets() {
    let root = PartitionRoot::new(PartitionOptions::default());
    let p = root.alloc(100, None);
    let q = root.alloc(100_000, None);
    let full = snapshot(&root, false);
    assert!(!full.buckets.is_empty());
    let slot_for_100 = full
        .buckets
        .iter()
        .find(|b| b.slot_size == 112)
        .expect("bucket for 100-byte requests missing from dump");
    assert_eq!(slot_for_100.num_active_spans, 1);
    assert!(slot_for_100.active_bytes >= 112);
    assert!(slot_for_100.committed_bytes > 0);
    // Light dumps skip the per-bucket detail entirely.
    let light = snapshot(&root, true);
    assert!(light.buckets.is_empty());
    root.free(p);
    root.free(q);
}

#[test]
fn discard_unused_pages_keeps_heap_valid() {
    let root = PartitionRoot::new(PartitionOptions::default());
    // One live slot leaves most of its span unprovisioned.
    let p = root.alloc(4096, None);
    unsafe { p.write(0x61) };
    root.purge_memory(purge_flags::DISCARD_UNUSED_SYSTEM_PAGES);
    unsafe { assert_eq!(p.read(), 0x61, "live slot lost by discard") };
    // Provisioning continues past the discarded watermark.
    let q = root.alloc(4096, None);
    unsafe { q.write(0x62) };
    assert_ne!(p, q);
    root.free(p);
    root.free(q);
}

#[test]
fn empty_ring_caps_committed_growth() {
    let root = PartitionRoot::new(PartitionOptions::default());
    // Cycle far more spans through empty than the ring can park; evicted
    // spans must be decommitted, so committed memory stays bounded.
    let mut peak = 0usize;
    for _ in 0..200 {
        let ptrs: Vec<*mut u8> = (0..16).map(|_| root.alloc(4096, None)).collect();
        for p in ptrs {
            root.free(p);
        }
        let now = snapshot(&root, true).totals.unwrap().total_committed_bytes;
        peak = peak.max(now);
    }
    // 16-entry ring of 64 KiB spans plus metadata: well under 4 MiB.
    assert!(
        peak < 4 * 1024 * 1024,
        "committed memory grew without bound: {peak}"
    );
}
