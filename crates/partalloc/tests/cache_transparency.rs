//! The thread cache must change performance, never placement semantics.

use partalloc::{purge_flags, PartitionOptions, PartitionRoot};

#[test]
fn usable_sizes_identical_with_and_without_cache() {
    let plain = PartitionRoot::new(PartitionOptions::default());
    let cached = PartitionRoot::new(PartitionOptions {
        thread_cache: true,
        ..PartitionOptions::default()
    });
    for &size in &[1usize, 8, 64, 500, 4096, 16 * 1024, 100_000, 1_000_000] {
        let p = plain.alloc(size, None);
        let q = cached.alloc(size, None);
        assert_eq!(
            plain.get_usable_size(p),
            cached.get_usable_size(q),
            "cache changed usable size for {size}"
        );
        plain.free(p);
        cached.free(q);
    }
}

#[test]
fn cached_slots_are_reused() {
    let root = PartitionRoot::new(PartitionOptions {
        thread_cache: true,
        ..PartitionOptions::default()
    });
    let p = root.alloc(64, None);
    root.free(p);
    // The cache hands back the most recently freed slot.
    let q = root.alloc(64, None);
    assert_eq!(q, p);
    root.free(q);
}

#[test]
fn cached_memory_stays_writable_and_isolated() {
    let root = PartitionRoot::new(PartitionOptions {
        thread_cache: true,
        ..PartitionOptions::default()
    });
    // Churn enough slots through the cache to force batch refills and
    // drains, holding half to check for cross-slot interference.
    let mut held = Vec::new();
    for round in 0..100u8 {
        let p = root.alloc(128, None);
        unsafe {
            for i in 0..128 {
                p.add(i).write(round);
            }
        }
        if round % 2 == 0 {
            held.push((p, round));
        } else {
            root.free(p);
        }
    }
    for (p, round) in held {
        unsafe {
            for i in 0..128 {
                assert_eq!(p.add(i).read(), round, "slot contents clobbered");
            }
        }
        root.free(p);
    }
}

#[test]
fn aggressive_purge_flushes_this_threads_cache() {
    let root = PartitionRoot::new(PartitionOptions {
        thread_cache: true,
        ..PartitionOptions::default()
    });
    let mut ptrs: Vec<*mut u8> = (0..20).map(|_| root.alloc(64, None)).collect();
    for p in ptrs.drain(..) {
        root.free(p);
    }
    // Everything above sits in the thread cache or the freelists; after an
    // aggressive purge the cache is empty, so the next alloc must go back
    // through the root and still succeed.
    root.purge_memory(purge_flags::AGGRESSIVE_RECLAIM);
    let p = root.alloc(64, None);
    assert!(!p.is_null());
    root.free(p);
}
