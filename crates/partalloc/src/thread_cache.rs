//! Per-thread slot caches.
//!
//! Each thread holding a cache can satisfy small allocations and frees with
//! no lock traffic at all; the cache refills and drains in batches under a
//! single lock acquisition. A thread's cache binds to the first
//! cache-enabled root it touches; other roots on the same thread simply
//! bypass the cache.
//!
//! Lifecycle contract: slots in a cache still count as allocated in their
//! root. The cache flushes back to the root on thread exit, on
//! `purge_memory(AGGRESSIVE_RECLAIM)` from that thread, and when the root
//! is dropped on that thread. A root checks out of the registry below
//! before it dies, so a late-running thread-exit destructor never touches a
//! dangling root.

use core::cell::RefCell;
use core::ptr;

use parking_lot::Mutex;

use crate::bucket::{self, NUM_BUCKETS};
use crate::root::PartitionRoot;
use crate::util::PARTITION_PAGE_SIZE;

/// Only slots up to one partition page are worth caching.
pub const CACHEABLE_SLOT_LIMIT: usize = PARTITION_PAGE_SIZE;

const MAX_SLOTS_PER_BUCKET: usize = 16;

/// Roots with thread caching enabled that are still alive. Guards the
/// flush-on-thread-exit path against roots that died first.
static LIVE_ROOTS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

pub(crate) fn register_root(addr: usize) {
    LIVE_ROOTS.lock().push(addr);
}

pub(crate) fn unregister_root(addr: usize) {
    LIVE_ROOTS.lock().retain(|&a| a != addr);
}

struct CacheBucket {
    count: u8,
    limit: u8,
    slots: [*mut u8; MAX_SLOTS_PER_BUCKET],
}

struct ThreadCache {
    root: usize,
    buckets: [CacheBucket; NUM_BUCKETS],
}

thread_local! {
    static CACHE: RefCell<Option<Box<ThreadCache>>> = const { RefCell::new(None) };
}

impl ThreadCache {
    fn new(root: &PartitionRoot) -> ThreadCache {
        let budget = root.tuning().thread_cache_bucket_bytes;
        ThreadCache {
            root: root as *const PartitionRoot as usize,
            buckets: core::array::from_fn(|i| {
                let slot_size = bucket::bucket_slot_size(i);
                let limit = if slot_size <= CACHEABLE_SLOT_LIMIT {
                    (budget / slot_size).clamp(1, MAX_SLOTS_PER_BUCKET) as u8
                } else {
                    0
                };
                CacheBucket {
                    count: 0,
                    limit,
                    slots: [ptr::null_mut(); MAX_SLOTS_PER_BUCKET],
                }
            }),
        }
    }

    fn flush_to(&mut self, root: &PartitionRoot) {
        for bucket in self.buckets.iter_mut() {
            if bucket.count > 0 {
                root.cache_batch_free(&bucket.slots[..bucket.count as usize]);
                bucket.count = 0;
            }
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        // Hold the registry lock across the flush so the root cannot be
        // torn down mid-flush by another thread.
        let live = LIVE_ROOTS.lock();
        if live.contains(&self.root) {
            let root = unsafe { &*(self.root as *const PartitionRoot) };
            self.flush_to(root);
        }
    }
}

fn bound_cache<'a>(
    slot: &'a mut Option<Box<ThreadCache>>,
    root: &PartitionRoot,
) -> Option<&'a mut ThreadCache> {
    let addr = root as *const PartitionRoot as usize;
    match slot {
        Some(cache) => {
            if cache.root == addr {
                slot.as_deref_mut()
            } else {
                None
            }
        }
        None => {
            *slot = Some(Box::new(ThreadCache::new(root)));
            slot.as_deref_mut()
        }
    }
}

/// Fast-path allocation for `index`. `None` falls through to the root's
/// locked path.
pub(crate) fn try_alloc(root: &PartitionRoot, index: usize) -> Option<*mut u8> {
    CACHE
        .try_with(|cell| {
            // try_borrow_mut: a hook re-entering the allocator must not
            // observe a half-updated cache.
            let mut borrow = cell.try_borrow_mut().ok()?;
            let cache = bound_cache(&mut borrow, root)?;
            let bucket = &mut cache.buckets[index];
            if bucket.limit == 0 {
                return None;
            }
            if bucket.count == 0 {
                let want = (bucket.limit as usize / 2).max(1);
                let got = root.cache_batch_alloc(index, &mut bucket.slots[..want]);
                bucket.count = got as u8;
                if got == 0 {
                    return None;
                }
            }
            bucket.count -= 1;
            Some(bucket.slots[bucket.count as usize])
        })
        .ok()
        .flatten()
}

/// Fast-path free. Returns `false` when the slot could not be cached and
/// must go through the root's locked path.
pub(crate) fn try_free(root: &PartitionRoot, index: usize, slot: *mut u8) -> bool {
    CACHE
        .try_with(|cell| {
            let Ok(mut borrow) = cell.try_borrow_mut() else {
                return false;
            };
            let Some(cache) = bound_cache(&mut borrow, root) else {
                return false;
            };
            let bucket = &mut cache.buckets[index];
            if bucket.limit == 0 {
                return false;
            }
            if bucket.count == bucket.limit {
                let drain = (bucket.limit as usize / 2).max(1);
                root.cache_batch_free(&bucket.slots[..drain]);
                bucket.slots.copy_within(drain..bucket.count as usize, 0);
                bucket.count -= drain as u8;
            }
            bucket.slots[bucket.count as usize] = slot;
            bucket.count += 1;
            true
        })
        .unwrap_or(false)
}

/// Return every slot the calling thread caches for `root`.
pub fn flush_current_thread(root: &PartitionRoot) {
    let addr = root as *const PartitionRoot as usize;
    let _ = CACHE.try_with(|cell| {
        if let Ok(mut borrow) = cell.try_borrow_mut() {
            if let Some(cache) = borrow.as_deref_mut() {
                if cache.root == addr {
                    cache.flush_to(root);
                }
            }
        }
    });
}
