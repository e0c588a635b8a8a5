//! Root options and environment-variable tuning.

/// Per-root feature switches, fixed at construction.
///
/// Cookies and ref counts change slot layout, so they cannot coexist with
/// `aligned_alloc` requests above the natural alignment; `PartitionRoot::new`
/// rejects that combination.
#[derive(Clone, Copy, Debug, Default)]
pub struct PartitionOptions {
    /// Per-thread slot caches in front of the central freelists.
    pub thread_cache: bool,
    /// Permit `aligned_alloc` with alignments above `MIN_ALIGN`.
    pub aligned_alloc: bool,
    /// Guard cookies on both sides of every payload.
    pub cookie: bool,
    /// Per-slot reference counts (deferred release while referenced).
    pub ref_count: bool,
    /// Called on free before the slot is released; returning `true` means
    /// the hook took ownership of the pointer and will free it later.
    pub quarantine_hook: Option<fn(ptr: *mut u8, usable_size: usize) -> bool>,
}

/// Knobs read from the environment once per root.
#[derive(Clone, Copy, Debug)]
pub struct Tuning {
    /// Byte budget per thread-cache bucket; bounds how many slots a bucket
    /// may hold.
    pub thread_cache_bucket_bytes: usize,
    /// Capacity of the empty-slot-span ring before the oldest span is
    /// decommitted.
    pub empty_span_ring_size: usize,
}

pub const DEFAULT_THREAD_CACHE_BUCKET_BYTES: usize = 8 * 1024;
pub const DEFAULT_EMPTY_SPAN_RING_SIZE: usize = 16;

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            thread_cache_bucket_bytes: DEFAULT_THREAD_CACHE_BUCKET_BYTES,
            empty_span_ring_size: DEFAULT_EMPTY_SPAN_RING_SIZE,
        }
    }
}

impl Tuning {
    pub fn from_env() -> Tuning {
        Tuning {
            thread_cache_bucket_bytes: env_usize(
                "PARTALLOC_THREAD_CACHE_BYTES",
                DEFAULT_THREAD_CACHE_BUCKET_BYTES,
            ),
            empty_span_ring_size: env_usize(
                "PARTALLOC_EMPTY_SPAN_RING_SIZE",
                DEFAULT_EMPTY_SPAN_RING_SIZE,
            )
            .max(1),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("ignoring invalid {name}={raw:?}, using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let t = Tuning::default();
        assert_eq!(t.thread_cache_bucket_bytes, DEFAULT_THREAD_CACHE_BUCKET_BYTES);
        assert_eq!(t.empty_span_ring_size, DEFAULT_EMPTY_SPAN_RING_SIZE);
        let o = PartitionOptions::default();
        assert!(!o.thread_cache);
        assert!(o.quarantine_hook.is_none());
    }

    #[test]
    fn env_override_parses() {
        std::env::set_var("PARTALLOC_TEST_KNOB", "4096");
        assert_eq!(env_usize("PARTALLOC_TEST_KNOB", 1), 4096);
        std::env::set_var("PARTALLOC_TEST_KNOB", "bogus");
        assert_eq!(env_usize("PARTALLOC_TEST_KNOB", 7), 7);
        std::env::remove_var("PARTALLOC_TEST_KNOB");
        assert_eq!(env_usize("PARTALLOC_TEST_KNOB", 3), 3);
    }
}
