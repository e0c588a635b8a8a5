//! A partitioned slab allocator.
//!
//! Callers create one [`PartitionRoot`] per object domain and allocate
//! through it. Small requests share slot spans grouped into size-class
//! buckets inside self-aligned 2 MiB super pages; large requests get their
//! own direct-mapped reservation. Heap metadata lives apart from user
//! payloads, freelist pointers are stored encoded, and every free validates
//! its way back to the owning root, so common heap corruption patterns stop
//! the process instead of propagating.
//!
//! ```no_run
//! use partalloc::{PartitionOptions, PartitionRoot};
//!
//! let root = PartitionRoot::new(PartitionOptions::default());
//! let p = root.alloc(100, Some("buffers"));
//! assert!(root.get_usable_size(p) >= 100);
//! root.free(p);
//! ```

pub mod bucket;
pub mod config;
mod direct_map;
mod extras;
mod freelist;
pub mod hooks;
mod page_provider;
mod platform;
pub mod root;
mod slot_span;
mod span_map;
pub mod stats;
mod thread_cache;
mod util;

pub use config::{PartitionOptions, Tuning};
pub use root::{alloc_flags, purge_flags, PartitionRoot};
pub use stats::{BucketStats, PartitionStats, StatsDumper};
