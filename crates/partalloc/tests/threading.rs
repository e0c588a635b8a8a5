//! Concurrent allocation and cross-thread frees.

use std::sync::mpsc;
use std::sync::Barrier;

use partalloc::{PartitionOptions, PartitionRoot};

struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

#[test]
fn cross_thread_free() {
    let root = PartitionRoot::new(PartitionOptions::default());
    let p = root.alloc(128, None);
    unsafe { p.write(0x42) };
    let wrapped = SendPtr(p);
    let root = &root;
    std::thread::scope(|s| {
        s.spawn(move || {
            // Rebind the wrapper itself; capturing only the field would move
            // the raw pointer across threads without its Send wrapper.
            let wrapped = wrapped;
            let p = wrapped.0;
            unsafe { assert_eq!(p.read(), 0x42) };
            root.free(p);
        });
    });
    // The slot is back on the freelist and reusable from this thread.
    let q = root.alloc(128, None);
    assert_eq!(q, p);
    root.free(q);
}

fn hammer(root: &PartitionRoot, threads: usize, iterations: usize) {
    let barrier = Barrier::new(threads);
    std::thread::scope(|s| {
        for t in 0..threads {
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let sizes = [1usize, 24, 64, 300, 1024, 4096, 9000];
                let mut held: Vec<(*mut u8, usize, u8)> = Vec::new();
                for i in 0..iterations {
                    let size = sizes[(i + t) % sizes.len()];
                    let p = root.alloc(size, None);
                    assert!(!p.is_null());
                    let seed = (i ^ t) as u8;
                    unsafe {
                        p.write(seed);
                        p.add(size - 1).write(seed);
                    }
                    held.push((p, size, seed));
                    // Free in bursts so spans cycle through full and empty.
                    if held.len() >= 32 {
                        for (p, size, seed) in held.drain(..) {
                            unsafe {
                                assert_eq!(p.read(), seed, "head stomped");
                                assert_eq!(p.add(size - 1).read(), seed, "tail stomped");
                            }
                            root.free(p);
                        }
                    }
                }
                for (p, _, _) in held.drain(..) {
                    root.free(p);
                }
            });
        }
    });
}

#[test]
fn concurrent_stress_without_cache() {
    let root = PartitionRoot::new(PartitionOptions::default());
    hammer(&root, 4, 2000);
}

#[test]
fn concurrent_stress_with_cache() {
    let root = PartitionRoot::new(PartitionOptions {
        thread_cache: true,
        ..PartitionOptions::default()
    });
    hammer(&root, 4, 2000);
}

#[test]
fn pointers_migrate_between_threads() {
    let root = PartitionRoot::new(PartitionOptions {
        thread_cache: true,
        ..PartitionOptions::default()
    });
    let threads = 4;
    let per_thread = 200;
    let root = &root;
    std::thread::scope(|s| {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..threads {
            let (tx, rx) = mpsc::channel::<SendPtr>();
            senders.push(tx);
            receivers.push(rx);
        }
        for (t, rx) in receivers.into_iter().enumerate() {
            // Each thread allocates and hands its pointers to the next
            // thread in the ring, then frees what it receives.
            let tx = senders[(t + 1) % threads].clone();
            s.spawn(move || {
                for i in 0..per_thread {
                    let size = 16 + (i % 64) * 16;
                    let p = root.alloc(size, None);
                    unsafe { p.write(t as u8) };
                    tx.send(SendPtr(p)).unwrap();
                }
                drop(tx);
                for wrapped in rx.iter().take(per_thread) {
                    root.free(wrapped.0);
                }
            });
        }
        drop(senders);
    });
}
