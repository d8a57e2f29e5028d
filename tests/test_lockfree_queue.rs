extern crate core_affinity;
extern crate env_logger;
extern crate rs_hpqueue;

use rs_hpqueue::error::Status;
use rs_hpqueue::thread_index::ExplicitThreadIndex;
use rs_hpqueue::util;
use rs_hpqueue::{ConcurrentQueue, LockFreeQueue, SpinLockQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

// miri runs the same tests on smaller workloads
const ITERATIONS: usize = if cfg!(miri) { 1_000 } else { 100_000 };

struct Uint64Generator {
    state: u64,
}

impl Uint64Generator {
    fn new(seed: u64) -> Self {
        Uint64Generator {
            state: if cfg!(miri) {
                seed
            } else {
                seed ^ util::get_cur_microseconds_time() as u64
            },
        }
    }

    // splitmix64
    fn next(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

fn init_logger() {
    let _ = env_logger::try_init();
}

fn set_cpu_affinity(idx: usize) {
    if cfg!(miri) {
        return;
    }
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
        }
    }
}

struct StressResult {
    pushed: Vec<u64>,
    popped: Vec<u64>,
    producer_xorsum: u64,
    consumer_xorsum: u64,
}

/// Producers push `iterations` fresh values in total, consumers pop the same number. `init` runs
/// first on every worker thread with its worker number.
fn stress_test<Q, F>(
    queue: &Q,
    init: F,
    iterations: usize,
    producer_count: usize,
    consumer_count: usize,
) -> StressResult
where
    Q: ConcurrentQueue<u64>,
    F: Fn(usize) + Sync,
{
    let init = &init;
    let (producers, consumers) = thread::scope(|s| {
        let producers: Vec<_> = (0..producer_count)
            .map(|idx| {
                s.spawn(move || {
                    init(idx);
                    set_cpu_affinity(idx);
                    let mut generator = Uint64Generator::new(idx as u64);
                    let from = idx * iterations / producer_count;
                    let to = (idx + 1) * iterations / producer_count;
                    let mut pushed = Vec::with_capacity(to - from);
                    let mut xorsum = 0;
                    for _ in from..to {
                        let value = generator.next();
                        xorsum ^= value;
                        queue.push(value);
                        pushed.push(value);
                    }
                    (xorsum, pushed)
                })
            })
            .collect();
        let consumers: Vec<_> = (0..consumer_count)
            .map(|idx| {
                s.spawn(move || {
                    init(producer_count + idx);
                    set_cpu_affinity(producer_count + idx);
                    let from = idx * iterations / consumer_count;
                    let to = (idx + 1) * iterations / consumer_count;
                    let mut popped = Vec::with_capacity(to - from);
                    let mut xorsum = 0;
                    for _ in from..to {
                        let value = loop {
                            if let Some(v) = queue.pop() {
                                break v;
                            }
                            thread::yield_now();
                        };
                        xorsum ^= value;
                        popped.push(value);
                    }
                    (xorsum, popped)
                })
            })
            .collect();
        let producers: Vec<_> = producers.into_iter().map(|t| t.join().unwrap()).collect();
        let consumers: Vec<_> = consumers.into_iter().map(|t| t.join().unwrap()).collect();
        (producers, consumers)
    });

    let mut ret = StressResult {
        pushed: vec![],
        popped: vec![],
        producer_xorsum: 0,
        consumer_xorsum: 0,
    };
    for (xorsum, values) in producers {
        ret.producer_xorsum ^= xorsum;
        ret.pushed.extend(values);
    }
    for (xorsum, values) in consumers {
        ret.consumer_xorsum ^= xorsum;
        ret.popped.extend(values);
    }
    ret
}

fn run_lockfree(producer_count: usize, consumer_count: usize) {
    init_logger();
    let index = ExplicitThreadIndex::new(producer_count + consumer_count + 1);
    let queue = LockFreeQueue::with_thread_index(index.clone());
    let mut result = stress_test(
        &queue,
        |idx| index.set_current(idx),
        ITERATIONS,
        producer_count,
        consumer_count,
    );
    assert_eq!(result.producer_xorsum, result.consumer_xorsum);
    assert_eq!(result.pushed.len(), ITERATIONS);
    assert_eq!(result.popped.len(), ITERATIONS);
    result.pushed.sort_unstable();
    result.popped.sort_unstable();
    assert_eq!(result.pushed, result.popped);

    index.set_current(producer_count + consumer_count);
    assert_eq!(queue.pop(), None);
    assert!(queue.retired_count() <= ITERATIONS);
}

#[test]
fn test_one_thread() {
    let queue = LockFreeQueue::new();
    queue.push(42_u64);
    queue.push(17);
    assert_eq!(queue.pop(), Some(42));
    assert_eq!(queue.pop(), Some(17));
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_repeated_empty_pop() {
    let queue = LockFreeQueue::<u64>::new();
    for _ in 0..1000 {
        assert_eq!(queue.pop(), None);
    }
    queue.push(5);
    assert_eq!(queue.pop(), Some(5));
    for _ in 0..1000 {
        assert_eq!(queue.pop(), None);
    }
    queue.push(6);
    queue.push(7);
    assert_eq!(queue.pop(), Some(6));
    assert_eq!(queue.pop(), Some(7));
    assert_eq!(queue.retired_count(), 3);
}

#[test]
fn test_two_threads() {
    run_lockfree(1, 1);
}

#[test]
fn test_four_threads_1p3c() {
    run_lockfree(1, 3);
}

#[test]
fn test_four_threads_2p2c() {
    run_lockfree(2, 2);
}

#[test]
fn test_four_threads_3p1c() {
    run_lockfree(3, 1);
}

#[test]
fn test_eight_threads() {
    run_lockfree(4, 4);
}

#[test]
fn test_global_thread_index() {
    init_logger();
    let queue = LockFreeQueue::new();
    let result = stress_test(&queue, |_| {}, ITERATIONS / 10, 2, 2);
    assert_eq!(result.producer_xorsum, result.consumer_xorsum);
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_shared_index_rejected() {
    init_logger();
    let index = ExplicitThreadIndex::new(1);
    let queue = LockFreeQueue::with_thread_index(index.clone());
    let barrier = Barrier::new(4);

    let bound = thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let (index, queue, barrier) = (&index, &queue, &barrier);
                s.spawn(move || {
                    let ret = index.try_set_current(0);
                    // the winner keeps its index until every thread has tried
                    barrier.wait();
                    if ret.is_ok() {
                        queue.push(7_u64);
                        assert_eq!(queue.pop(), Some(7));
                    }
                    ret
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(bound.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(bound
        .iter()
        .filter(|r| r.is_err())
        .all(|r| *r == Err(Status::Busy)));
}

#[test]
fn test_locked_queue() {
    let queue = SpinLockQueue::new();
    let mut result = stress_test(&queue, |_| {}, ITERATIONS, 4, 4);
    assert_eq!(result.producer_xorsum, result.consumer_xorsum);
    result.pushed.sort_unstable();
    result.popped.sort_unstable();
    assert_eq!(result.pushed, result.popped);
    assert!(queue.is_empty());
}

#[test]
fn test_fifo_per_producer() {
    init_logger();
    let producer_count = 3;
    let consumer_count = 3;
    let per_producer: u64 = if cfg!(miri) { 200 } else { 20_000 };
    let index = ExplicitThreadIndex::new(producer_count + consumer_count + 1);
    let queue = LockFreeQueue::with_thread_index(index.clone());
    let remaining = AtomicUsize::new(producer_count * per_producer as usize);

    thread::scope(|s| {
        for p in 0..producer_count {
            let (index, queue) = (&index, &queue);
            s.spawn(move || {
                index.set_current(p);
                for seq in 0..per_producer {
                    queue.push(((p as u64) << 32) | seq);
                }
            });
        }
        for c in 0..consumer_count {
            let (index, queue, remaining) = (&index, &queue, &remaining);
            s.spawn(move || {
                index.set_current(producer_count + c);
                let mut last = vec![None; producer_count];
                while remaining.load(Ordering::SeqCst) > 0 {
                    if let Some(v) = queue.pop() {
                        remaining.fetch_sub(1, Ordering::SeqCst);
                        let (p, seq) = ((v >> 32) as usize, v & 0xFFFF_FFFF);
                        // values of one producer leave the queue in push order
                        if let Some(prev) = last[p] {
                            assert!(seq > prev, "producer {} seq {} after {}", p, seq, prev);
                        }
                        last[p] = Some(seq);
                    } else {
                        util::pause();
                    }
                }
            });
        }
    });

    index.set_current(producer_count + consumer_count);
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_completed_push_visible() {
    let per_producer: u64 = if cfg!(miri) { 50 } else { 1000 };
    let index = ExplicitThreadIndex::new(5);
    let queue = LockFreeQueue::with_thread_index(index.clone());
    thread::scope(|s| {
        for p in 0..4 {
            let (index, queue) = (&index, &queue);
            s.spawn(move || {
                index.set_current(p + 1);
                for i in 0..per_producer {
                    queue.push(i);
                }
            });
        }
    });
    // every push has returned, so each pop finds an element on its first attempt
    index.set_current(0);
    for _ in 0..4 * per_producer {
        assert!(queue.pop().is_some());
    }
    assert_eq!(queue.pop(), None);
}

struct DropCounter {
    drops: Arc<AtomicUsize>,
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_drop_exactly_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let index = ExplicitThreadIndex::new(8);
    let queue = LockFreeQueue::with_retire_threshold(index.clone(), 64);
    let per_thread = if cfg!(miri) { 100 } else { 10_000 };

    thread::scope(|s| {
        for t in 0..4 {
            let (index, queue, drops) = (&index, &queue, &drops);
            s.spawn(move || {
                index.set_current(t);
                for _ in 0..per_thread {
                    queue.push(DropCounter {
                        drops: drops.clone(),
                    });
                }
            });
        }
        for t in 4..8 {
            let (index, queue) = (&index, &queue);
            s.spawn(move || {
                index.set_current(t);
                // leave part of the values in the queue for teardown
                for _ in 0..per_thread / 2 {
                    drop(queue.pop());
                }
            });
        }
    });

    let popped = drops.load(Ordering::SeqCst);
    assert!(popped <= 4 * per_thread / 2);
    drop(queue);
    assert_eq!(drops.load(Ordering::SeqCst), 4 * per_thread);
}
