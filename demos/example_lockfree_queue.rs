//! Producer/consumer throughput driver.
//!
//! ```text
//! cargo run --release --example lockfree_queue_stress -- [producers] [consumers] [iterations]
//! ```
//!
//! Runs the same workload against `LockFreeQueue` and `SpinLockQueue` and checks that the XOR of
//! all pushed values equals the XOR of all popped values.
extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_hpqueue;

use rs_hpqueue::thread_index::ExplicitThreadIndex;
use rs_hpqueue::util;
use rs_hpqueue::{ConcurrentQueue, LockFreeQueue, SpinLockQueue};
use std::env;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::thread;
use std::time;

struct GlobalControl {
    producer_cnt: AtomicUsize,
    produced: AtomicI64,
    consumed: AtomicI64,
}

fn set_cpu_affinity(idx: usize) {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            core_affinity::set_for_current(cpus[idx % cpus.len()]);
            debug!("set_cpu_affinity {} {}", idx, idx % cpus.len());
        }
    }
}

fn producer_thread<Q: ConcurrentQueue<u64>>(
    queue: &Q,
    control: &GlobalControl,
    idx: usize,
    loop_cnt: usize,
) -> u64 {
    let mut value = (idx as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut xorsum = 0;
    let mut tol = 0;
    for i in 0..loop_cnt {
        value ^= value << 13;
        value ^= value >> 7;
        value ^= value << 17;
        xorsum ^= value;
        queue.push(value);
        tol += 1;
        if i % 1024 == 0 {
            control.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    control.produced.fetch_add(tol, Ordering::Relaxed);
    control.producer_cnt.fetch_sub(1, Ordering::SeqCst);
    xorsum
}

fn consumer_thread<Q: ConcurrentQueue<u64>>(queue: &Q, control: &GlobalControl) -> u64 {
    let mut xorsum = 0;
    let mut tol = 0;
    let mut drained = false;
    loop {
        if let Some(v) = queue.pop() {
            xorsum ^= v;
            tol += 1;
            if tol % 1024 == 0 {
                control.consumed.fetch_add(tol, Ordering::Relaxed);
                tol = 0;
            }
            drained = false;
        } else if control.producer_cnt.load(Ordering::SeqCst) == 0 {
            // one more empty pop after the last producer finished
            if drained {
                break;
            }
            drained = true;
        } else {
            util::pause();
        }
    }
    control.consumed.fetch_add(tol, Ordering::Relaxed);
    xorsum
}

fn debug_thread(control: &GlobalControl) {
    while control.producer_cnt.load(Ordering::SeqCst) != 0 {
        info!(
            "debug_thread produced {} consumed {}",
            control.produced.load(Ordering::Relaxed),
            control.consumed.load(Ordering::Relaxed)
        );
        thread::sleep(time::Duration::from_millis(1000));
    }
}

fn run<Q, F>(
    name: &str,
    queue: &Q,
    init: F,
    producer_count: usize,
    consumer_count: usize,
    loop_cnt: usize,
) where
    Q: ConcurrentQueue<u64>,
    F: Fn(usize) + Sync,
{
    let control = GlobalControl {
        producer_cnt: AtomicUsize::new(producer_count),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
    };
    let (control, init) = (&control, &init);
    let start = util::get_cur_microseconds_time();

    let (producer_xorsum, consumer_xorsum) = thread::scope(|s| {
        s.spawn(move || debug_thread(control));
        let producers: Vec<_> = (0..producer_count)
            .map(|idx| {
                s.spawn(move || {
                    init(idx);
                    set_cpu_affinity(idx);
                    producer_thread(queue, control, idx, loop_cnt)
                })
            })
            .collect();
        let consumers: Vec<_> = (0..consumer_count)
            .map(|idx| {
                s.spawn(move || {
                    init(producer_count + idx);
                    set_cpu_affinity(producer_count + idx);
                    consumer_thread(queue, control)
                })
            })
            .collect();
        let p = producers
            .into_iter()
            .fold(0, |acc, t| acc ^ t.join().unwrap());
        info!("{} producer_threads joined", name);
        let c = consumers
            .into_iter()
            .fold(0, |acc, t| acc ^ t.join().unwrap());
        info!("{} consumer_threads joined", name);
        (p, c)
    });

    let cost = util::get_cur_microseconds_time() - start;
    let produced = control.produced.load(Ordering::SeqCst);
    let consumed = control.consumed.load(Ordering::SeqCst);
    assert_eq!(produced, consumed);
    assert_eq!(producer_xorsum, consumer_xorsum);
    println!(
        "{}: {} values, time cost {} ms, {:.0} ops/s",
        name,
        produced,
        cost / 1000,
        produced as f64 * 2.0 * 1_000_000.0 / cost.max(1) as f64
    );
}

fn arg_or(args: &[String], idx: usize, default: usize) -> usize {
    args.get(idx)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn main() {
    env_logger::init();

    let cpu_count = core_affinity::get_core_ids().map_or(2, |c| c.len().max(2));
    let args: Vec<String> = env::args().collect();
    let producer_count = arg_or(&args, 1, (cpu_count + 1) / 2);
    let consumer_count = arg_or(&args, 2, cpu_count / 2);
    let iterations = arg_or(&args, 3, 10_000_000);
    let loop_cnt = iterations / producer_count.max(1);

    info!(
        "producer_count {} consumer_count {} loop_cnt {}",
        producer_count, consumer_count, loop_cnt
    );

    let index = ExplicitThreadIndex::new(producer_count + consumer_count);
    let queue = LockFreeQueue::with_thread_index(index.clone());
    run(
        "LockFreeQueue",
        &queue,
        |idx| index.set_current(idx),
        producer_count,
        consumer_count,
        loop_cnt,
    );
    drop(queue);

    let queue = SpinLockQueue::new();
    run(
        "SpinLockQueue",
        &queue,
        |_| {},
        producer_count,
        consumer_count,
        loop_cnt,
    );
}
