//! Hazard Pointers registry: per thread hazard slots and retirement lists.
//!
//! A thread that is about to dereference a shared node first publishes its address in one of its
//! hazard slots, then checks that the node is still reachable from where it was loaded. A node
//! unlinked from the structure is handed to `retire`, and is freed by a later `scan` of the
//! retiring thread once no hazard slot of any thread holds it.
//!
use crate::util::WrappedAlign64Type;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of hazard slots owned by every thread.
pub const HAZARD_POINTERS_PER_THREAD: usize = 2;

struct ThreadRecord<T> {
    hazards: [AtomicPtr<T>; HAZARD_POINTERS_PER_THREAD],
    // only touched by the thread owning this record
    retired: UnsafeCell<Vec<*mut T>>,
}

impl<T> Default for ThreadRecord<T> {
    fn default() -> Self {
        ThreadRecord {
            hazards: Default::default(),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

/// Hazard slots and retirement lists for `max_threads` threads. Retired pointers must come from
/// `Box::into_raw`, they are released with `Box::from_raw`.
pub struct HazardPointers<T> {
    threads: Box<[WrappedAlign64Type<ThreadRecord<T>>]>,
    retire_threshold: usize,
    hazard_waiting_count: WrappedAlign64Type<AtomicUsize>,
}

unsafe impl<T: Send> Send for HazardPointers<T> {}
unsafe impl<T: Send> Sync for HazardPointers<T> {}

impl<T> HazardPointers<T> {
    /// Smallest retirement list bound that guarantees a scan frees at least half of the list.
    #[inline]
    pub fn min_retire_threshold(max_threads: usize) -> usize {
        2 * HAZARD_POINTERS_PER_THREAD * max_threads
    }

    /// `retire_threshold` is raised to `min_retire_threshold(max_threads)` if it is smaller.
    pub fn new(max_threads: usize, retire_threshold: usize) -> HazardPointers<T> {
        assert!(max_threads > 0, "max_threads must be positive");
        let min_threshold = Self::min_retire_threshold(max_threads);
        let retire_threshold = if retire_threshold < min_threshold {
            if retire_threshold != 0 {
                warn!(
                    "retire threshold {} too small, use {}",
                    retire_threshold, min_threshold
                );
            }
            min_threshold
        } else {
            retire_threshold
        };
        let threads = (0..max_threads)
            .map(|_| WrappedAlign64Type(ThreadRecord::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        HazardPointers {
            threads,
            retire_threshold,
            hazard_waiting_count: Default::default(),
        }
    }

    #[inline]
    pub fn max_threads(&self) -> usize {
        self.threads.len()
    }

    #[inline]
    pub fn retire_threshold(&self) -> usize {
        self.retire_threshold
    }

    #[inline]
    fn record(&self, tid: usize) -> &ThreadRecord<T> {
        assert!(
            tid < self.threads.len(),
            "thread index {} out of range, max={}",
            tid,
            self.threads.len()
        );
        &self.threads[tid]
    }

    /// Publish `node` in hazard slot `idx` of thread `tid`. The caller must check afterwards that
    /// `node` is still reachable before dereferencing it.
    #[inline]
    pub fn protect(&self, tid: usize, idx: usize, node: *mut T) {
        self.record(tid).hazards[idx].store(node, Ordering::SeqCst);
    }

    /// Load `src` and publish the result in hazard slot `idx`, repeating until `src` still holds
    /// the published value. The returned pointer stays valid until the slot is cleared or reused.
    #[inline]
    pub fn protect_load(&self, tid: usize, idx: usize, src: &AtomicPtr<T>) -> *mut T {
        let slot = &self.record(tid).hazards[idx];
        let mut node = src.load(Ordering::Acquire);
        loop {
            slot.store(node, Ordering::SeqCst);
            let curr = src.load(Ordering::SeqCst);
            if curr == node {
                return node;
            }
            node = curr;
        }
    }

    #[inline]
    pub fn clear(&self, tid: usize, idx: usize) {
        self.record(tid).hazards[idx].store(ptr::null_mut(), Ordering::Release);
    }

    /// Append an unlinked node to the retirement list of `tid`, scanning the list once it is full.
    ///
    /// # Safety
    ///
    /// `tid` must be the index of the calling thread, `node` must come from `Box::into_raw`, be
    /// unreachable for threads that have not protected it yet, and be retired only once.
    pub unsafe fn retire(&self, tid: usize, node: *mut T) {
        if node.is_null() {
            return;
        }
        let len = {
            let retired = &mut *self.record(tid).retired.get();
            retired.push(node);
            retired.len()
        };
        self.hazard_waiting_count.fetch_add(1, Ordering::Relaxed);
        if len >= self.retire_threshold {
            self.scan(tid);
        }
    }

    /// Free every node in the retirement list of `tid` that no hazard slot holds, return the
    /// number of freed nodes.
    ///
    /// # Safety
    ///
    /// `tid` must be the index of the calling thread.
    pub unsafe fn scan(&self, tid: usize) -> usize {
        let record = self.record(tid);
        let mut hazards =
            Vec::with_capacity(self.threads.len() * HAZARD_POINTERS_PER_THREAD);
        for thread in self.threads.iter() {
            for slot in thread.hazards.iter() {
                let node = slot.load(Ordering::SeqCst);
                if !node.is_null() {
                    hazards.push(node);
                }
            }
        }
        hazards.sort_unstable();
        hazards.dedup();

        let retired = &mut *record.retired.get();
        let before = retired.len();
        retired.retain(|&node| {
            if hazards.binary_search(&node).is_ok() {
                true
            } else {
                drop(Box::from_raw(node));
                false
            }
        });
        let freed = before - retired.len();
        self.hazard_waiting_count
            .fetch_sub(freed, Ordering::Relaxed);
        debug!(
            "hazard scan tid={} freed={} kept={} hazards={}",
            tid,
            freed,
            retired.len(),
            hazards.len()
        );
        freed
    }

    /// Count of retired nodes not freed yet, summed over all threads.
    #[inline]
    pub fn waiting_count(&self) -> usize {
        self.hazard_waiting_count.load(Ordering::Relaxed)
    }

    /// Move every retired node out of the registry without freeing it.
    pub fn take_retired(&mut self) -> Vec<*mut T> {
        let mut ret = Vec::new();
        for thread in self.threads.iter_mut() {
            ret.append(thread.retired.get_mut());
        }
        *self.hazard_waiting_count.get_mut() = 0;
        ret
    }
}

impl<T> Drop for HazardPointers<T> {
    fn drop(&mut self) {
        let mut retired = self.take_retired();
        retired.sort_unstable();
        retired.dedup();
        for node in retired {
            unsafe {
                drop(Box::from_raw(node));
            }
        }
    }
}
