//! Michael-Scott lock-free FIFO queue, memory reclaimed by `HazardPointers`.
//!
use crate::hazard_pointer::HazardPointers;
use crate::thread_index::{GlobalThreadIndex, ThreadIndex};
use crate::util::WrappedAlign64Type;
use crate::ConcurrentQueue;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

type FIFONodePtr<T> = *mut FIFONode<T>;

// hazard slots used by push and pop
const HP_HEAD: usize = 0;
const HP_NEXT: usize = 1;
const HP_TAIL: usize = 0;

struct FIFONode<T> {
    // uninit in the sentinel, moved out when the node becomes the sentinel
    value: MaybeUninit<T>,
    next: AtomicPtr<FIFONode<T>>,
}

impl<T> FIFONode<T> {
    fn sentinel() -> Self {
        FIFONode {
            value: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn new(value: T) -> Self {
        FIFONode {
            value: MaybeUninit::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Unbounded multi-producer multi-consumer FIFO queue. No operation takes a lock: a thread which
/// finds `tail` lagging behind the last node advances it before retrying, so a delayed thread
/// never stops the others.
///
/// Each thread using the queue is identified by `I`, which must hand out indices below the
/// `max_threads` the queue was built with.
///
/// # Examples
///
/// ```
/// use rs_hpqueue::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.push(42_u64);
/// queue.push(17);
/// assert_eq!(queue.pop(), Some(42));
/// assert_eq!(queue.pop(), Some(17));
/// assert_eq!(queue.pop(), None);
/// ```
///
pub struct LockFreeQueue<T, I: ThreadIndex = GlobalThreadIndex> {
    head: WrappedAlign64Type<AtomicPtr<FIFONode<T>>>,
    tail: WrappedAlign64Type<AtomicPtr<FIFONode<T>>>,
    hazard_pointers: HazardPointers<FIFONode<T>>,
    thread_index: I,
}

unsafe impl<T: Send, I: ThreadIndex + Send> Send for LockFreeQueue<T, I> {}
unsafe impl<T: Send, I: ThreadIndex + Sync> Sync for LockFreeQueue<T, I> {}

impl<T> LockFreeQueue<T, GlobalThreadIndex> {
    /// Queue whose threads take their index from the process wide registry.
    pub fn new() -> Self {
        Self::with_thread_index(GlobalThreadIndex)
    }
}

impl<T> Default for LockFreeQueue<T, GlobalThreadIndex> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, I: ThreadIndex> LockFreeQueue<T, I> {
    pub fn with_thread_index(thread_index: I) -> Self {
        Self::with_retire_threshold(thread_index, 0)
    }

    /// `retire_threshold` bounds the per thread retirement list before a reclamation scan, it
    /// never goes below `2 * HAZARD_POINTERS_PER_THREAD * max_threads`.
    pub fn with_retire_threshold(thread_index: I, retire_threshold: usize) -> Self {
        let sentinel = Box::into_raw(Box::new(FIFONode::sentinel()));
        let hazard_pointers = HazardPointers::new(thread_index.max_threads(), retire_threshold);
        LockFreeQueue {
            head: WrappedAlign64Type(AtomicPtr::new(sentinel)),
            tail: WrappedAlign64Type(AtomicPtr::new(sentinel)),
            hazard_pointers,
            thread_index,
        }
    }

    #[inline]
    pub fn thread_index(&self) -> &I {
        &self.thread_index
    }

    #[inline]
    fn current_tid(&self) -> usize {
        let tid = self.thread_index.current();
        assert!(
            tid < self.hazard_pointers.max_threads(),
            "thread index {} out of range, max={}",
            tid,
            self.hazard_pointers.max_threads()
        );
        tid
    }

    /// Append `v` to the back of the queue.
    pub fn push(&self, v: T) {
        let tid = self.current_tid();
        let node = Box::into_raw(Box::new(FIFONode::new(v)));
        unsafe { self.inner_push(tid, node) }
    }

    unsafe fn inner_push(&self, tid: usize, node: FIFONodePtr<T>) {
        let hp = &self.hazard_pointers;
        let tail = loop {
            let tail = hp.protect_load(tid, HP_TAIL, &self.tail);
            let next = (*tail).next.load(Ordering::Acquire);
            if tail != self.tail.load(Ordering::SeqCst) {
                continue;
            }
            if !next.is_null() {
                trace!("push helps to advance stale tail");
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Relaxed);
                continue;
            }
            if (*tail)
                .next
                .compare_exchange(ptr::null_mut(), node, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break tail;
            }
        };
        // best effort, a failure means another thread already moved tail past `node`
        let _ = self
            .tail
            .compare_exchange(tail, node, Ordering::SeqCst, Ordering::Relaxed);
        hp.clear(tid, HP_TAIL);
    }

    /// Remove the front element, `None` when the queue is empty at the moment of the call.
    pub fn pop(&self) -> Option<T> {
        let tid = self.current_tid();
        unsafe { self.inner_pop(tid) }
    }

    unsafe fn inner_pop(&self, tid: usize) -> Option<T> {
        let hp = &self.hazard_pointers;
        let mut ret = None;
        let mut head;
        loop {
            head = hp.protect_load(tid, HP_HEAD, &self.head);
            let tail = self.tail.load(Ordering::SeqCst);
            let next = (*head).next.load(Ordering::Acquire);
            hp.protect(tid, HP_NEXT, next);
            if head != self.head.load(Ordering::SeqCst) {
                continue;
            }
            if next.is_null() {
                break;
            }
            if head == tail {
                trace!("pop helps to advance stale tail");
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Relaxed);
                continue;
            }
            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // `next` is the new sentinel, nobody else reads its value
                ret = Some(ptr::read((*next).value.as_ptr()));
                break;
            }
        }
        hp.clear(tid, HP_HEAD);
        hp.clear(tid, HP_NEXT);
        if ret.is_some() {
            hp.retire(tid, head);
        }
        ret
    }

    /// Run a reclamation scan over the retirement list of the calling thread, return the number
    /// of freed nodes.
    pub fn reclaim(&self) -> usize {
        let tid = self.current_tid();
        unsafe { self.hazard_pointers.scan(tid) }
    }

    /// Count of popped nodes waiting to be freed, over all threads.
    #[inline]
    pub fn retired_count(&self) -> usize {
        self.hazard_pointers.waiting_count()
    }

    unsafe fn destroy(&mut self) {
        let mut nodes = self.hazard_pointers.take_retired();
        let sentinel = *self.head.get_mut();
        let mut iter = sentinel;
        while !iter.is_null() {
            if iter != sentinel {
                ptr::drop_in_place((*iter).value.as_mut_ptr());
            }
            nodes.push(iter);
            iter = *(*iter).next.get_mut();
        }
        nodes.sort_unstable();
        nodes.dedup();
        for node in nodes {
            drop(Box::from_raw(node));
        }
        *self.head.get_mut() = ptr::null_mut();
        *self.tail.get_mut() = ptr::null_mut();
    }
}

impl<T, I: ThreadIndex> Drop for LockFreeQueue<T, I> {
    fn drop(&mut self) {
        unsafe {
            self.destroy();
        }
    }
}

impl<T: Send, I: ThreadIndex + Sync> ConcurrentQueue<T> for LockFreeQueue<T, I> {
    #[inline]
    fn push(&self, value: T) {
        LockFreeQueue::push(self, value)
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        LockFreeQueue::pop(self)
    }
}
