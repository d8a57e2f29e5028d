//! Lock based FIFO queue, the reference `LockFreeQueue` is checked against.
//!
use crate::spin_lock::SpinLock;
use crate::ConcurrentQueue;
use std::collections::VecDeque;

/// `VecDeque` behind a `SpinLock`.
///
/// # Examples
///
/// ```
/// use rs_hpqueue::SpinLockQueue;
///
/// let queue = SpinLockQueue::new();
/// queue.push(1);
/// assert_eq!(queue.len(), 1);
/// assert_eq!(queue.pop(), Some(1));
/// assert_eq!(queue.pop(), None);
/// ```
///
pub struct SpinLockQueue<T> {
    queue: SpinLock<VecDeque<T>>,
}

impl<T> Default for SpinLockQueue<T> {
    fn default() -> Self {
        SpinLockQueue::new()
    }
}

impl<T> SpinLockQueue<T> {
    pub fn new() -> Self {
        SpinLockQueue {
            queue: SpinLock::new(VecDeque::new()),
        }
    }

    pub fn push(&self, v: T) {
        self.queue.lock().push_back(v);
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl<T: Send> ConcurrentQueue<T> for SpinLockQueue<T> {
    #[inline]
    fn push(&self, value: T) {
        SpinLockQueue::push(self, value)
    }

    #[inline]
    fn pop(&self) -> Option<T> {
        SpinLockQueue::pop(self)
    }
}
