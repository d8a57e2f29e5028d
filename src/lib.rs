//! Lock-Free FIFO queue based on the classic `Hazard Pointers` algorithm for Rust
//!
//! [`LockFreeQueue`](lockfree_queue/struct.LockFreeQueue.html) is the Michael-Scott queue: a
//! singly linked list with a sentinel node, where `head` and `tail` are moved only by CAS and
//! any thread may finish a half-done `push` of another thread by advancing a stale `tail`.
//!
//! Nodes removed by `pop` can not be freed immediately, another thread may still be reading
//! them. [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf)
//! solve this: before dereferencing a shared node a thread publishes its address, and a retired
//! node is freed only when no thread publishes it. Every thread owns a small fixed set of hazard
//! slots and a private retirement list, which is scanned when it grows to a bound proportional to
//! the number of participating threads.
//!
//! Threads are identified by a small integer handed out by a [`ThreadIndex`](thread_index/trait.ThreadIndex.html)
//! implementation injected into the queue.
//!

pub mod error;
pub mod hazard_pointer;
pub mod locked_queue;
pub mod lockfree_queue;
pub mod spin_lock;
pub mod thread_index;
pub mod util;

pub use crate::hazard_pointer::HAZARD_POINTERS_PER_THREAD;
pub use crate::locked_queue::SpinLockQueue;
pub use crate::lockfree_queue::LockFreeQueue;
pub use crate::thread_index::{ExplicitThreadIndex, GlobalThreadIndex, ThreadIndex};

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;

/// Common interface of the queues in this crate, so that drivers and tests can run the same
/// workload against the lock-free queue and the lock based reference.
pub trait ConcurrentQueue<T>: Sync {
    /// Append `value` at the back of the queue.
    fn push(&self, value: T);

    /// Remove the front element, `None` when the queue is empty.
    fn pop(&self) -> Option<T>;
}
