//! Thread index capability consumed by the queue.
//!
//! Every thread touching a [`LockFreeQueue`](../lockfree_queue/struct.LockFreeQueue.html) needs
//! a small integer in `[0, max_threads)` which selects its hazard slots and its retirement list.
//! The index must stay stable while the thread lives and be unique among the threads using the
//! same queue at the same time.
//!
use crate::error::Status;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

cfg_if! {
    if #[cfg(feature = "max_thread_count_4096")] {
        pub const MAX_THREAD_COUNT: usize = 4096;
    } else if #[cfg(feature = "max_thread_count_256")] {
        pub const MAX_THREAD_COUNT: usize = 256;
    } else {
        /// Maximum number of threads holding a global slot at the same time
        pub const MAX_THREAD_COUNT: usize = 16;
    }
}

/// Source of per-thread indices.
///
/// # Safety
///
/// Two threads alive at the same time must never get the same index from `current`. The queue
/// hands each index a retirement list that is not synchronized, a repeated index is a data race.
pub unsafe trait ThreadIndex {
    /// Exclusive upper bound of the indices returned by `current`.
    fn max_threads(&self) -> usize;

    /// Index of the calling thread. Running out of indices is a usage error and panics.
    fn current(&self) -> usize;
}

#[allow(clippy::declare_interior_mutable_const)]
const FREE_SLOT: AtomicBool = AtomicBool::new(false);

static GLOBAL_SLOTS: [AtomicBool; MAX_THREAD_COUNT] = [FREE_SLOT; MAX_THREAD_COUNT];

struct SlotHolder {
    slot: Cell<Option<usize>>,
}

impl Drop for SlotHolder {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get() {
            GLOBAL_SLOTS[slot].store(false, Ordering::Release);
        }
    }
}

thread_local!(static THREAD_SLOT: SlotHolder = SlotHolder { slot: Cell::new(None) });

fn claim_global_slot() -> Result<usize, Status> {
    for (idx, slot) in GLOBAL_SLOTS.iter().enumerate() {
        if !slot.load(Ordering::Relaxed)
            && slot
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            debug!("claim global thread slot {}", idx);
            return Ok(idx);
        }
    }
    warn!("thread number overflow, max={}", MAX_THREAD_COUNT);
    Err(Status::ThreadNumOverflow)
}

/// Slot of the calling thread in the process wide registry. The first call of a thread claims
/// the lowest free slot, the slot goes back to the registry when the thread exits.
///
/// # Examples
///
/// ```
/// use rs_hpqueue::thread_index::try_current_thread_slot;
///
/// let a = try_current_thread_slot().unwrap();
/// let b = try_current_thread_slot().unwrap();
/// assert_eq!(a, b);
/// ```
///
pub fn try_current_thread_slot() -> Result<usize, Status> {
    THREAD_SLOT.with(|holder| match holder.slot.get() {
        Some(slot) => Ok(slot),
        None => {
            let slot = claim_global_slot()?;
            holder.slot.set(Some(slot));
            Ok(slot)
        }
    })
}

/// Automatic indices from the process wide registry, bounded by `MAX_THREAD_COUNT`.
#[derive(Copy, Clone, Debug, Default)]
pub struct GlobalThreadIndex;

unsafe impl ThreadIndex for GlobalThreadIndex {
    #[inline]
    fn max_threads(&self) -> usize {
        MAX_THREAD_COUNT
    }

    #[inline]
    fn current(&self) -> usize {
        match try_current_thread_slot() {
            Ok(slot) => slot,
            Err(status) => panic!(
                "no free thread slot ({}), more than {} threads in use",
                status, MAX_THREAD_COUNT
            ),
        }
    }
}

struct ExplicitBinding {
    claims: Arc<[AtomicBool]>,
    index: usize,
}

struct ExplicitBindings {
    bindings: RefCell<Vec<ExplicitBinding>>,
}

impl Drop for ExplicitBindings {
    fn drop(&mut self) {
        for binding in self.bindings.get_mut().drain(..) {
            binding.claims[binding.index].store(false, Ordering::Release);
        }
    }
}

thread_local!(static EXPLICIT_BINDINGS: ExplicitBindings = ExplicitBindings {
    bindings: RefCell::new(Vec::new()),
});

/// Indices assigned by the caller, each participating thread calls `set_current` once before
/// touching the queue. An index is held by one live thread at a time: it is claimed by
/// `set_current` and given back on rebinding, on `release_current` or when the thread exits.
/// Clones share the same set of indices.
///
/// # Examples
///
/// ```
/// use rs_hpqueue::error::Status;
/// use rs_hpqueue::thread_index::{ExplicitThreadIndex, ThreadIndex};
/// use std::thread;
///
/// let index = ExplicitThreadIndex::new(8);
/// index.set_current(3);
/// assert_eq!(index.current(), 3);
/// assert_eq!(index.try_set_current(8), Err(Status::InvalidParam));
///
/// let other = index.clone();
/// let taken = thread::spawn(move || other.try_set_current(3)).join().unwrap();
/// assert_eq!(taken, Err(Status::Busy));
/// ```
///
#[derive(Clone, Debug)]
pub struct ExplicitThreadIndex {
    claims: Arc<[AtomicBool]>,
}

impl ExplicitThreadIndex {
    pub fn new(max_threads: usize) -> ExplicitThreadIndex {
        assert!(max_threads > 0, "max_threads must be positive");
        let claims: Vec<AtomicBool> = (0..max_threads).map(|_| AtomicBool::new(false)).collect();
        ExplicitThreadIndex {
            claims: claims.into(),
        }
    }

    /// Bind `index` to the calling thread, giving back the index it held before.
    pub fn try_set_current(&self, index: usize) -> Result<(), Status> {
        if index >= self.claims.len() {
            warn!(
                "thread index out of range, index={}, max={}",
                index,
                self.claims.len()
            );
            return Err(Status::InvalidParam);
        }
        EXPLICIT_BINDINGS.with(|holder| {
            let mut bindings = holder.bindings.borrow_mut();
            let pos = bindings
                .iter()
                .position(|b| Arc::ptr_eq(&b.claims, &self.claims));
            if let Some(pos) = pos {
                if bindings[pos].index == index {
                    return Ok(());
                }
            }
            if self.claims[index]
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                warn!("thread index {} is held by another thread", index);
                return Err(Status::Busy);
            }
            match pos {
                Some(pos) => {
                    let old = bindings[pos].index;
                    self.claims[old].store(false, Ordering::Release);
                    bindings[pos].index = index;
                }
                None => bindings.push(ExplicitBinding {
                    claims: self.claims.clone(),
                    index,
                }),
            }
            Ok(())
        })
    }

    /// Panics when `index` is out of range or held by another live thread.
    pub fn set_current(&self, index: usize) {
        if let Err(status) = self.try_set_current(index) {
            panic!("can not set thread index {}: {}", index, status);
        }
    }

    /// Give back the index of the calling thread, if it holds one.
    pub fn release_current(&self) {
        EXPLICIT_BINDINGS.with(|holder| {
            let mut bindings = holder.bindings.borrow_mut();
            if let Some(pos) = bindings
                .iter()
                .position(|b| Arc::ptr_eq(&b.claims, &self.claims))
            {
                let binding = bindings.swap_remove(pos);
                self.claims[binding.index].store(false, Ordering::Release);
            }
        })
    }
}

unsafe impl ThreadIndex for ExplicitThreadIndex {
    #[inline]
    fn max_threads(&self) -> usize {
        self.claims.len()
    }

    #[inline]
    fn current(&self) -> usize {
        let index = EXPLICIT_BINDINGS.with(|holder| {
            holder
                .bindings
                .borrow()
                .iter()
                .find(|b| Arc::ptr_eq(&b.claims, &self.claims))
                .map(|b| b.index)
        });
        match index {
            Some(index) => index,
            None => panic!("thread index is not set for current thread"),
        }
    }
}
