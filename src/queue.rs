//! Lock-free admission channel between application threads and the
//! dispatch task.
//!
//! A bounded MPMC queue split into a cloneable sender and a single
//! receiver. Application threads post built requests through the sender;
//! only the dispatch task drains the receiver, so everything behind the
//! queue stays single-owner.

use core::marker::PhantomData;

use heapless::mpmc::Queue;

/// Bounded channel storage. `DEPTH` must be a power of two
/// (requirement of `heapless::mpmc::Queue`).
pub(crate) struct ChannelQueue<T, const DEPTH: usize> {
    queue: Queue<T, DEPTH>,
}

impl<T, const DEPTH: usize> ChannelQueue<T, DEPTH> {
    pub const fn new() -> Self {
        Self { queue: Queue::new() }
    }

    /// Split into sender and receiver endpoints.
    ///
    /// The endpoints hold raw pointers to the queue; the borrow on `self`
    /// keeps them from outliving the storage.
    pub fn split(&self) -> (Sender<T, DEPTH>, Receiver<T, DEPTH>) {
        let queue_ptr = &self.queue as *const _;
        (
            Sender {
                queue: queue_ptr,
                _phantom: PhantomData,
            },
            Receiver {
                queue: queue_ptr,
                _phantom: PhantomData,
            },
        )
    }
}

/// Sending endpoint; clone one per producer.
///
/// # Safety
///
/// The raw pointer is sound to share because `heapless::mpmc::Queue` uses
/// lock-free atomic operations and the queue storage outlives both
/// endpoints (enforced by the borrow taken in [`ChannelQueue::split`]).
pub(crate) struct Sender<T, const DEPTH: usize> {
    queue: *const Queue<T, DEPTH>,
    _phantom: PhantomData<T>,
}

// SAFETY: the underlying queue is lock-free and the pointee outlives the
// endpoint; see the type-level comment.
unsafe impl<T: Send, const DEPTH: usize> Send for Sender<T, DEPTH> {}
unsafe impl<T: Send, const DEPTH: usize> Sync for Sender<T, DEPTH> {}

impl<T, const DEPTH: usize> Clone for Sender<T, DEPTH> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue,
            _phantom: PhantomData,
        }
    }
}

impl<T, const DEPTH: usize> Sender<T, DEPTH> {
    /// Enqueue without blocking. Returns the value back if the queue is
    /// full so the caller can roll back and report.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        // SAFETY: pointer valid for the life of the split borrow.
        let queue = unsafe { &*self.queue };
        queue.enqueue(value)
    }
}

/// Receiving endpoint; exactly one exists per channel.
pub(crate) struct Receiver<T, const DEPTH: usize> {
    queue: *const Queue<T, DEPTH>,
    _phantom: PhantomData<T>,
}

// SAFETY: same reasoning as for `Sender`.
unsafe impl<T: Send, const DEPTH: usize> Send for Receiver<T, DEPTH> {}
unsafe impl<T: Send, const DEPTH: usize> Sync for Receiver<T, DEPTH> {}

impl<T, const DEPTH: usize> Receiver<T, DEPTH> {
    /// Dequeue without blocking.
    pub fn try_receive(&self) -> Option<T> {
        // SAFETY: pointer valid for the life of the split borrow.
        let queue = unsafe { &*self.queue };
        queue.dequeue()
    }
}
