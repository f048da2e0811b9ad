//! The deferred-free queue.
//!
//! Blocks passed to `defer_free` are not released immediately. Instead an
//! entry recording `(address, size)` is pushed onto the head of this queue,
//! and the pool's background drainer releases the whole queue at once every
//! drain period. Entry nodes are themselves small blocks allocated from the
//! owning pool.

use core::{mem, ptr::NonNull};

use super::*;
use crate::mutex::MutexGuard;
use crate::pool::Shared;
use crate::size_class::{round_up, ALIGN, MAX_SMALL_OBJECT};

/// A pending release request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DeferredFree {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) size: usize,
}

#[repr(C)]
struct Entry {
    request: DeferredFree,
    next: Option<NonNull<Entry>>,
}

/// The size of the pooled block that backs one queue entry.
pub(crate) const ENTRY_SIZE: usize = round_up(mem::size_of::<Entry>());

const _: () = assert!(ENTRY_SIZE <= MAX_SMALL_OBJECT);
const _: () = assert!(mem::align_of::<Entry>() <= ALIGN);

/// A head-insert singly linked list of pending release requests.
#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    head: Option<NonNull<Entry>>,
    len: usize,
}

// Safety: the queue exclusively owns its entry nodes; the addresses they
// record are opaque to it.
unsafe impl Send for DeferredQueue {}

impl DeferredQueue {
    pub(crate) const fn new() -> Self {
        DeferredQueue { head: None, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Record `request` in the entry node at `node`.
    ///
    /// ### Safety
    ///
    /// `node` must be valid for writes of `ENTRY_SIZE` bytes, `ALIGN`-aligned,
    /// and exclusively owned by the queue until it is popped.
    pub(crate) unsafe fn push(&mut self, node: NonNull<u8>, request: DeferredFree) {
        let entry = node.cast::<Entry>();
        entry.as_ptr().write(Entry {
            request,
            next: self.head,
        });
        self.head = Some(entry);
        self.len += 1;
    }

    /// Unlink the most recently pushed entry, returning its node and request.
    pub(crate) fn pop(&mut self) -> Option<(NonNull<u8>, DeferredFree)> {
        let entry = self.head?;
        // Safety: entries only enter the queue through `push`.
        let Entry { request, next } = unsafe { entry.as_ptr().read() };
        self.head = next;
        self.len -= 1;
        Some((entry.cast(), request))
    }
}

/// Exclusive access to a pool's deferred-free queue.
///
/// While this guard is alive the background drainer cannot run, so a
/// sequence of [`defer_free`](DeferredQueueGuard::defer_free) calls made
/// through it lands in the queue atomically. Calling the pool's own
/// `defer_free`, `drain_deferred`, `deferred_queue_guard` or `stats` while
/// holding the guard deadlocks, since they all lock the same queue.
pub struct DeferredQueueGuard<'a, A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    pub(crate) shared: &'a Shared<A, L>,
    pub(crate) queue: MutexGuard<'a, DeferredQueue, L>,
}

impl<A, L> DeferredQueueGuard<'_, A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// The number of entries waiting for the next drain.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue `ptr` for release on the next drain.
    ///
    /// Blocks larger than the small-object ceiling are released immediately
    /// instead.
    ///
    /// ### Safety
    ///
    /// `(ptr, bytes)` must describe a live allocation from this pool, and the
    /// caller must not use `ptr` afterwards.
    pub unsafe fn defer_free(&mut self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        self.shared.defer_free_locked(&mut self.queue, ptr, bytes)
    }
}
