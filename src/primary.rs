//! The primary allocator: a retrying wrapper around an inner allocator.
//!
//! When the inner allocator fails, the installed [`FailureHandler`] is
//! invoked and the request retried, over and over, until it succeeds. The
//! handler is expected to release memory somewhere (drop caches, flush
//! pools, etc...) so that a retry can make progress. With no handler
//! installed, the failure escalates to [`Error::OutOfMemory`].

use core::{alloc::Layout, ptr::NonNull};
use std::sync::Arc;

use super::*;
use crate::mutex::Mutex;

/// A callback invoked when the inner allocator is out of memory.
pub type FailureHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// A retry-on-exhaustion allocator with a replaceable out-of-memory hook.
pub struct PrimaryAllocator<A, L = ParkingLock>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// The underlying allocator.
    inner: A,

    /// The currently installed out-of-memory hook, if any.
    handler: Mutex<Option<FailureHandler>, L>,
}

impl<A, L> PrimaryAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// Create a new `PrimaryAllocator` that wraps the given `inner`
    /// allocator, with no failure handler installed.
    #[inline]
    pub const fn new(inner: A, lock: L) -> Self {
        PrimaryAllocator {
            inner,
            handler: Mutex::new(None, lock),
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Install `handler` as the out-of-memory hook, returning the previously
    /// installed one.
    ///
    /// Passing `None` uninstalls the current hook.
    pub fn set_failure_handler(&self, handler: Option<FailureHandler>) -> Option<FailureHandler> {
        let mut slot = self.handler.lock();
        core::mem::replace(&mut *slot, handler)
    }

    /// Get the currently installed out-of-memory hook.
    pub fn failure_handler(&self) -> Option<FailureHandler> {
        self.handler.lock().clone()
    }

    /// Make exactly one attempt with the inner allocator, without invoking
    /// the failure handler.
    #[inline]
    pub fn try_allocate(&self, layout: Layout) -> core::result::Result<NonNull<[u8]>, AllocError> {
        self.inner.allocate(layout)
    }

    /// Allocate a block for `layout`, retrying through the failure handler
    /// until the inner allocator succeeds.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>> {
        match self.inner.allocate(layout) {
            Ok(block) => Ok(block),
            Err(_) => self.retry(layout.size(), || self.inner.allocate(layout)),
        }
    }

    /// Resize the block at `ptr` from `old_layout` to `new_layout`,
    /// preserving its contents, retrying through the failure handler until
    /// the inner allocator succeeds.
    ///
    /// On success the old block is owned by the allocator again. On failure
    /// it remains valid and owned by the caller.
    ///
    /// ### Safety
    ///
    /// `ptr` must be currently allocated by this allocator with
    /// `old_layout`, and `new_layout` must have the same alignment.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>> {
        debug_assert_eq!(old_layout.align(), new_layout.align());

        let attempt = || {
            if new_layout.size() >= old_layout.size() {
                self.inner.grow(ptr, old_layout, new_layout)
            } else {
                self.inner.shrink(ptr, old_layout, new_layout)
            }
        };

        match attempt() {
            Ok(block) => Ok(block),
            Err(_) => self.retry(new_layout.size(), attempt),
        }
    }

    /// Return the block at `ptr` to the inner allocator.
    ///
    /// ### Safety
    ///
    /// `ptr` must be currently allocated by this allocator with `layout`.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.deallocate(ptr, layout);
    }

    /// Invoke the failure handler and retry `attempt` until it succeeds, or
    /// fail with `OutOfMemory` when there is no handler.
    ///
    /// The handler is re-read on every iteration and is never invoked while
    /// its slot is locked, so a handler may replace itself.
    #[cold]
    fn retry<T>(
        &self,
        size: usize,
        mut attempt: impl FnMut() -> core::result::Result<T, AllocError>,
    ) -> Result<T> {
        loop {
            let Some(handler) = self.failure_handler() else {
                log::error!("out of memory allocating {size} bytes and no failure handler installed");
                return Err(Error::OutOfMemory { size });
            };

            log::warn!("allocation of {size} bytes failed; invoking out-of-memory handler");
            handler();

            if let Ok(block) = attempt() {
                return Ok(block);
            }
        }
    }
}

unsafe impl<A, L> Allocator for PrimaryAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> core::result::Result<NonNull<[u8]>, AllocError> {
        PrimaryAllocator::allocate(self, layout).map_err(|_| AllocError)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        PrimaryAllocator::deallocate(self, ptr, layout);
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> core::result::Result<NonNull<[u8]>, AllocError> {
        match self.inner.grow(ptr, old_layout, new_layout) {
            Ok(block) => Ok(block),
            Err(_) => self
                .retry(new_layout.size(), || {
                    self.inner.grow(ptr, old_layout, new_layout)
                })
                .map_err(|_| AllocError),
        }
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> core::result::Result<NonNull<[u8]>, AllocError> {
        match self.inner.shrink(ptr, old_layout, new_layout) {
            Ok(block) => Ok(block),
            Err(_) => self
                .retry(new_layout.size(), || {
                    self.inner.shrink(ptr, old_layout, new_layout)
                })
                .map_err(|_| AllocError),
        }
    }
}
