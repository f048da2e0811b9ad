//! Provides a mutex container type similar to `std::sync::Mutex<T>` but
//! parameterized over any type `L` that implements the `LockingMechanism`
//! trait, so that the pool's thread-safety mode is a type parameter.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};
use parking_lot::lock_api::RawMutex as _;

/// A trait for providing mutual exclusion.
///
/// The pool allocator is always shared with its background drainer thread,
/// so implementations must be `Send + Sync` to be usable with it.
///
/// # Safety
///
/// * Implementations must provide actual mutual exclusion and prevent
///   unsynchronized accesses between threads.
///
/// * Implementations must prevent re-entering the lock when it is already
///   held. The prevention may be a panic, abort, deadlock, or etc...
pub unsafe trait LockingMechanism {
    /// Lock this mutex.
    ///
    /// If it is already locked, this must block, panic, abort, or etc... and
    /// locking must not succeed until it is unlocked.
    fn lock(&self);

    /// Unlock this mutex.
    ///
    /// Only ever called by the holder of the lock.
    fn unlock(&self);
}

/// A blocking [`LockingMechanism`] backed by `parking_lot`'s raw mutex.
///
/// Contended waiters are parked rather than spinning. This is the default.
pub struct ParkingLock {
    raw: parking_lot::RawMutex,
}

unsafe impl LockingMechanism for ParkingLock {
    #[inline]
    fn lock(&self) {
        self.raw.lock();
    }

    #[inline]
    fn unlock(&self) {
        // Safety: `LockingMechanism::unlock` is only called by the holder.
        unsafe { self.raw.unlock() }
    }
}

impl Default for ParkingLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ParkingLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ParkingLock")
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}

impl ParkingLock {
    /// Construct a new, unlocked `ParkingLock`.
    #[inline]
    pub const fn new() -> Self {
        ParkingLock {
            raw: parking_lot::RawMutex::INIT,
        }
    }
}

/// A busy-waiting [`LockingMechanism`] backed by `spin`'s spin mutex.
///
/// Suitable when critical sections are a handful of pointer updates and
/// callers would rather burn a few cycles than be descheduled.
pub struct SpinLock {
    raw: spin::mutex::SpinMutex<()>,
}

unsafe impl LockingMechanism for SpinLock {
    #[inline]
    fn lock(&self) {
        // The guard is reconstituted by `unlock`.
        core::mem::forget(self.raw.lock());
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.raw.is_locked());
        // Safety: `LockingMechanism::unlock` is only called by the holder,
        // whose guard was forgotten in `lock`.
        unsafe { self.raw.force_unlock() }
    }
}

impl core::fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}

impl Default for SpinLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            raw: spin::mutex::SpinMutex::new(()),
        }
    }
}

#[derive(Default)]
pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `LockingMechanism` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another thread
// and getting a mutex guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + LockingMechanism,
{
}

impl<T, L> Mutex<T, L>
where
    L: LockingMechanism,
{
    pub(crate) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

pub(crate) struct MutexGuard<'a, T, L>
where
    L: LockingMechanism,
{
    mutex: &'a Mutex<T, L>,
}

impl<'a, T, L> Drop for MutexGuard<'a, T, L>
where
    L: LockingMechanism,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: LockingMechanism,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: LockingMechanism,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}
