//! The pool allocator.
//!
//! Small requests (up to [`MAX_SMALL_OBJECT`] bytes) are rounded up to a
//! multiple of [`ALIGN`] and served from one of [`NUM_SIZE_CLASSES`]
//! intrusive free lists. When a free list is empty it is refilled with a
//! batch of blocks carved from the arena, the unused tail of the most
//! recently obtained raw chunk. When the arena cannot supply even one block,
//! a new chunk is requested:
//!
//! * The arena's leftover tail, which is always smaller than the requested
//!   block size and a multiple of `ALIGN`, is donated to the free list of its
//!   own size class rather than discarded.
//!
//! * The chunk size is twice the batch size, plus half of all the memory the
//!   pool has obtained so far, plus the chunk header. The last term makes
//!   successive chunks grow geometrically, so `N` allocations need only
//!   `O(log N)` chunks.
//!
//! * The inner allocator is tried once. If that fails, a free block of the
//!   requested size class or larger is repurposed as the arena instead. Only
//!   when there is no such block is the primary allocator asked, which runs
//!   the out-of-memory handler until it succeeds or reports `OutOfMemory`.
//!
//! Chunks are never returned to the inner allocator until teardown.
//! Requests larger than `MAX_SMALL_OBJECT` go straight to the primary
//! allocator.
//!
//! Free lists, the arena and the chunk ledger are guarded by one lock. The
//! deferred-free queue has its own lock, which is always acquired before the
//! free-list lock, never after.

use core::{alloc::Layout, ptr::NonNull};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::*;
use crate::deferred::{DeferredFree, DeferredQueue, ENTRY_SIZE};
use crate::free_list::{Arena, ChunkLedger, FreeList, CHUNK_RESERVE};
use crate::mutex::Mutex;
use crate::size_class::{
    class_size, free_list_index, is_small, round_up, ALIGN, MAX_SMALL_OBJECT, NUM_SIZE_CLASSES,
};

/// A segregated free-list allocator for small blocks with deferred,
/// batched reclamation.
///
/// Requests of up to `MAX_SMALL_OBJECT` bytes are served from per-size-class
/// free lists, refilled in batches from a geometrically growing arena.
/// Larger requests go to the [primary allocator](PoolAllocator::primary).
///
/// The `L` type parameter selects how the pool's locks behave under
/// contention; see [`ParkingLock`] and [`SpinLock`].
///
/// Blocks handed out by the pool are `ALIGN`-aligned. The pool keeps no
/// record of which blocks are live: callers must give back exactly the
/// `(pointer, size)` pairs they were given.
///
/// The out-of-memory handler installed on [`PoolAllocator::primary`] may run
/// while the pool's free-list lock is held, and must not call back into the
/// same pool.
pub struct PoolAllocator<A = Global, L = ParkingLock>
where
    A: Allocator,
    L: LockingMechanism,
{
    shared: Arc<Shared<A, L>>,

    /// The background thread draining the deferred-free queue, started on
    /// first use.
    drainer: OnceCell<Interval>,
}

/// Pool state shared with the background drainer.
pub(crate) struct Shared<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    primary: PrimaryAllocator<A, L>,
    pools: Mutex<Pools, L>,
    deferred: Mutex<DeferredQueue, L>,
    config: Config,
}

/// Everything guarded by the free-list lock.
struct Pools {
    free_lists: [FreeList; NUM_SIZE_CLASSES],
    arena: Arena,
    ledger: ChunkLedger,
}

/// A snapshot of a pool's internal state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// The number of raw chunks obtained since construction or the last
    /// teardown.
    pub chunks: usize,

    /// The total size of those chunks.
    pub reserved_bytes: usize,

    /// Bytes left in the arena, not yet carved into blocks.
    pub arena_remaining: usize,

    /// The number of free blocks in each size class.
    pub free_blocks: [usize; NUM_SIZE_CLASSES],

    /// The number of blocks waiting in the deferred-free queue.
    pub deferred_pending: usize,
}

impl<L> Default for PoolAllocator<Global, L>
where
    L: LockingMechanism + Default,
{
    fn default() -> Self {
        Self::new(Global)
    }
}

impl<A, L> PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism + Default,
{
    /// Create a new `PoolAllocator` on top of the given `inner` allocator,
    /// with the default [`Config`].
    pub fn new(inner: A) -> Self {
        Self::from_parts(inner, Config::default())
    }

    /// Create a new `PoolAllocator` on top of the given `inner` allocator.
    pub fn with_config(inner: A, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(inner, config))
    }

    fn from_parts(inner: A, config: Config) -> Self {
        let shared = Shared {
            primary: PrimaryAllocator::new(inner, L::default()),
            pools: Mutex::new(Pools::new(), L::default()),
            deferred: Mutex::new(DeferredQueue::new(), L::default()),
            config,
        };
        PoolAllocator {
            shared: Arc::new(shared),
            drainer: OnceCell::new(),
        }
    }
}

impl<A, L> PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// The primary allocator used for large objects and arena growth.
    ///
    /// Install an out-of-memory hook with
    /// [`PrimaryAllocator::set_failure_handler`].
    #[inline]
    pub fn primary(&self) -> &PrimaryAllocator<A, L> {
        &self.shared.primary
    }

    /// This pool's configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Allocate a block of at least `bytes` bytes, refilling with the
    /// configured batch size.
    #[inline]
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>> {
        self.shared.allocate(bytes, self.shared.config.refill_count)
    }

    /// Allocate a block of at least `bytes` bytes, carving up to
    /// `refill_count` blocks at once if the size class is empty.
    #[inline]
    pub fn allocate_with_refill(&self, bytes: usize, refill_count: usize) -> Result<NonNull<u8>> {
        self.shared.allocate(bytes, refill_count)
    }

    /// Return a block to its size class, or to the primary allocator if it
    /// is large.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by this pool for a request of exactly
    /// `bytes` bytes, and must not be used afterwards.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) {
        self.shared.deallocate(ptr, bytes);
    }

    /// Replace the block at `ptr` with a block of `new_size` bytes.
    ///
    /// This is `deallocate(ptr, old_size)` followed by `allocate(new_size)`:
    /// the old contents are **not** copied.
    ///
    /// ### Safety
    ///
    /// The same as [`PoolAllocator::deallocate`] for `(ptr, old_size)`.
    #[inline]
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>> {
        self.reallocate_with_refill(ptr, old_size, new_size, self.shared.config.refill_count)
    }

    /// Like [`PoolAllocator::reallocate`] with an explicit refill batch size.
    ///
    /// ### Safety
    ///
    /// The same as [`PoolAllocator::deallocate`] for `(ptr, old_size)`.
    pub unsafe fn reallocate_with_refill(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        refill_count: usize,
    ) -> Result<NonNull<u8>> {
        self.shared.deallocate(ptr, old_size);
        self.shared.allocate(new_size, refill_count)
    }

    /// Release every queued deferred free right now, returning how many were
    /// released.
    ///
    /// This is what the background drainer does once per period.
    pub fn drain_deferred(&self) -> usize {
        self.shared.drain()
    }

    /// Take a snapshot of the pool's internal state.
    pub fn stats(&self) -> PoolStats {
        let deferred_pending = self.shared.deferred.lock().len();
        let pools = self.shared.pools.lock();
        PoolStats {
            chunks: pools.ledger.chunks(),
            reserved_bytes: pools.ledger.bytes(),
            arena_remaining: pools.arena.remaining(),
            free_blocks: core::array::from_fn(|i| pools.free_lists[i].len()),
            deferred_pending,
        }
    }

    /// Stop the background drainer, release all pending deferred frees, and
    /// return every chunk to the inner allocator.
    ///
    /// Every block previously handed out from a free list becomes invalid.
    /// Afterwards the pool behaves as if freshly constructed, except that the
    /// out-of-memory handler stays installed.
    pub fn teardown(&mut self) {
        if let Some(drainer) = self.drainer.take() {
            drop(drainer);
            log::debug!("stopped deferred-free drainer");
        }

        let drained = self.shared.drain();
        let (chunks, bytes) = self.shared.release_chunks();
        log::debug!(
            "tore down pool: {drained} deferred frees released, {chunks} chunks ({bytes} bytes) returned"
        );
    }
}

impl<A, L> PoolAllocator<A, L>
where
    A: Allocator + Send + Sync + 'static,
    L: LockingMechanism + Send + Sync + 'static,
{
    /// Queue a block for release on the next background drain.
    ///
    /// Blocks larger than the small-object ceiling are released immediately.
    /// The first call starts the pool's background drainer thread.
    ///
    /// Fails if the queue entry cannot be allocated or the drainer cannot be
    /// started; the block is then still owned by the caller.
    ///
    /// ### Safety
    ///
    /// `(ptr, bytes)` must describe a live allocation from this pool, and the
    /// caller must not use `ptr` afterwards.
    pub unsafe fn defer_free(&self, ptr: NonNull<u8>, bytes: usize) -> Result<()> {
        if !is_small(bytes) {
            self.shared.deallocate(ptr, bytes);
            return Ok(());
        }

        self.ensure_drainer()?;
        let mut queue = self.shared.deferred.lock();
        self.shared.defer_free_locked(&mut queue, ptr, bytes)
    }

    /// Lock the deferred-free queue, so that several blocks can be queued
    /// atomically with respect to the background drainer.
    ///
    /// Starts the background drainer if it is not running yet.
    pub fn deferred_queue_guard(&self) -> Result<DeferredQueueGuard<'_, A, L>> {
        self.ensure_drainer()?;
        Ok(DeferredQueueGuard {
            shared: &self.shared,
            queue: self.shared.deferred.lock(),
        })
    }

    fn ensure_drainer(&self) -> Result<&Interval> {
        self.drainer.get_or_try_init(|| {
            let config = &self.shared.config;
            let shared = Arc::downgrade(&self.shared);
            let drainer = Interval::spawn(
                config.drainer_thread_name.clone(),
                config.drain_period,
                move || {
                    if let Some(shared) = shared.upgrade() {
                        let released = shared.drain();
                        log::trace!("drained {released} deferred frees");
                    }
                },
            )
            .map_err(Error::SpawnDrainer)?;
            log::debug!(
                "started deferred-free drainer with a period of {:?}",
                config.drain_period
            );
            Ok(drainer)
        })
    }
}

impl<A, L> Drop for PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Is `layout` served from the free lists when going through the
/// `Allocator` trait?
#[inline]
fn is_pooled(layout: Layout) -> bool {
    layout.size() != 0 && is_small(layout.size()) && layout.align() <= ALIGN
}

unsafe impl<A, L> Allocator for PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> core::result::Result<NonNull<[u8]>, AllocError> {
        if !is_pooled(layout) {
            return self.shared.primary.allocate(layout).map_err(|_| AllocError);
        }

        let block = self
            .shared
            .allocate(layout.size(), self.shared.config.refill_count)
            .map_err(|_| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(block, round_up(layout.size())))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if is_pooled(layout) {
            self.shared.deallocate(ptr, layout.size());
        } else {
            self.shared.primary.deallocate(ptr, layout);
        }
    }
}

impl<A, L> Shared<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    fn allocate(&self, bytes: usize, refill_count: usize) -> Result<NonNull<u8>> {
        if !is_small(bytes) {
            let layout = Layout::from_size_align(bytes, ALIGN).map_err(|_| Error::SizeOverflow)?;
            return Ok(self.primary.allocate(layout)?.cast());
        }

        let mut pools = self.pools.lock();
        match pools.free_lists[free_list_index(bytes)].pop() {
            Some(block) => Ok(block),
            None => pools.refill(&self.primary, round_up(bytes), refill_count),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) {
        if !is_small(bytes) {
            // Safety: the block was allocated with exactly this layout, so it
            // is valid.
            let layout = Layout::from_size_align_unchecked(bytes, ALIGN);
            self.primary.deallocate(ptr, layout);
            return;
        }

        self.pools.lock().release(ptr, bytes);
    }

    /// Queue `(ptr, bytes)` in `queue`, which must be this pool's locked
    /// deferred-free queue.
    pub(crate) unsafe fn defer_free_locked(
        &self,
        queue: &mut DeferredQueue,
        ptr: NonNull<u8>,
        bytes: usize,
    ) -> Result<()> {
        if !is_small(bytes) {
            self.deallocate(ptr, bytes);
            return Ok(());
        }

        let node = self.allocate(ENTRY_SIZE, self.config.refill_count)?;
        queue.push(node, DeferredFree { ptr, size: bytes });
        Ok(())
    }

    /// Release the whole deferred-free queue under a single acquisition of
    /// the free-list lock.
    fn drain(&self) -> usize {
        let mut queue = self.deferred.lock();
        if queue.is_empty() {
            return 0;
        }

        let mut pools = self.pools.lock();
        let mut released = 0;
        while let Some((node, DeferredFree { ptr, size })) = queue.pop() {
            // Safety: queued blocks were handed over by `defer_free`, and the
            // entry node was allocated from this pool with `ENTRY_SIZE`. The
            // node goes first so that the freed block is the next one reused.
            unsafe {
                pools.release(node, ENTRY_SIZE);
                pools.release(ptr, size);
            }
            released += 1;
        }
        released
    }

    /// Return every chunk in the ledger to the inner allocator and reset
    /// all free lists and the arena.
    fn release_chunks(&self) -> (usize, usize) {
        let mut pools = self.pools.lock();
        let chunks = pools.ledger.chunks();
        let bytes = pools.ledger.bytes();

        while let Some((chunk, size)) = pools.ledger.pop() {
            // Safety: the chunk was obtained from the primary allocator with
            // exactly this layout, and everything carved from it is being
            // forgotten below.
            unsafe {
                let layout = Layout::from_size_align_unchecked(size, ALIGN);
                self.primary.deallocate(chunk, layout);
            }
        }

        for free_list in pools.free_lists.iter_mut() {
            free_list.clear();
        }
        pools.arena.clear();

        (chunks, bytes)
    }
}

impl Pools {
    const fn new() -> Self {
        Pools {
            free_lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
            arena: Arena::new(),
            ledger: ChunkLedger::new(),
        }
    }

    /// Push a small block back onto its size class.
    ///
    /// ### Safety
    ///
    /// `ptr` must be a block of this pool's size class for `bytes` that is
    /// no longer in use.
    unsafe fn release(&mut self, ptr: NonNull<u8>, bytes: usize) {
        debug_assert!(is_small(bytes));
        self.free_lists[free_list_index(bytes)].push(ptr);
    }

    /// Carve a batch of `refill_count` blocks of `bytes` bytes, return the
    /// first and put the rest into the size class's free list.
    fn refill<A, L>(
        &mut self,
        primary: &PrimaryAllocator<A, L>,
        bytes: usize,
        refill_count: usize,
    ) -> Result<NonNull<u8>>
    where
        A: Allocator,
        L: LockingMechanism,
    {
        let mut count = refill_count.max(1);
        let batch = self.chunk_alloc(primary, bytes, &mut count)?;

        if count > 1 {
            // Safety: the batch is `count * bytes` bytes carved from the
            // arena, which nothing else references.
            unsafe {
                self.free_lists[free_list_index(bytes)].push_run(batch.add(bytes), bytes, count - 1);
            }
        }

        Ok(batch)
    }

    /// Carve `count * bytes` bytes from the arena, growing it if it cannot
    /// supply even one block. `count` is lowered when the arena can supply
    /// some, but not all, of the blocks.
    fn chunk_alloc<A, L>(
        &mut self,
        primary: &PrimaryAllocator<A, L>,
        bytes: usize,
        count: &mut usize,
    ) -> Result<NonNull<u8>>
    where
        A: Allocator,
        L: LockingMechanism,
    {
        debug_assert!(bytes % ALIGN == 0 && (ALIGN..=MAX_SMALL_OBJECT).contains(&bytes));
        debug_assert!(*count > 0);

        loop {
            let wanted = bytes.saturating_mul(*count);
            let available = self.arena.remaining();

            if available >= wanted {
                return Ok(self.arena.carve(wanted));
            }

            if available >= bytes {
                *count = available / bytes;
                return Ok(self.arena.carve(*count * bytes));
            }

            if let Some((rest, len)) = self.arena.take_rest() {
                let index = free_list_index(len);
                log::debug!("donating {len} leftover arena bytes to size class {index}");
                // Safety: `rest` is the uncarved tail of the arena, a
                // non-zero multiple of `ALIGN` smaller than `bytes`.
                unsafe { self.free_lists[index].push(rest) };
            }

            let growth = self.growth_size(bytes, count);
            let layout = Layout::from_size_align(growth, ALIGN)
                .map_err(|_| Error::OutOfMemory { size: growth })?;

            let chunk = match primary.try_allocate(layout) {
                Ok(chunk) => chunk,
                Err(_) => {
                    if let Some((donor, len)) = self.take_donor(bytes) {
                        log::debug!(
                            "inner allocator failed to provide {growth} bytes; \
                             reusing a free {len}-byte block as the arena"
                        );
                        // Safety: the donor was just unlinked from its free
                        // list, so nothing else references it.
                        unsafe { self.arena.reset(donor, len) };
                        continue;
                    }
                    primary.allocate(layout)?
                }
            };

            // Safety: the chunk is freshly allocated with `layout`.
            unsafe {
                let (usable, len) = self.ledger.record(chunk.cast(), growth);
                self.arena.reset(usable, len);
            }
            log::debug!(
                "grew arena by {growth} bytes ({} chunks, {} bytes reserved)",
                self.ledger.chunks(),
                self.ledger.bytes()
            );
        }
    }

    /// The size of the next chunk to request for a batch of `count` blocks
    /// of `bytes` bytes.
    ///
    /// `count` is lowered, but never below one, so that the request stays
    /// within the largest size a `Layout` can describe. A request that large
    /// simply fails in the inner allocator.
    fn growth_size(&self, bytes: usize, count: &mut usize) -> usize {
        const LIMIT: usize = (isize::MAX as usize) & !(ALIGN - 1);

        let slack = (self.ledger.bytes() / 2) & !(ALIGN - 1);
        let fixed = slack.saturating_add(CHUNK_RESERVE);
        let max_count = (LIMIT.saturating_sub(fixed) / (2 * bytes)).max(1);
        *count = (*count).min(max_count);

        (2 * bytes * *count).saturating_add(fixed)
    }

    /// Unlink a free block of at least `bytes` bytes, searching size classes
    /// from `bytes` upwards.
    fn take_donor(&mut self, bytes: usize) -> Option<(NonNull<u8>, usize)> {
        (free_list_index(bytes)..NUM_SIZE_CLASSES).find_map(|index| {
            let block = self.free_lists[index].pop()?;
            Some((block, class_size(index)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primary::tests::FlakyAllocator;
    use crate::size_class::DEFAULT_REFILL_COUNT;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    type Pool<A> = PoolAllocator<A, ParkingLock>;

    fn quiet_config() -> Config {
        // Long enough that the drainer never ticks during a test.
        Config::builder()
            .drain_period(Duration::from_secs(3600))
            .build()
            .unwrap()
    }

    fn addr(ptr: NonNull<u8>) -> usize {
        ptr.as_ptr() as usize
    }

    #[test]
    fn small_requests_fill_their_size_class() {
        let _ = env_logger::try_init();

        let pool = Pool::new(Global);
        let block = pool.allocate(10).unwrap();
        assert_eq!(addr(block) % ALIGN, 0);

        let stats = pool.stats();
        assert_eq!(stats.chunks, 1);
        for (index, free) in stats.free_blocks.iter().enumerate() {
            let expected = if index == 1 { DEFAULT_REFILL_COUNT - 1 } else { 0 };
            assert_eq!(*free, expected, "size class {index}");
        }

        unsafe { pool.deallocate(block, 10) };
        assert_eq!(pool.stats().free_blocks[1], DEFAULT_REFILL_COUNT);
    }

    #[test]
    fn consecutive_allocations_never_overlap() {
        let pool = Pool::new(Global);
        for size in 1..=MAX_SMALL_OBJECT {
            let a = pool.allocate(size).unwrap();
            let b = pool.allocate(size).unwrap();
            assert_ne!(a, b);
            assert_eq!(addr(a) % ALIGN, 0);
            assert_eq!(addr(b) % ALIGN, 0);
            assert!(addr(a).abs_diff(addr(b)) >= round_up(size), "size = {size}");
            unsafe {
                pool.deallocate(a, size);
                pool.deallocate(b, size);
            }
        }
    }

    #[test]
    fn freed_block_is_reused_first() {
        let pool = Pool::new(Global);
        let a = pool.allocate(40).unwrap();
        let _b = pool.allocate(40).unwrap();
        unsafe { pool.deallocate(a, 40) };
        assert_eq!(pool.allocate(40).unwrap(), a);
    }

    #[test]
    fn blocks_are_writable_and_independent() {
        let pool = Pool::new(Global);
        let blocks: Vec<_> = (0..100_u8)
            .map(|i| {
                let block = pool.allocate(24).unwrap();
                unsafe { block.as_ptr().write_bytes(i, 24) };
                (block, i)
            })
            .collect();

        for (block, i) in blocks {
            let bytes = unsafe { core::slice::from_raw_parts(block.as_ptr(), 24) };
            assert!(bytes.iter().all(|b| *b == i));
            unsafe { pool.deallocate(block, 24) };
        }
    }

    #[test]
    fn large_requests_bypass_the_pool() {
        let pool = Pool::new(Global);
        let big = pool.allocate(130).unwrap();
        assert_eq!(pool.stats(), PoolStats::default());
        unsafe { pool.deallocate(big, 130) };
        assert_eq!(pool.stats(), PoolStats::default());

        let small = pool.allocate(8).unwrap();
        let before = pool.stats();
        let big = pool.allocate(4096).unwrap();
        unsafe { pool.deallocate(big, 4096) };
        assert_eq!(pool.stats(), before);
        unsafe { pool.deallocate(small, 8) };
    }

    #[test]
    fn growth_is_logarithmic() {
        let _ = env_logger::try_init();

        const N: usize = 10_000;
        let pool = Pool::new(Global);
        let blocks: Vec<_> = (0..N).map(|_| pool.allocate(8).unwrap()).collect();

        let chunks = pool.stats().chunks;
        assert!(chunks >= 2, "chunks = {chunks}");
        assert!(chunks <= 2 * N.ilog2() as usize, "chunks = {chunks}");

        let distinct: HashSet<_> = blocks.iter().copied().collect();
        assert_eq!(distinct.len(), N);
    }

    #[test]
    fn leftover_arena_is_donated() {
        let _ = env_logger::try_init();

        let pool = Pool::new(Global);
        // The first chunk leaves 20 * 128 bytes in the arena; 21 * 120 of
        // them are carved next, leaving 40.
        pool.allocate(128).unwrap();
        pool.allocate_with_refill(120, 21).unwrap();
        assert_eq!(pool.stats().arena_remaining, 40);

        // 40 bytes cannot hold a 112-byte block, so they go to the 40-byte
        // size class before the arena grows.
        pool.allocate_with_refill(112, 1).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.free_blocks[free_list_index(40)], 1);
    }

    #[test]
    fn reallocate_replaces_without_copying() {
        let pool = Pool::new(Global);
        let a = pool.allocate(16).unwrap();
        let same = unsafe { pool.reallocate(a, 16, 16).unwrap() };
        assert_eq!(same, a);

        let big = unsafe { pool.reallocate(same, 16, 200).unwrap() };
        assert_eq!(pool.stats().free_blocks[1], DEFAULT_REFILL_COUNT);
        let small = unsafe { pool.reallocate(big, 200, 16).unwrap() };
        assert_eq!(small, a);
        unsafe { pool.deallocate(small, 16) };
    }

    #[test]
    fn refill_count_is_respected() {
        let pool = Pool::new(Global);
        pool.allocate_with_refill(64, 5).unwrap();
        assert_eq!(pool.stats().free_blocks[free_list_index(64)], 4);

        // A refill count of zero still yields a block.
        pool.allocate_with_refill(8, 0).unwrap();
        assert_eq!(pool.stats().free_blocks[0], 0);
    }

    #[test]
    fn oversized_refill_is_served_from_the_arena() {
        let pool = Pool::new(Global);
        pool.allocate(8).unwrap();
        let available = pool.stats().arena_remaining;
        assert!(available >= 16);

        pool.allocate_with_refill(16, usize::MAX).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.arena_remaining, available % 16);
        assert_eq!(stats.free_blocks[1], available / 16 - 1);
    }

    #[test]
    fn oversized_refill_on_a_cold_pool_is_out_of_memory() {
        let _ = env_logger::try_init();

        let pool = Pool::new(Global);
        assert!(matches!(
            pool.allocate_with_refill(16, usize::MAX),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(pool.stats(), PoolStats::default());

        // The pool is still usable with a sane batch size.
        pool.allocate_with_refill(16, 4).unwrap();
        assert_eq!(pool.stats().free_blocks[1], 3);
    }

    #[test]
    fn deferred_free_waits_for_a_drain() {
        let pool = Pool::with_config(Global, quiet_config()).unwrap();
        let a = pool.allocate(16).unwrap();
        unsafe { pool.defer_free(a, 16).unwrap() };
        assert_eq!(pool.stats().deferred_pending, 1);

        let b = pool.allocate(16).unwrap();
        assert_ne!(b, a);

        assert_eq!(pool.drain_deferred(), 1);
        assert_eq!(pool.stats().deferred_pending, 0);
        assert_eq!(pool.allocate(16).unwrap(), a);
        assert_eq!(pool.drain_deferred(), 0);
    }

    #[test]
    fn background_drainer_releases_deferred_frees() {
        let _ = env_logger::try_init();

        let config = Config::builder()
            .drain_period(Duration::from_millis(5))
            .build()
            .unwrap();
        let pool = Pool::with_config(Global, config).unwrap();

        let a = pool.allocate(24).unwrap();
        unsafe { pool.defer_free(a, 24).unwrap() };

        let deadline = Instant::now() + Duration::from_secs(10);
        while pool.stats().deferred_pending > 0 {
            assert!(Instant::now() < deadline, "deferred free was never drained");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pool.allocate(24).unwrap(), a);
    }

    #[test]
    fn deferred_frees_are_released_within_one_period() {
        const PERIOD: Duration = Duration::from_millis(200);
        // Generous slack for loaded machines.
        const MARGIN: Duration = Duration::from_secs(2);

        let config = Config::builder().drain_period(PERIOD).build().unwrap();
        let pool = Pool::with_config(Global, config).unwrap();

        let wait_for_drain = |since: Instant| -> Duration {
            loop {
                if pool.stats().deferred_pending == 0 {
                    return since.elapsed();
                }
                assert!(
                    since.elapsed() < PERIOD + MARGIN,
                    "deferred free not released within one period"
                );
                thread::sleep(Duration::from_millis(1));
            }
        };

        let a = pool.allocate(16).unwrap();
        let start = Instant::now();
        unsafe { pool.defer_free(a, 16).unwrap() };
        if start.elapsed() < PERIOD / 2 {
            assert_eq!(pool.stats().deferred_pending, 1);
        }

        // The drainer starts inside `defer_free`, so its first tick cannot
        // come before one full period has passed.
        let elapsed = wait_for_drain(start);
        assert!(
            elapsed >= PERIOD * 9 / 10,
            "released after {elapsed:?}, before the first tick"
        );

        // With the drainer already running, a later entry waits at most one
        // more period.
        let b = pool.allocate(16).unwrap();
        let start = Instant::now();
        unsafe { pool.defer_free(b, 16).unwrap() };
        wait_for_drain(start);
    }

    #[test]
    fn large_deferred_frees_are_immediate() {
        let pool = Pool::with_config(Global, quiet_config()).unwrap();
        let big = pool.allocate(1000).unwrap();
        unsafe { pool.defer_free(big, 1000).unwrap() };
        assert_eq!(pool.stats().deferred_pending, 0);
    }

    #[test]
    fn queue_guard_batches_deferred_frees() {
        let pool = Pool::with_config(Global, quiet_config()).unwrap();
        let a = pool.allocate(8).unwrap();
        let b = pool.allocate(100).unwrap();

        {
            let mut guard = pool.deferred_queue_guard().unwrap();
            assert!(guard.is_empty());
            unsafe {
                guard.defer_free(a, 8).unwrap();
                guard.defer_free(b, 100).unwrap();
            }
            assert_eq!(guard.len(), 2);
        }

        assert_eq!(pool.stats().deferred_pending, 2);
        assert_eq!(pool.drain_deferred(), 2);
    }

    #[test]
    fn teardown_resets_to_fresh() {
        let _ = env_logger::try_init();

        let mut pool = Pool::with_config(Global, quiet_config()).unwrap();
        for size in [8, 16, 64, 128] {
            pool.allocate(size).unwrap();
        }
        let pending = pool.allocate(32).unwrap();
        unsafe { pool.defer_free(pending, 32).unwrap() };
        assert!(pool.stats().chunks > 0);

        pool.teardown();
        assert_eq!(pool.stats(), PoolStats::default());

        pool.allocate(8).unwrap();
        assert_eq!(pool.stats().chunks, 1);

        let again = pool.allocate(32).unwrap();
        unsafe { pool.defer_free(again, 32).unwrap() };
        pool.teardown();
        pool.teardown();
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn out_of_memory_without_handler() {
        let _ = env_logger::try_init();

        let pool = Pool::new(FlakyAllocator::failing());
        assert!(matches!(pool.allocate(8), Err(Error::OutOfMemory { .. })));
        assert!(matches!(pool.allocate(256), Err(Error::OutOfMemory { size: 256 })));
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn failure_handler_rescues_arena_growth() {
        let _ = env_logger::try_init();

        let pool = Pool::new(FlakyAllocator::failing());
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: FailureHandler = {
            let failing = pool.primary().inner().failing.clone();
            let calls = calls.clone();
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                failing.store(false, Ordering::SeqCst);
            })
        };
        pool.primary().set_failure_handler(Some(handler));

        pool.allocate(8).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().chunks, 1);
    }

    #[test]
    fn free_blocks_are_repurposed_when_the_inner_allocator_fails() {
        let _ = env_logger::try_init();

        let pool = Pool::new(FlakyAllocator::default());
        let big = pool.allocate(128).unwrap();
        unsafe { pool.deallocate(big, 128) };
        let stats = pool.stats();
        assert_eq!(stats.free_blocks[15], DEFAULT_REFILL_COUNT);
        assert_eq!(stats.arena_remaining, 128 * DEFAULT_REFILL_COUNT);

        pool.primary().inner().set_failing(true);

        // 16 batches of 20 drain the arena exactly; the next 80 blocks come
        // from five repurposed 128-byte blocks.
        for _ in 0..400 {
            pool.allocate(8).unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.free_blocks[15], DEFAULT_REFILL_COUNT - 5);
        assert_eq!(stats.free_blocks[0], 0);
    }

    #[cfg(feature = "allocator_api2")]
    #[test]
    fn backs_collections() {
        use allocator_api2::{boxed::Box, vec::Vec};

        let pool = Pool::new(Global);
        let mut numbers = Vec::new_in(&pool);
        for i in 0..1000_u32 {
            numbers.push(i);
        }
        assert!(numbers.iter().copied().eq(0..1000));

        let boxed = Box::new_in([7_u64; 4], &pool);
        assert_eq!(*boxed, [7; 4]);
    }

    #[test]
    fn concurrent_churn_with_background_drain() {
        let _ = env_logger::try_init();

        const THREADS: usize = 8;
        const CYCLES: usize = 10_000;

        let config = Config::builder()
            .drain_period(Duration::from_millis(1))
            .build()
            .unwrap();
        let pool = Arc::new(Pool::with_config(Global, config).unwrap());

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let size = 8 * (t % 4 + 1);
                    let mut live: Vec<(NonNull<u8>, u64)> = Vec::new();
                    for i in 0..CYCLES {
                        let tag = ((t as u64) << 32) | i as u64;
                        let block = pool.allocate(size).unwrap();
                        unsafe { block.cast::<u64>().as_ptr().write(tag) };
                        live.push((block, tag));

                        if live.len() > 16 {
                            let (block, tag) = live.swap_remove(i % live.len());
                            assert_eq!(unsafe { block.cast::<u64>().as_ptr().read() }, tag);
                            unsafe {
                                if i % 3 == 0 {
                                    pool.defer_free(block, size).unwrap();
                                } else {
                                    pool.deallocate(block, size);
                                }
                            }
                        }
                    }
                    live.into_iter()
                        .map(|(block, tag)| {
                            assert_eq!(unsafe { block.cast::<u64>().as_ptr().read() }, tag);
                            addr(block)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut outstanding = 0;
        let mut addresses = HashSet::new();
        for worker in workers {
            let live = worker.join().unwrap();
            outstanding += live.len();
            addresses.extend(live);
        }
        assert_eq!(addresses.len(), outstanding);
    }
}
