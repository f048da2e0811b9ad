//! Shared fuzzing and testing infrastructure for `deferred_free_pool`.

use deferred_free_pool::{
    size_class::{is_small, round_up, ALIGN, MAX_SMALL_OBJECT},
    AllocError, Allocator, Config, Global, LockingMechanism, ParkingLock, PoolAllocator,
    PoolStats,
};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{
    alloc::Layout,
    collections::BTreeMap,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// The requested size of a test allocation.
//
// Note: this is a newtype rather than a bare `usize` so that it can have its
// own default mutator, biased towards the pool's small-object range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// The default mutator for [`Size`]s.
#[derive(Debug)]
pub struct SizeMutator {
    /// The largest size to generate. Anything above `MAX_SMALL_OBJECT` goes
    /// straight to the primary allocator.
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 1024 }
    }
}

/// Sizes right at the edges of size classes and the small-object ceiling.
const INTERESTING_SIZES: &[usize] = &[0, 1, 7, 8, 9, 16, 24, 120, 127, 128, 129, 256];

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        // Any size up to the maximum, or smaller when shrinking.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // A size on a boundary.
        if !c.shrink() {
            c.mutation(|ctx| {
                size.0 = *ctx.rng().choose(INTERESTING_SIZES).unwrap();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Size> {
        // Mostly small objects, since that is where the interesting
        // bookkeeping happens.
        let max_size = if ctx.rng().gen_index(4) == Some(0) {
            self.max_size
        } else {
            MAX_SMALL_OBJECT
        };
        let size = m::range(0..=max_size).generate(ctx)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    Dealloc { id: u32 },
    Realloc { id: u32, size: Size },
    DeferFree { id: u32 },
    Drain,
    Teardown,
}

impl Op {
    fn id_mut(&mut self) -> Option<&mut u32> {
        match self {
            Op::Alloc { id, .. }
            | Op::Dealloc { id }
            | Op::Realloc { id, .. }
            | Op::DeferFree { id } => Some(id),
            Op::Drain | Op::Teardown => None,
        }
    }
}

impl DefaultMutate for Op {
    type DefaultMutate = OpMutator;
}

/// The default mutator for [`Op`]s.
#[derive(Debug, Default)]
pub struct OpMutator;

impl Mutate<Op> for OpMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, op: &mut Op) -> mutatis::Result<()> {
        // Replace the op wholesale.
        if !c.shrink() {
            c.mutation(|ctx| {
                *op = self.generate(ctx)?;
                Ok(())
            })?;
        }

        match op {
            Op::Alloc { id, size } | Op::Realloc { id, size } => {
                m::default::<u32>().mutate(c, id)?;
                m::default::<Size>().mutate(c, size)?;
            }
            Op::Dealloc { id } | Op::DeferFree { id } => {
                m::default::<u32>().mutate(c, id)?;
            }
            Op::Drain | Op::Teardown => {}
        }

        Ok(())
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::DeferFree {
                    id: ctx.rng().gen_u32(),
                })
            },
            |_ctx| Ok(Op::Drain),
            |_ctx| Ok(Op::Teardown),
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Pick a random existing allocation and a random position after it.
        fn pick_alloc_and_later_index(
            ctx: &mut mutatis::Context,
            ops: &Ops,
        ) -> Option<(u32, usize)> {
            let num_allocs = alloc_positions_and_ids(ops).count();
            let alloc_index = ctx.rng().gen_index(num_allocs)?;
            let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
            let later = op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
            Some((id, later))
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                if let Some(id) = ops.ops[op_index].id_mut() {
                    *id = new_id;
                }
            }
            Ok(())
        })?;

        // Free an existing allocation, either right away or deferred.
        if !c.shrink() {
            c.mutation(|ctx| {
                if let Some((id, index)) = pick_alloc_and_later_index(ctx, ops) {
                    let free_op = if ctx.rng().gen_bool() {
                        Op::Dealloc { id }
                    } else {
                        Op::DeferFree { id }
                    };
                    ops.ops.insert(index, free_op);
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                if let Some((id, index)) = pick_alloc_and_later_index(ctx, ops) {
                    let size = m::default::<Size>().generate(ctx)?;
                    ops.ops.insert(index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        // Drain the deferred-free queue somewhere.
        if !c.shrink() {
            c.mutation(|ctx| {
                let index = ctx.rng().gen_index(ops.ops.len() + 1).unwrap();
                ops.ops.insert(index, Op::Drain);
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last op, returning whether there was one to remove.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit.
    ///
    /// Also checks that every byte the pool took from the system allocator
    /// was given back once the pool is dropped.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        let counting = CountingAllocator::default();
        let outstanding = counting.outstanding.clone();
        let pool = PoolAllocator::<_, ParkingLock>::with_config(counting, quiet_config())
            .map_err(|e| e.to_string())?;
        self.run_with_pool(pool, allocation_limit)?;

        let leaked = outstanding.load(Ordering::SeqCst);
        ensure!(leaked == 0, "{} bytes leaked after the pool was dropped", leaked);
        Ok(())
    }

    /// Run these test operations against the given pool and allocation limit.
    ///
    /// The pool's background drainer should not tick while the ops run: every
    /// deferred free is expected to stay pending until an `Op::Drain`.
    pub fn run_with_pool<A, L>(
        &self,
        pool: PoolAllocator<A, L>,
        allocation_limit: usize,
    ) -> Result<(), String>
    where
        A: Allocator + Send + Sync + 'static,
        L: LockingMechanism + Send + Sync + 'static,
    {
        log::debug!("========== Running test operations ==========");

        let mut runner = Runner {
            pool,
            live: LiveMap::new(allocation_limit),
            pending: Vec::new(),
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, size } => {
                    if runner.live.beyond_allocation_limit(size.0) {
                        continue;
                    }
                    if let Ok(ptr) = runner.pool.allocate(size.0) {
                        runner.new_alloc(*id, ptr, size.0)?;
                    }
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = runner.live.remove(*id) {
                        runner.dealloc(*id, alloc)?;
                    }
                }

                Op::Realloc { id, size } => {
                    let Some(old_alloc) = runner.live.remove(*id) else {
                        continue;
                    };
                    if runner.live.beyond_allocation_limit(size.0) {
                        runner.live.insert(*id, old_alloc);
                        continue;
                    }

                    check_untouched(&old_alloc)?;
                    fill(&old_alloc, FREE_POISON_PATTERN);
                    // The old block is released whether or not the new
                    // allocation succeeds.
                    if let Ok(ptr) =
                        unsafe { runner.pool.reallocate(old_alloc.ptr, old_alloc.size, size.0) }
                    {
                        runner.new_alloc(*id, ptr, size.0)?;
                    }
                }

                Op::DeferFree { id } => {
                    if let Some(alloc) = runner.live.remove(*id) {
                        check_untouched(&alloc)?;
                        fill(&alloc, FREE_POISON_PATTERN);
                        match unsafe { runner.pool.defer_free(alloc.ptr, alloc.size) } {
                            Ok(()) if is_small(alloc.size) => runner.pending.push(alloc),
                            Ok(()) => {}
                            Err(e) => {
                                log::debug!("defer_free failed: {e}");
                                fill(&alloc, LIVE_POISON_PATTERN);
                                runner.live.insert(*id, alloc);
                            }
                        }
                    }
                }

                Op::Drain => {
                    let released = runner.pool.drain_deferred();
                    ensure!(
                        released == runner.pending.len(),
                        "drained {} deferred frees, expected {}",
                        released,
                        runner.pending.len(),
                    );
                    runner.pending.clear();
                }

                Op::Teardown => {
                    runner.pool.teardown();
                    // Pooled blocks are gone now. Large blocks came straight
                    // from the primary allocator and are still ours to free.
                    runner.live.forget_pooled();
                    runner.pending.clear();
                    let stats = runner.pool.stats();
                    ensure!(
                        stats == PoolStats::default(),
                        "pool not reset by teardown: {:?}",
                        stats,
                    );
                }
            }

            let pending = runner.pool.stats().deferred_pending;
            ensure!(
                pending == runner.pending.len(),
                "pool has {} pending deferred frees, expected {}",
                pending,
                runner.pending.len(),
            );
        }

        // Finally, deallocate any remaining live allocations.
        let live = std::mem::take(&mut runner.live.map);
        for (id, alloc) in live {
            runner.dealloc(id, alloc)?;
        }

        Ok(())
    }
}

/// A configuration whose drainer never ticks during a test run.
fn quiet_config() -> Config {
    Config {
        drain_period: Duration::from_secs(24 * 60 * 60),
        ..Config::default()
    }
}

/// The number of bytes the pool actually hands out for a request of `size`.
fn block_len(size: usize) -> usize {
    if is_small(size) {
        round_up(size)
    } else {
        size
    }
}

fn fill(alloc: &LiveAlloc, byte: u8) {
    unsafe { alloc.ptr.as_ptr().write_bytes(byte, alloc.size) };
}

/// Check that nobody else wrote to a live allocation.
fn check_untouched(alloc: &LiveAlloc) -> Result<(), String> {
    let slice = unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), alloc.size) };
    ensure!(
        slice.iter().all(|b| *b == LIVE_POISON_PATTERN),
        "live allocation {:?} was overwritten while it was live",
        alloc,
    );
    Ok(())
}

// We fill our live memory with a poison pattern, and check it is intact
// before freeing, to catch blocks that were handed out twice.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

struct Runner<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    pool: PoolAllocator<A, L>,
    live: LiveMap,

    /// Blocks handed to `defer_free` that the pool must not reuse until the
    /// next drain.
    pending: Vec<LiveAlloc>,
}

impl<A, L> Runner<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// Deallocate the allocation with the given id.
    fn dealloc(&mut self, id: u32, alloc: LiveAlloc) -> Result<(), String> {
        log::debug!("deallocating id{id} -> {alloc:?}");
        check_untouched(&alloc)?;
        fill(&alloc, FREE_POISON_PATTERN);
        unsafe { self.pool.deallocate(alloc.ptr, alloc.size) };
        Ok(())
    }

    /// Process a new allocation, checking properties and inserting it into
    /// the live set.
    fn new_alloc(&mut self, id: u32, ptr: NonNull<u8>, size: usize) -> Result<(), String> {
        if let Some(old_alloc) = self.live.remove(id) {
            self.dealloc(id, old_alloc)?;
        }

        let alloc = LiveAlloc { ptr, size };
        log::debug!("new allocation: id{id} -> {alloc:?}");

        ensure!(
            ptr.as_ptr() as usize % ALIGN == 0,
            "allocation is not {}-byte aligned",
            ALIGN,
        );
        for other in self.live.map.values() {
            ensure!(
                !alloc.overlaps(other),
                "two distinct live allocations should never overlap",
            );
        }
        for other in &self.pending {
            ensure!(
                !alloc.overlaps(other),
                "a block pending a deferred free was reused before the drain",
            );
        }

        fill(&alloc, LIVE_POISON_PATTERN);
        self.live.insert(id, alloc);
        Ok(())
    }
}

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Requested size at allocation time.
    size: usize,
}

impl LiveAlloc {
    fn overlaps(&self, other: &LiveAlloc) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let end = start + block_len(self.size);
        let other_start = other.ptr.as_ptr() as usize;
        let other_end = other_start + block_len(other.size);
        start < other_end && other_start < end
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{:p}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of requested bytes that are currently allocated.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.size;
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    /// Remove a live allocation for deallocation.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.size;
        Some(alloc)
    }

    /// Drop every pooled entry without deallocating it.
    fn forget_pooled(&mut self) {
        self.map.retain(|_, alloc| !is_small(alloc.size));
        self.total_allocated_bytes = self.map.values().map(|a| a.size).sum();
    }
}

/// A system allocator that keeps a running total of its outstanding bytes.
#[derive(Default)]
struct CountingAllocator {
    outstanding: Arc<AtomicUsize>,
}

unsafe impl Allocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let block = Global.allocate(layout)?;
        self.outstanding.fetch_add(layout.size(), Ordering::SeqCst);
        Ok(block)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.outstanding.fetch_sub(layout.size(), Ordering::SeqCst);
        Global.deallocate(ptr, layout);
    }
}
