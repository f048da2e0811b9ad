//! Intrusive bookkeeping threaded through the pool's own memory.
//!
//! This module is the pool's unsafe boundary. Free blocks store the link to
//! the next free block of their size class in their first word; raw chunks
//! store a small [`ChunkHeader`] in their first bytes. While a block is
//! handed out to a caller those bytes are the caller's payload, so every
//! push here requires the caller to guarantee that nobody else is using the
//! block anymore.

use core::{mem, ptr::NonNull};

use crate::size_class::{round_up, ALIGN};

/// The link stored in a free block's first word.
#[repr(C)]
struct Link {
    next: Option<NonNull<Link>>,
}

const _: () = assert!(mem::size_of::<Link>() <= ALIGN);
const _: () = assert!(mem::align_of::<Link>() <= ALIGN);

/// A LIFO list of free blocks that all belong to one size class.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<NonNull<Link>>,
    len: usize,
}

// Safety: the list exclusively owns the free blocks it links together, and
// they are only touched through `&mut FreeList`.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList { head: None, len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Push a free block onto the head of this list.
    ///
    /// ### Safety
    ///
    /// * `block` must be valid for writes of at least `ALIGN` bytes and be
    ///   `ALIGN`-aligned.
    ///
    /// * `block` must not be in any free list, and nothing else may read or
    ///   write it until it is popped again.
    #[inline]
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        debug_assert_eq!(block.as_ptr() as usize % ALIGN, 0);
        let link = block.cast::<Link>();
        link.as_ptr().write(Link { next: self.head });
        self.head = Some(link);
        self.len += 1;
    }

    /// Push `count` contiguous blocks of `block_size` bytes, starting at
    /// `start`, so that they are popped in address order.
    ///
    /// ### Safety
    ///
    /// Every block in the run must satisfy [`FreeList::push`]'s requirements.
    pub(crate) unsafe fn push_run(&mut self, start: NonNull<u8>, block_size: usize, count: usize) {
        debug_assert_eq!(block_size % ALIGN, 0);
        for i in (0..count).rev() {
            self.push(start.add(i * block_size));
        }
    }

    /// Unlink and return the most recently pushed block, if any.
    #[inline]
    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        let link = self.head?;
        // Safety: blocks only enter the list through `push`, which requires
        // that the block stays ours and that its first word holds a `Link`.
        self.head = unsafe { link.as_ptr().read().next };
        self.len -= 1;
        Some(link.cast())
    }

    /// Forget every block in this list without touching their memory.
    pub(crate) fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }
}

/// The unused tail of the most recently obtained chunk, `[cursor, cursor +
/// remaining)`.
#[derive(Debug)]
pub(crate) struct Arena {
    cursor: NonNull<u8>,
    remaining: usize,
}

// Safety: the arena range is exclusively owned by the pool and only carved
// through `&mut Arena`.
unsafe impl Send for Arena {}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub(crate) const fn new() -> Self {
        Arena {
            cursor: NonNull::dangling(),
            remaining: 0,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    /// Replace the arena wholesale with `[start, start + len)`.
    ///
    /// ### Safety
    ///
    /// The range must be valid for reads and writes, `ALIGN`-aligned, and
    /// owned by the pool with no outstanding users.
    pub(crate) unsafe fn reset(&mut self, start: NonNull<u8>, len: usize) {
        debug_assert_eq!(start.as_ptr() as usize % ALIGN, 0);
        debug_assert_eq!(len % ALIGN, 0);
        self.cursor = start;
        self.remaining = len;
    }

    /// Carve `bytes` off the front of the arena.
    pub(crate) fn carve(&mut self, bytes: usize) -> NonNull<u8> {
        assert!(bytes <= self.remaining);
        let block = self.cursor;
        // Safety: `bytes` is within the arena's range, so the new cursor is at
        // most one past its end.
        self.cursor = unsafe { self.cursor.add(bytes) };
        self.remaining -= bytes;
        block
    }

    /// Take whatever is left of the arena, leaving it empty.
    pub(crate) fn take_rest(&mut self) -> Option<(NonNull<u8>, usize)> {
        if self.remaining == 0 {
            return None;
        }
        let rest = (self.cursor, self.remaining);
        *self = Arena::new();
        Some(rest)
    }

    pub(crate) fn clear(&mut self) {
        *self = Arena::new();
    }
}

/// The header written at the start of every raw chunk.
#[repr(C)]
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    size: usize,
}

/// The number of bytes at the start of every chunk reserved for its
/// [`ChunkHeader`].
pub(crate) const CHUNK_RESERVE: usize = round_up(mem::size_of::<ChunkHeader>());

const _: () = assert!(mem::align_of::<ChunkHeader>() <= ALIGN);

/// Every raw chunk the pool has obtained from the primary allocator, kept so
/// that they can all be returned on teardown.
#[derive(Debug, Default)]
pub(crate) struct ChunkLedger {
    head: Option<NonNull<ChunkHeader>>,
    chunks: usize,
    bytes: usize,
}

// Safety: the ledger exclusively owns the chunk headers it links together.
unsafe impl Send for ChunkLedger {}

impl ChunkLedger {
    pub(crate) const fn new() -> Self {
        ChunkLedger {
            head: None,
            chunks: 0,
            bytes: 0,
        }
    }

    /// The number of chunks recorded.
    pub(crate) fn chunks(&self) -> usize {
        self.chunks
    }

    /// The total size of all recorded chunks.
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    /// Record a freshly obtained chunk of `size` bytes, writing its header,
    /// and return the chunk's usable region past [`CHUNK_RESERVE`].
    ///
    /// ### Safety
    ///
    /// `chunk` must be valid for writes of `size` bytes, `ALIGN`-aligned,
    /// and not already recorded. `size` must be at least `CHUNK_RESERVE`.
    pub(crate) unsafe fn record(&mut self, chunk: NonNull<u8>, size: usize) -> (NonNull<u8>, usize) {
        debug_assert!(size >= CHUNK_RESERVE);
        let header = chunk.cast::<ChunkHeader>();
        header.as_ptr().write(ChunkHeader {
            next: self.head,
            size,
        });
        self.head = Some(header);
        self.chunks += 1;
        self.bytes += size;
        (chunk.add(CHUNK_RESERVE), size - CHUNK_RESERVE)
    }

    /// Unlink the most recently recorded chunk, returning its start and size.
    pub(crate) fn pop(&mut self) -> Option<(NonNull<u8>, usize)> {
        let header = self.head?;
        // Safety: headers only enter the ledger through `record`, and the
        // header bytes are never handed out to callers.
        let ChunkHeader { next, size } = unsafe { header.as_ptr().read() };
        self.head = next;
        self.chunks -= 1;
        self.bytes -= size;
        Some((header.cast(), size))
    }
}
