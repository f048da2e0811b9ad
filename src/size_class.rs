//! Build-time size-class configuration.
//!
//! Small requests are rounded up to a multiple of [`ALIGN`] and grouped into
//! [`NUM_SIZE_CLASSES`] buckets, one free list per bucket:
//!
//! | bucket | 0 | 1  | 2  | ... | 15  |
//! |--------|---|----|----|-----|-----|
//! | size   | 8 | 16 | 24 | ... | 128 |
//!
//! Anything larger than [`MAX_SMALL_OBJECT`] bypasses the pool entirely.

use core::time::Duration;

/// Rounding granularity, minimum block size, and the alignment of every
/// pooled block.
pub const ALIGN: usize = 8;

/// The largest request served from the pool's free lists.
pub const MAX_SMALL_OBJECT: usize = 128;

/// The number of size classes, and therefore free lists.
pub const NUM_SIZE_CLASSES: usize = MAX_SMALL_OBJECT / ALIGN;

/// How many blocks a refill tries to carve from the arena at once.
pub const DEFAULT_REFILL_COUNT: usize = 20;

/// How often the background drainer flushes the deferred-free queue.
pub const DEFAULT_DRAIN_PERIOD: Duration = Duration::from_secs(10);

/// Round `bytes` up to the next multiple of [`ALIGN`].
///
/// Zero rounds up to [`ALIGN`] so that every request gets a real block.
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    if bytes == 0 {
        return ALIGN;
    }
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// The size class, i.e. free-list index, for a small request of `bytes`.
///
/// `bytes` must not exceed [`MAX_SMALL_OBJECT`].
#[inline]
pub const fn free_list_index(bytes: usize) -> usize {
    debug_assert!(bytes <= MAX_SMALL_OBJECT);
    round_up(bytes) / ALIGN - 1
}

/// The block size served by the given size class.
#[inline]
pub const fn class_size(index: usize) -> usize {
    debug_assert!(index < NUM_SIZE_CLASSES);
    (index + 1) * ALIGN
}

/// Is a request of `bytes` served from the pool, rather than passed through
/// to the primary allocator?
#[inline]
pub const fn is_small(bytes: usize) -> bool {
    bytes <= MAX_SMALL_OBJECT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_cover_eight_byte_steps() {
        for (index, size) in (ALIGN..=MAX_SMALL_OBJECT).step_by(ALIGN).enumerate() {
            assert_eq!(free_list_index(size), index);
            assert_eq!(class_size(index), size);
        }
        assert_eq!(NUM_SIZE_CLASSES, 16);
    }

    #[test]
    fn every_small_size_maps_to_its_rounded_bucket() {
        for size in 1..=MAX_SMALL_OBJECT {
            let expected = (round_up(size) + ALIGN - 1) / ALIGN - 1;
            assert_eq!(free_list_index(size), expected, "size = {size}");
            assert!(class_size(free_list_index(size)) >= size);
            assert!(class_size(free_list_index(size)) - size < ALIGN);
        }
    }

    #[test]
    fn ten_bytes_rounds_to_sixteen() {
        assert_eq!(round_up(10), 16);
        assert_eq!(free_list_index(10), 1);
        assert!(!is_small(130));
        assert!(is_small(128));
    }

    #[test]
    fn zero_is_served_by_the_smallest_class() {
        assert_eq!(round_up(0), ALIGN);
        assert_eq!(free_list_index(0), 0);
    }
}
