//! Bitmap block allocator implementation.
//!
//! This module provides a region-based heap allocator that subdivides each
//! registered memory region into fixed-size granules and tracks every granule
//! with one byte of in-region metadata. Allocations carry no header of their
//! own; the extent of an allocation is recovered at free time from a run
//! coloring scheme over the bitmap.
//!
//! # Algorithm
//!
//! - **Regions**: registered ranges are kept in a singly-linked list, most
//!   recently added first. Each region is self-describing: a header at its
//!   start, followed by the bitmap, followed by the granule data.
//! - **Allocation**: regions are tried in list order. A region that passes a
//!   capacity pre-check is scanned circularly, first-fit, starting just past
//!   the per-region scan cursor. A free run of exactly the rounded-up length
//!   is colored with a tag that differs from both of its bitmap neighbours.
//! - **Deallocation**: the owning region is found by address containment, the
//!   granule index by byte offset, and the run extent by scanning forward
//!   while the tag repeats. No size parameter is needed.
//!
//! # Memory Layout
//!
//! ```text
//! Region Layout:
//! ┌──────────────────┬────────────────────────────────────────────────┐
//! │ RegionHeader     │ granule data (total_bytes / granule_bytes      │
//! │ (48 bytes)       │ granules, starting at the data origin)         │
//! └──────────────────┴────────────────────────────────────────────────┘
//!                    └─ the bitmap (one byte per granule) lives at the
//!                       data origin; the leading granules that it covers
//!                       are permanently reserved (tag 5)
//! ```
//!
//! Cell values: `0` is free, `5` is permanently reserved for the bitmap's own
//! storage, and any other value is the coloring tag shared by all granules of
//! one live allocation. Because a run's tag always differs from the cell on
//! each side of it, two adjacent runs can never blur into one at free time.
//!
//! # Thread Safety
//!
//! The allocator is `Send` but not `Sync`. It can be moved between threads
//! but requires external synchronization for concurrent access.

use core::ptr;

use snafu::{Location, Snafu};

/// Bitmap cell value for a free granule.
const FREE_CELL: u8 = 0;
/// Bitmap cell value for a granule permanently reserved for the bitmap's own
/// storage. Never allocated, never cleared.
const RESERVED_CELL: u8 = 5;

/// Error returned when a memory range is too small to become a region.
#[derive(Debug, Snafu)]
pub enum AddRegionError {
    /// The range cannot hold the region header, the bitmap, and at least one
    /// allocatable granule.
    #[snafu(display(
        "region of {length} bytes cannot hold a header, its bitmap, and at least one {granule_bytes}-byte granule"
    ))]
    RegionTooSmall {
        /// Length of the rejected range, in bytes.
        length: usize,
        /// Granule size the range was registered with.
        granule_bytes: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Error returned when no region has a free run large enough for a request.
///
/// Allocation failure is recoverable; callers are expected to degrade
/// gracefully rather than treat this as fatal.
#[derive(Debug, Snafu)]
#[snafu(display("out of memory: no region has a free run for {requested} bytes"))]
pub struct OutOfMemory {
    /// Requested allocation size, in bytes.
    requested: usize,
    #[snafu(implicit)]
    location: Location,
}

/// Error returned when a freed pointer cannot be resolved to a live run.
#[derive(Debug, Snafu)]
pub enum FreeError {
    /// The pointer lies outside every registered region.
    #[snafu(display("pointer {addr:#x} is not owned by any heap region"))]
    UnownedPointer {
        /// Address of the rejected pointer.
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The pointer resolves to a granule that is free or reserved, not part
    /// of a live allocation.
    #[snafu(display("pointer {addr:#x} does not address an allocated granule"))]
    NotAllocated {
        /// Address of the rejected pointer.
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Aggregate usage counters over all registered regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Number of registered regions.
    pub regions: usize,
    /// Sum of the regions' usable spans, in bytes (headers excluded).
    pub total_bytes: usize,
    /// Bytes covered by granules currently marked used, reserved granules
    /// included.
    pub used_bytes: usize,
}

/// State of one bitmap cell, decoded from its single-byte encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    /// The granule is free.
    Free,
    /// The granule holds part of the bitmap itself and is never handed out.
    Reserved,
    /// The granule belongs to the live run colored with this tag.
    Allocated(u8),
}

impl Cell {
    fn decode(raw: u8) -> Self {
        match raw {
            FREE_CELL => Self::Free,
            RESERVED_CELL => Self::Reserved,
            tag => Self::Allocated(tag),
        }
    }

    fn encode(self) -> u8 {
        match self {
            Self::Free => FREE_CELL,
            Self::Reserved => RESERVED_CELL,
            Self::Allocated(tag) => tag,
        }
    }
}

/// Header written at the start of every registered region.
///
/// The bitmap begins immediately after the header and shares its origin with
/// the granule data, so the header alignment also fixes the data alignment.
#[repr(C, align(16))]
struct RegionHeader {
    /// Next region in the list, or null for the last region.
    next: *mut RegionHeader,
    /// Usable span in bytes, header excluded. Fixed at registration.
    total_bytes: usize,
    /// Granule size in bytes. Fixed at registration.
    granule_bytes: usize,
    /// Granules currently marked non-free, reserved granules included.
    used_granules: usize,
    /// Scan cursor: index of a granule near the most recent allocation. Used
    /// only as a starting point for the next search, not correctness-bearing.
    last_free_hint: usize,
}
const _: () = assert!(size_of::<RegionHeader>() % align_of::<RegionHeader>() == 0);

impl RegionHeader {
    /// Returns the data origin: the first byte past the header, where both
    /// the bitmap and granule 0 begin.
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header.
    unsafe fn data_origin(region: *mut Self) -> *mut u8 {
        assert!(!region.is_null(), "Region must not be null");
        unsafe { region.add(1).cast() }
    }

    /// Number of granules tracked by this region's bitmap.
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header.
    unsafe fn granule_count(region: *mut Self) -> usize {
        unsafe { (*region).total_bytes / (*region).granule_bytes }
    }

    /// Returns the address of granule `index`'s first byte.
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header and `index` must
    /// be within the region's granule count.
    unsafe fn granule_ptr(region: *mut Self, index: usize) -> *mut u8 {
        unsafe {
            assert!(index < Self::granule_count(region));
            Self::data_origin(region).add(index * (*region).granule_bytes)
        }
    }

    /// Reads the bitmap cell for granule `index`.
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header and `index` must
    /// be within the region's granule count.
    unsafe fn cell(region: *mut Self, index: usize) -> Cell {
        unsafe {
            assert!(index < Self::granule_count(region));
            Cell::decode(Self::data_origin(region).add(index).read())
        }
    }

    /// Writes the bitmap cell for granule `index`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Self::cell`].
    unsafe fn set_cell(region: *mut Self, index: usize, cell: Cell) {
        unsafe {
            assert!(index < Self::granule_count(region));
            Self::data_origin(region).add(index).write(cell.encode());
        }
    }

    /// Returns whether `addr` falls inside this region's granule data span.
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header.
    unsafe fn contains(region: *mut Self, addr: usize) -> bool {
        unsafe {
            let start = Self::data_origin(region).addr();
            let end = start + Self::granule_count(region) * (*region).granule_bytes;
            (start..end).contains(&addr)
        }
    }

    /// Picks a coloring tag for a new run at `start..start + len`.
    ///
    /// The tag is the smallest value above the left neighbour's cell that
    /// collides with neither neighbour nor the free and reserved markers,
    /// wrapping through the byte range. This is the only property `free`
    /// relies on to recover a run's extent.
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header; the run must lie
    /// within the region's granule count and `start` must be non-zero
    /// (granule 0 is always reserved, so a run can never begin there).
    unsafe fn assign_tag(region: *mut Self, start: usize, len: usize) -> u8 {
        unsafe {
            assert!(start > 0, "granule 0 is always reserved");
            let left = Self::cell(region, start - 1).encode();
            // A run ending at the region's last granule has no right
            // neighbour; it compares as free.
            let right = if start + len < Self::granule_count(region) {
                Self::cell(region, start + len).encode()
            } else {
                FREE_CELL
            };

            let mut tag = left.wrapping_add(1);
            while tag == right || tag == FREE_CELL || tag == RESERVED_CELL {
                tag = tag.wrapping_add(1);
            }
            tag
        }
    }

    /// Attempts to allocate `size` bytes from this region.
    ///
    /// Performs the capacity pre-check, then a circular first-fit scan of the
    /// bitmap starting just past `last_free_hint`. The pre-check compares
    /// total free bytes, not contiguous free bytes, so a region that passes
    /// it can still fail the scan under fragmentation; the caller then moves
    /// on to the next region.
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header and `size` must be
    /// greater than zero.
    unsafe fn try_allocate(region: *mut Self, size: usize) -> Option<*mut u8> {
        unsafe {
            let granule_bytes = (*region).granule_bytes;
            if (*region).total_bytes - (*region).used_granules * granule_bytes < size {
                return None;
            }

            let count = Self::granule_count(region);
            let needed = size.div_ceil(granule_bytes);
            let hint = (*region).last_free_hint;

            // The scan stops on returning to the hint. The cell budget bounds
            // it to one full circle even when the skip below jumps over the
            // hint or the hint sits at index 0.
            let mut x = if hint + 1 >= count { 0 } else { hint + 1 };
            let mut budget = count;
            while x != hint && budget > 0 {
                if Self::cell(region, x) != Cell::Free {
                    x += 1;
                    budget -= 1;
                    if x >= count {
                        x = 0;
                    }
                    continue;
                }

                // Length of the free run starting at `x`. Runs never wrap
                // around the end of the bitmap.
                let mut run = 0;
                while run < needed && x + run < count && Self::cell(region, x + run) == Cell::Free {
                    run += 1;
                }

                if run == needed {
                    let tag = Self::assign_tag(region, x, needed);
                    for offset in 0..needed {
                        Self::set_cell(region, x + offset, Cell::Allocated(tag));
                    }
                    // Deliberately lands on the run's last granule rather
                    // than one past it, so sequential allocation patterns
                    // resume scanning right at the frontier.
                    (*region).last_free_hint = x + needed - 2;
                    (*region).used_granules += needed;
                    return Some(Self::granule_ptr(region, x));
                }

                x += run;
                budget = budget.saturating_sub(run);
                if x >= count {
                    x = 0;
                }
            }

            None
        }
    }

    /// Frees the run addressed by `addr`, returning the number of granules
    /// cleared.
    ///
    /// The scan is forward-only: a pointer into the interior of a run clears
    /// only the suffix from that granule onward and leaves the head marked
    /// used (see the module documentation).
    ///
    /// # Safety
    ///
    /// `region` must point to an initialized region header whose data span
    /// contains `addr`.
    unsafe fn free_at(region: *mut Self, addr: usize) -> Result<usize, FreeError> {
        unsafe {
            let offset = addr - Self::data_origin(region).addr();
            let index = offset / (*region).granule_bytes;
            let count = Self::granule_count(region);

            let tag = match Self::cell(region, index) {
                Cell::Allocated(tag) => tag,
                // Free or reserved granules are never cleared; clearing from
                // a reserved granule would eat the bitmap's own storage.
                Cell::Free | Cell::Reserved => return NotAllocatedSnafu { addr }.fail(),
            };

            let mut x = index;
            while x < count && Self::cell(region, x) == Cell::Allocated(tag) {
                Self::set_cell(region, x, Cell::Free);
                x += 1;
            }

            let cleared = x - index;
            (*region).used_granules -= cleared;
            Ok(cleared)
        }
    }
}

/// A bitmap block allocator managing a list of self-describing regions.
///
/// Regions are registered once, from bootloader-reported usable RAM ranges,
/// and live for the process lifetime; they are never merged, split, or
/// released. Within each region a one-byte-per-granule bitmap records which
/// granules are free, reserved, or part of a colored allocation run.
///
/// # Algorithm
///
/// - **Allocation**: first region in list order that passes a free-capacity
///   pre-check is scanned circularly, first-fit. If the scan fails because
///   the free space is fragmented, the search falls through to the next
///   region instead of giving up.
/// - **Deallocation**: the owning region is found by address containment and
///   the run extent recovered by scanning forward over equal tags.
///
/// # Thread Safety
///
/// This allocator is `Send` but not `Sync`. It can be moved between threads
/// but requires external synchronization for concurrent access.
pub struct BitmapBlockAllocator {
    head: *mut RegionHeader,
}

unsafe impl Send for BitmapBlockAllocator {}

impl Default for BitmapBlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapBlockAllocator {
    /// Creates an empty [`BitmapBlockAllocator`].
    ///
    /// The allocator starts with no regions. Use
    /// [`add_region`](Self::add_region) to register memory before attempting
    /// allocations.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Registers a new region with the allocator.
    ///
    /// The region base is aligned up to the header alignment and the length
    /// reduced accordingly. A header is written at the aligned base, the
    /// bitmap is cleared, and the leading granules covering the bitmap's own
    /// footprint are permanently reserved. The new region is placed at the
    /// front of the region list.
    ///
    /// Overlapping or duplicate ranges are not detected; the caller must pass
    /// disjoint ranges.
    ///
    /// # Errors
    ///
    /// Returns [`AddRegionError::RegionTooSmall`] when the range cannot hold
    /// the header, the bitmap, and at least one allocatable granule.
    ///
    /// # Panics
    ///
    /// Panics if `granule_bytes` is zero.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The range `base..base + length` is valid for reads and writes
    /// - The memory is not in use by any other allocator or code
    /// - The memory remains valid for the lifetime of this allocator
    /// - This method is not called concurrently with other allocator
    ///   operations
    pub unsafe fn add_region(
        &mut self,
        base: *mut u8,
        length: usize,
        granule_bytes: usize,
    ) -> Result<(), AddRegionError> {
        assert!(granule_bytes > 0, "granule size must be greater than zero");

        // The header must land on its own alignment; the usable span shrinks
        // by whatever the fixup consumes.
        let align_offset = base.align_offset(align_of::<RegionHeader>());
        let base = base.map_addr(|addr| addr + align_offset);
        let aligned_length = length.saturating_sub(align_offset);

        let total_bytes = aligned_length.saturating_sub(size_of::<RegionHeader>());
        let granule_count = total_bytes / granule_bytes;
        // The bitmap needs one byte per granule; the granules holding those
        // bytes are reserved up front.
        let reserved = granule_count.div_ceil(granule_bytes);
        if granule_count == 0 || reserved >= granule_count {
            return RegionTooSmallSnafu {
                length,
                granule_bytes,
            }
            .fail();
        }

        #[expect(clippy::cast_ptr_alignment)]
        let region = base.cast::<RegionHeader>();
        unsafe {
            region.write(RegionHeader {
                next: self.head,
                total_bytes,
                granule_bytes,
                used_granules: reserved,
                last_free_hint: reserved - 1,
            });
            let bitmap = RegionHeader::data_origin(region);
            ptr::write_bytes(bitmap, FREE_CELL, granule_count);
            ptr::write_bytes(bitmap, RESERVED_CELL, reserved);
        }
        self.head = region;

        Ok(())
    }

    /// Allocates `size` bytes, rounded up to whole granules.
    ///
    /// Regions are tried in list order (most recently registered first); a
    /// region whose free space is fragmented is skipped in favour of later
    /// regions. The returned pointer addresses the first byte of the run's
    /// first granule.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when no region has a sufficient free run.
    /// Failure leaves the allocator state untouched.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, OutOfMemory> {
        assert!(size > 0, "allocation size must be greater than zero");

        let mut region = self.head;
        while !region.is_null() {
            unsafe {
                if let Some(data) = RegionHeader::try_allocate(region, size) {
                    return Ok(data);
                }
                region = (*region).next;
            }
        }

        OutOfMemorySnafu { requested: size }.fail()
    }

    /// Frees the allocation addressed by `ptr`, returning the number of
    /// granules cleared.
    ///
    /// No size is passed in; the run's extent is recovered from the bitmap
    /// coloring. The recovery scan is forward-only, so a pointer into the
    /// interior of a run clears only the suffix from that granule onward and
    /// leaks the head (a documented limitation of the coloring scheme; pass
    /// the exact pointer returned by [`allocate`](Self::allocate)).
    ///
    /// # Errors
    ///
    /// - [`FreeError::UnownedPointer`] when no region contains `ptr`
    /// - [`FreeError::NotAllocated`] when the addressed granule is free or
    ///   reserved
    ///
    /// Either error leaves the allocator state untouched.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by [`allocate`](Self::allocate) on this allocator
    ///   and has not been freed before, or points outside every region (in
    ///   which case the call reports an error without touching memory)
    /// - The allocation is no longer in use
    /// - This method is not called concurrently with other allocator
    ///   operations
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<usize, FreeError> {
        let addr = ptr.addr();

        let mut region = self.head;
        while !region.is_null() {
            unsafe {
                if RegionHeader::contains(region, addr) {
                    return RegionHeader::free_at(region, addr);
                }
                region = (*region).next;
            }
        }

        UnownedPointerSnafu { addr }.fail()
    }

    /// Returns aggregate usage counters over all regions.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        let mut region = self.head;
        while !region.is_null() {
            unsafe {
                stats.regions += 1;
                stats.total_bytes += (*region).total_bytes;
                stats.used_bytes += (*region).used_granules * (*region).granule_bytes;
                region = (*region).next;
            }
        }
        stats
    }
}
