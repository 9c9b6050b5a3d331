//! The process-wide kernel heap.
//!
//! A [`BitmapBlockAllocator`] guarded by a spin mutex. The allocator itself
//! is single-context by design; the lock is what makes the scan-then-tag and
//! read-tag-then-clear sequences safe once secondary CPUs come up.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use allocator::bitmap_block::{AddRegionError, BitmapBlockAllocator, OutOfMemory, Stats};
use bootinfo::MemoryMap;
use log::{info, warn};
use snafu::{Location, OptionExt as _, ResultExt as _, Snafu};
use spin::Mutex;

use super::GRANULE_BYTES;

/// The kernel heap. Initialized once during boot via [`KernelHeap::init`];
/// never torn down.
pub static KERNEL_HEAP: KernelHeap = KernelHeap::new();

/// Error returned when the heap cannot be brought up from the boot memory
/// map.
#[derive(Debug, Snafu)]
pub enum HeapInitError {
    /// The boot memory map contains no usable range at all.
    #[snafu(display("boot memory map reports no usable region"))]
    NoUsableRegion {
        #[snafu(implicit)]
        location: Location,
    },
    /// The first usable range is too small to host a region.
    #[snafu(display("usable region at {base:#x} rejected: {source}"))]
    RegionRejected {
        /// Base address of the rejected range.
        base: usize,
        #[snafu(source)]
        source: AddRegionError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Spin-guarded heap state plus free-path diagnostics.
pub struct KernelHeap {
    inner: Mutex<BitmapBlockAllocator>,
    /// Frees of pointers the allocator does not own. The free surface stays
    /// infallible for callers, so bad frees are counted here instead of
    /// vanishing.
    invalid_frees: AtomicUsize,
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    /// Creates an empty, uninitialized heap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(BitmapBlockAllocator::new()),
            invalid_frees: AtomicUsize::new(0),
        }
    }

    /// Brings the heap up from the boot memory map.
    ///
    /// The first usable range wins and the scan stops there; any further
    /// usable ranges are ignored. This caps the heap at one physical range
    /// and mirrors the boot protocol contract documented in the memory map.
    ///
    /// # Errors
    ///
    /// Returns [`HeapInitError::NoUsableRegion`] when the map has no usable
    /// entry, or [`HeapInitError::RegionRejected`] when the chosen range is
    /// too small to host a region.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The map's usable ranges describe real, writable RAM that no other
    ///   code is using
    /// - This method is called at most once per heap, before any allocation
    pub unsafe fn init(&self, memory_map: &MemoryMap) -> Result<(), HeapInitError> {
        let entry = memory_map.usable().next().context(NoUsableRegionSnafu)?;
        info!("heap: claiming boot range {entry}");

        let mut heap = self.inner.lock();
        unsafe {
            heap.add_region(
                ptr::with_exposed_provenance_mut(entry.base),
                entry.length,
                GRANULE_BYTES,
            )
        }
        .context(RegionRejectedSnafu { base: entry.base })?;

        let stats = heap.stats();
        info!(
            "heap: {} bytes usable, {} bytes marked used for metadata",
            stats.total_bytes, stats.used_bytes
        );
        Ok(())
    }

    /// Allocates `size` bytes from the heap.
    ///
    /// The returned pointer addresses the first byte of a granule run inside
    /// a registered region; it is never null.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when no region has a sufficient free run.
    /// Callers are expected to degrade gracefully; allocation failure is
    /// never fatal at this layer.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn allocate(&self, size: usize) -> Result<*mut u8, OutOfMemory> {
        self.inner.lock().allocate(size)
    }

    /// Frees the allocation addressed by `ptr`.
    ///
    /// No size is passed; the run extent is recovered from the region
    /// bitmap. A pointer the heap does not own is ignored, counted in
    /// [`invalid_free_count`](Self::invalid_free_count), and logged.
    ///
    /// # Safety
    ///
    /// The caller must ensure `ptr` was returned by
    /// [`allocate`](Self::allocate) on this heap, has not been freed before,
    /// and is no longer in use.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let result = unsafe { self.inner.lock().free(ptr) };
        if let Err(err) = result {
            self.invalid_frees.fetch_add(1, Ordering::Relaxed);
            warn!("heap: ignored invalid free: {err}");
        }
    }

    /// Number of frees rejected by the allocator since boot.
    #[must_use]
    pub fn invalid_free_count(&self) -> usize {
        self.invalid_frees.load(Ordering::Relaxed)
    }

    /// Aggregate usage counters over the heap's regions.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.lock().stats()
    }
}

/// `GlobalAlloc` surface over the kernel heap.
///
/// The bitmap allocator hands out granule-aligned runs, so layouts wanting
/// more than [`GRANULE_BYTES`] alignment are refused. The impl is not
/// registered as `#[global_allocator]` here; wiring it up is the kernel
/// image's decision.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > GRANULE_BYTES {
            return ptr::null_mut();
        }
        self.inner
            .lock()
            .allocate(layout.size())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) };
    }
}

#[cfg(test)]
mod tests {
    use core::ops::Range;

    use bootinfo::{MemoryMapEntry, RegionKind};

    use super::*;

    fn with_backing<F>(size: usize, test_fn: F)
    where
        F: FnOnce(usize),
    {
        unsafe {
            let layout = Layout::from_size_align(size, 16).unwrap();
            let backing = alloc::alloc::alloc(layout);
            backing.write_bytes(0x11, size);
            test_fn(backing.expose_provenance());
            alloc::alloc::dealloc(backing, layout);
        }
    }

    fn with_boot_heap<F>(size: usize, test_fn: F)
    where
        F: FnOnce(&KernelHeap, Range<usize>),
    {
        with_backing(size, |base| {
            let mut map = MemoryMap::new();
            map.push(MemoryMapEntry::new(base, size, RegionKind::Usable))
                .unwrap();

            let heap = KernelHeap::new();
            unsafe { heap.init(&map).unwrap() };
            test_fn(&heap, base..base + size);
        });
    }

    #[test]
    fn init_registers_first_usable_range_only() {
        with_backing(4096, |first_base| {
            with_backing(4096, |second_base| {
                let mut map = MemoryMap::new();
                map.push(MemoryMapEntry::new(0, 0x9_f000, RegionKind::Reserved))
                    .unwrap();
                map.push(MemoryMapEntry::new(first_base, 4096, RegionKind::Usable))
                    .unwrap();
                map.push(MemoryMapEntry::new(second_base, 4096, RegionKind::Usable))
                    .unwrap();

                let heap = KernelHeap::new();
                unsafe { heap.init(&map).unwrap() };

                // One region: the second usable range was never registered.
                assert_eq!(heap.stats().regions, 1);

                let ptr = heap.allocate(64).unwrap();
                let first_range = first_base..first_base + 4096;
                assert!(first_range.contains(&ptr.addr()));
            });
        });
    }

    #[test]
    fn init_without_usable_range_fails() {
        let mut map = MemoryMap::new();
        map.push(MemoryMapEntry::new(0, 0x9_f000, RegionKind::Reserved))
            .unwrap();
        map.push(MemoryMapEntry::new(0xfec0_0000, 0x1000, RegionKind::Nvs))
            .unwrap();

        let heap = KernelHeap::new();
        let result = unsafe { heap.init(&map) };
        assert!(matches!(result, Err(HeapInitError::NoUsableRegion { .. })));
    }

    #[test]
    fn init_rejects_usable_range_too_small_for_a_region() {
        with_backing(64, |base| {
            let mut map = MemoryMap::new();
            map.push(MemoryMapEntry::new(base, 64, RegionKind::Usable))
                .unwrap();

            let heap = KernelHeap::new();
            let result = unsafe { heap.init(&map) };
            assert!(matches!(result, Err(HeapInitError::RegionRejected { .. })));
        });
    }

    #[test]
    fn allocate_and_free_round_trip() {
        with_boot_heap(4096, |heap, _| {
            let baseline = heap.stats().used_bytes;

            let ptr = heap.allocate(100).unwrap();
            assert!(!ptr.is_null());
            assert!(heap.stats().used_bytes > baseline);

            unsafe { heap.free(ptr) };
            assert_eq!(heap.stats().used_bytes, baseline);
            assert_eq!(heap.invalid_free_count(), 0);
        });
    }

    #[test]
    fn allocation_failure_is_an_error_not_a_panic() {
        with_boot_heap(1024, |heap, _| {
            assert!(heap.allocate(4096).is_err());
            // The heap stays serviceable after the failure.
            heap.allocate(16).unwrap();
        });
    }

    #[test]
    fn invalid_free_is_counted_not_fatal() {
        with_boot_heap(4096, |heap, _| {
            let mut outside = 0_u8;
            unsafe { heap.free(&raw mut outside) };
            assert_eq!(heap.invalid_free_count(), 1);

            // The heap keeps working after the bad free.
            let ptr = heap.allocate(32).unwrap();
            unsafe { heap.free(ptr) };
            assert_eq!(heap.invalid_free_count(), 1);
        });
    }

    #[test]
    fn global_alloc_respects_granule_alignment() {
        with_boot_heap(4096, |heap, _| {
            let too_aligned = Layout::from_size_align(64, 32).unwrap();
            let ptr = unsafe { GlobalAlloc::alloc(heap, too_aligned) };
            assert!(ptr.is_null());

            let layout = Layout::from_size_align(24, 8).unwrap();
            let ptr = unsafe { GlobalAlloc::alloc(heap, layout) };
            assert!(!ptr.is_null());
            assert_eq!(ptr.addr() % GRANULE_BYTES, 0);
            unsafe { GlobalAlloc::dealloc(heap, ptr, layout) };
        });
    }
}
