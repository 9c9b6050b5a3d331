//! Memory allocator implementations for the Corten operating system.
//!
//! This crate provides the kernel heap allocator: a bitmap-colored block
//! allocator that carves caller-supplied memory regions into fixed-size
//! granules. It is `no_std` compatible and designed to run in bare-metal
//! environments, before any general-purpose allocator exists.
//!
//! # Available Allocators
//!
//! ## [`BitmapBlockAllocator`](bitmap_block::BitmapBlockAllocator)
//!
//! A region-based allocator that tracks every granule with a single byte of
//! in-region metadata. Best suited for:
//!
//! - Early-boot heaps built directly on bootloader-reported RAM ranges
//! - Deallocation without a size parameter (the run length is recovered from
//!   the bitmap coloring)
//! - Constant per-allocation metadata overhead (no header inside the
//!   allocated run)
//!
//! **Performance**: O(n) allocation where n is the number of granules in a
//! region, amortized by a per-region scan cursor; O(k) deallocation where k
//! is the run length.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::bitmap_block::BitmapBlockAllocator;
//!
//! // Create the allocator and hand it a memory region. In the kernel the
//! // region comes from the boot memory map; here it is plain heap memory.
//! let mut backing = vec![0_u8; 4096];
//! let mut heap = BitmapBlockAllocator::new();
//! unsafe {
//!     heap.add_region(backing.as_mut_ptr(), backing.len(), 16).unwrap();
//! }
//!
//! // Allocate memory. No layout is involved; sizes are rounded up to whole
//! // granules.
//! let data = heap.allocate(100).unwrap();
//!
//! // Free it again. The run length is recovered from the bitmap, so no
//! // size is passed back in.
//! unsafe {
//!     heap.free(data).unwrap();
//! }
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! Region registration and deallocation require `unsafe` code. Users must
//! ensure:
//!
//! - Registered regions are valid, disjoint, and exclusive to the allocator
//! - Freed pointers were returned by [`allocate`] on the same allocator
//! - No use-after-free bugs
//!
//! [`allocate`]: bitmap_block::BitmapBlockAllocator::allocate
//!
//! ## Thread Safety
//!
//! The allocator is `Send` but not `Sync`. It can be moved between threads
//! but requires external synchronization (e.g. a spin mutex) for concurrent
//! access; the bitmap read-modify-write sequences are not atomic.

#![no_std]

pub mod bitmap_block;
