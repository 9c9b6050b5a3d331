//! Kernel-side memory management for the Corten operating system.
//!
//! The boot path feeds the bootloader-reported memory map into
//! [`memory::heap::KERNEL_HEAP`] exactly once; from then on every subsystem
//! allocates and frees through that handle. Device drivers, descriptor
//! tables, and the console live elsewhere and only see the heap's
//! `allocate`/`free` surface.

#![no_std]

#[cfg(test)]
extern crate alloc;

pub mod memory;
