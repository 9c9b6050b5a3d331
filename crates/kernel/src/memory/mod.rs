//! Memory management.

pub mod heap;

/// Size of one heap granule in bytes. One bitmap byte tracks one granule, so
/// this is both the allocation quantum and the metadata ratio.
pub const GRANULE_BYTES: usize = 16;
const _: () = assert!(GRANULE_BYTES.is_power_of_two());
