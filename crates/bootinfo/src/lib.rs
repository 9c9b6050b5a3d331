//! Boot-time hardware descriptors for the Corten operating system.
//!
//! The bootloader hands the kernel a map of physical memory: a sequence of
//! `(base, length, kind)` tuples discovered before any allocator exists. This
//! crate models that map so the memory subsystem can consume it without
//! caring which bootloader produced it.
//!
//! The map is enumerated exactly once during early boot; afterwards the heap
//! operates purely on its own state and never returns to the descriptors.

#![no_std]

use core::ops::Range;

use arrayvec::ArrayVec;
use derive_more::Display;
use snafu::{Location, Snafu};

/// Maximum number of entries a [`MemoryMap`] can hold.
pub const MAX_ENTRIES: usize = 128;

/// Error returned when pushing an entry into a full [`MemoryMap`].
#[derive(Debug, Snafu)]
#[snafu(display("boot memory map is full ({capacity} entries)"))]
pub struct MemoryMapFullError {
    capacity: usize,
    #[snafu(implicit)]
    location: Location,
}

/// Classification of one physical memory range, as reported by the
/// bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RegionKind {
    /// RAM available for general use.
    #[display("usable")]
    Usable,
    /// Reserved by firmware or devices; never touched.
    #[display("reserved")]
    Reserved,
    /// Holds ACPI tables; reclaimable once they have been parsed.
    #[display("acpi")]
    AcpiReclaimable,
    /// ACPI non-volatile storage; must be preserved across sleep states.
    #[display("nvs")]
    Nvs,
    /// Reported defective by the firmware memory test.
    #[display("defective")]
    Defective,
}

impl RegionKind {
    /// Maps a multiboot-style type code to a region kind.
    ///
    /// Unknown codes are treated as reserved; claiming unknown memory is
    /// never safe.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::Nvs,
            5 => Self::Defective,
            _ => Self::Reserved,
        }
    }

    /// Returns whether memory of this kind may be claimed for the heap.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

/// One contiguous physical memory range from the boot memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("{base:#x}+{length:#x} {kind}")]
pub struct MemoryMapEntry {
    /// Physical base address of the range.
    pub base: usize,
    /// Length of the range in bytes.
    pub length: usize,
    /// Bootloader-reported classification.
    pub kind: RegionKind,
}

impl MemoryMapEntry {
    /// Creates a new entry.
    #[must_use]
    pub const fn new(base: usize, length: usize, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Returns the address range this entry covers.
    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.base..self.base + self.length
    }

    /// Returns whether this range may be claimed for the heap.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.kind.is_usable()
    }
}

/// The boot memory map: bootloader-reported ranges in report order.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    entries: ArrayVec<MemoryMapEntry, MAX_ENTRIES>,
}

impl MemoryMap {
    /// Creates an empty memory map.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new_const(),
        }
    }

    /// Appends an entry, preserving report order.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryMapFullError`] when the map already holds
    /// [`MAX_ENTRIES`] entries.
    pub fn push(&mut self, entry: MemoryMapEntry) -> Result<(), MemoryMapFullError> {
        if self.entries.try_push(entry).is_err() {
            return MemoryMapFullSnafu {
                capacity: MAX_ENTRIES,
            }
            .fail();
        }
        Ok(())
    }

    /// Iterates over all entries in report order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.entries.iter()
    }

    /// Iterates over the usable entries in report order.
    pub fn usable(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.iter().filter(|entry| entry.is_usable())
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the map holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'map> IntoIterator for &'map MemoryMap {
    type Item = &'map MemoryMapEntry;
    type IntoIter = core::slice::Iter<'map, MemoryMapEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_kind_follows_multiboot_type_codes() {
        assert_eq!(RegionKind::from_raw(1), RegionKind::Usable);
        assert_eq!(RegionKind::from_raw(2), RegionKind::Reserved);
        assert_eq!(RegionKind::from_raw(3), RegionKind::AcpiReclaimable);
        assert_eq!(RegionKind::from_raw(4), RegionKind::Nvs);
        assert_eq!(RegionKind::from_raw(5), RegionKind::Defective);
        assert_eq!(RegionKind::from_raw(42), RegionKind::Reserved);
    }

    #[test]
    fn usable_iterates_in_report_order() {
        let mut map = MemoryMap::new();
        map.push(MemoryMapEntry::new(0, 0x9_f000, RegionKind::Reserved))
            .unwrap();
        map.push(MemoryMapEntry::new(0x10_0000, 0x100_0000, RegionKind::Usable))
            .unwrap();
        map.push(MemoryMapEntry::new(0xfec0_0000, 0x1000, RegionKind::Nvs))
            .unwrap();
        map.push(MemoryMapEntry::new(0x200_0000, 0x40_0000, RegionKind::Usable))
            .unwrap();

        let bases: ArrayVec<usize, 8> = map.usable().map(|entry| entry.base).collect();
        assert_eq!(&bases[..], &[0x10_0000, 0x200_0000]);
    }

    #[test]
    fn push_past_capacity_is_an_error() {
        let mut map = MemoryMap::new();
        let entry = MemoryMapEntry::new(0, 0x1000, RegionKind::Usable);
        for _ in 0..MAX_ENTRIES {
            map.push(entry).unwrap();
        }
        assert!(map.push(entry).is_err());
        assert_eq!(map.len(), MAX_ENTRIES);
    }

    #[test]
    fn entry_range_covers_base_to_end() {
        let entry = MemoryMapEntry::new(0x1000, 0x2000, RegionKind::Usable);
        assert_eq!(entry.range(), 0x1000..0x3000);
        assert!(entry.is_usable());
    }
}
