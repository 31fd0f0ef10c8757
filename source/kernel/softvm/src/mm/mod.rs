// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for a 32-bit, two-level, software-refilled MMU.

use core::fmt;

use static_assertions::const_assert;

mod address_space;
mod coremap;
mod fault;
mod page_table;
mod phys;
mod pte;
mod tlb;
mod vm;

pub use address_space::{AddressSpace, AsId, Region, SharedSource};
pub use coremap::{CoremapEntry, FrameState};
pub use fault::FaultKind;
pub use page_table::PageTable;
pub use pte::{PendingPte, Perms, Pte, ResidentPte, Status};
pub use tlb::{ReplacementPolicy, RoundRobin, Tlb, TlbEntry, NUM_TLB, TLBLO_DIRTY, TLBLO_VALID};
pub use vm::{Vm, VmConfig};

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`]; width of the in-page offset field.
pub const PAGE_SHIFT: u32 = 12;
/// Mask selecting the page-number bits of an address.
pub const PAGE_FRAME: u32 = !(PAGE_SIZE as u32 - 1);
/// Slots in a page directory.
pub const PD_ENTRIES: usize = 1024;
/// Entries in a page table.
pub const PT_ENTRIES: usize = 1024;
/// First address above user space; the initial stack pointer.
pub const USER_TOP: u32 = 0x8000_0000;
/// Base of the direct-mapped kernel window over physical memory.
pub const KSEG0_BASE: u32 = 0x8000_0000;
/// Pages reserved for the user stack below [`USER_TOP`].
pub const STACK_MAX_PAGES: usize = 256;
/// Maximum pages the heap may grow to above its base.
pub const HEAP_MAX_PAGES: usize = 256;

const DIR_SHIFT: u32 = 22;
const INDEX_MASK: u32 = 0x3ff;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1usize << PAGE_SHIFT == PAGE_SIZE);
const_assert!((PD_ENTRIES as u64) * (PT_ENTRIES as u64) * (PAGE_SIZE as u64) == 1u64 << 32);
const_assert!(STACK_MAX_PAGES * PAGE_SIZE < USER_TOP as usize);

/// A 32-bit user virtual address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Recomposes the page address selected by a directory and table index.
    pub const fn join(dir: usize, table: usize) -> Self {
        Self(((dir as u32 & INDEX_MASK) << DIR_SHIFT) | ((table as u32 & INDEX_MASK) << PAGE_SHIFT))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Top ten bits: page-directory slot.
    pub const fn dir_index(self) -> usize {
        ((self.0 >> DIR_SHIFT) & INDEX_MASK) as usize
    }

    /// Middle ten bits: page-table entry.
    pub const fn table_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) & INDEX_MASK) as usize
    }

    pub const fn page_offset(self) -> usize {
        (self.0 & !PAGE_FRAME) as usize
    }

    pub const fn page_base(self) -> Self {
        Self(self.0 & PAGE_FRAME)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub const fn is_user(self) -> bool {
        self.0 < USER_TOP
    }

    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        let bytes = u32::try_from(bytes).ok()?;
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Index of a physical frame; the physical address is `frame * PAGE_SIZE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(pub u32);

impl FrameNumber {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn paddr(self) -> u32 {
        self.0 << PAGE_SHIFT
    }

    /// Kernel-visible address of the frame through the direct map.
    pub const fn kernel_addr(self) -> KernelAddr {
        KernelAddr(KSEG0_BASE + self.paddr())
    }
}

/// Direct-mapped kernel address of physical memory (`paddr + KSEG0_BASE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct KernelAddr(pub u32);

impl KernelAddr {
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Physical address behind this kernel address, if it lies in the window.
    pub const fn paddr(self) -> Option<u32> {
        self.0.checked_sub(KSEG0_BASE)
    }
}

impl fmt::Display for KernelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Rounds `addr` down to its page boundary.
pub const fn page_round_down(addr: u32) -> u32 {
    addr & PAGE_FRAME
}

/// Rounds `addr` up to the next page boundary, or `None` on overflow.
pub const fn page_round_up(addr: u32) -> Option<u32> {
    match addr.checked_add(PAGE_SIZE as u32 - 1) {
        Some(v) => Some(v & PAGE_FRAME),
        None => None,
    }
}

#[cfg(test)]
mod tests_prop;
