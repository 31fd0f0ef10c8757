// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Software-refilled TLB and its victim-selection strategy
//! OWNERS: @kernel-mm-team
//! PUBLIC API: TlbEntry, Tlb::{probe,write,invalidate_all}, ReplacementPolicy, RoundRobin
//! DEPENDS_ON: nothing; lives inside the Vm critical section
//! INVARIANTS: No two valid slots map the same page; invalid slots carry
//!             distinct kernel-space EntryHi values so they never match a user page
//!
//! Entries keep the hardware EntryHi/EntryLo layout: EntryHi holds the virtual
//! page number in bits 31..12, EntryLo the physical page plus DIRTY (writable)
//! and VALID bits.

use alloc::vec::Vec;

use super::{FrameNumber, VirtAddr, PAGE_FRAME, PAGE_SHIFT};

/// Default number of TLB slots.
pub const NUM_TLB: usize = 64;
/// EntryLo: the mapping may be used.
pub const TLBLO_VALID: u32 = 0x0000_0200;
/// EntryLo: the mapping may be written.
pub const TLBLO_DIRTY: u32 = 0x0000_0400;

const TLBHI_VPAGE: u32 = PAGE_FRAME;
const TLBLO_PPAGE: u32 = PAGE_FRAME;
const TLBHI_INVALID_BASE: u32 = 0x8_0000;

/// One hardware translation, as the pair of words the MMU reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub hi: u32,
    pub lo: u32,
}

impl TlbEntry {
    /// Invalid entry for `slot`; its EntryHi lies in kernel space and is
    /// unique per slot.
    pub const fn invalid(slot: usize) -> Self {
        Self { hi: (TLBHI_INVALID_BASE + slot as u32) << PAGE_SHIFT, lo: 0 }
    }

    pub fn new(page: VirtAddr, frame: FrameNumber, writable: bool) -> Self {
        let mut lo = (frame.paddr() & TLBLO_PPAGE) | TLBLO_VALID;
        if writable {
            lo |= TLBLO_DIRTY;
        }
        Self { hi: page.as_u32() & TLBHI_VPAGE, lo }
    }

    pub const fn is_valid(&self) -> bool {
        self.lo & TLBLO_VALID != 0
    }

    pub const fn is_writable(&self) -> bool {
        self.lo & TLBLO_DIRTY != 0
    }

    pub const fn page(&self) -> VirtAddr {
        VirtAddr(self.hi & TLBHI_VPAGE)
    }

    pub const fn frame(&self) -> FrameNumber {
        FrameNumber((self.lo & TLBLO_PPAGE) >> PAGE_SHIFT)
    }

    /// Whether this entry translates `page`.
    pub const fn maps(&self, page: VirtAddr) -> bool {
        self.is_valid() && self.hi & TLBHI_VPAGE == page.as_u32() & TLBHI_VPAGE
    }
}

/// Victim selection for TLB refills when the faulting page has no slot yet.
pub trait ReplacementPolicy: Send {
    /// Picks the slot to overwrite; must be `< entries.len()`.
    fn choose_victim(&mut self, entries: &[TlbEntry]) -> usize;

    /// Called after the whole TLB was invalidated.
    fn reset(&mut self) {}
}

/// Cycles through slots in order, wrapping at capacity.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub const fn new() -> Self {
        Self { next: 0 }
    }
}

impl ReplacementPolicy for RoundRobin {
    fn choose_victim(&mut self, entries: &[TlbEntry]) -> usize {
        if self.next >= entries.len() {
            self.next = 0;
        }
        let victim = self.next;
        self.next += 1;
        victim
    }
}

/// Fixed-capacity array of translation slots.
pub struct Tlb {
    slots: Vec<TlbEntry>,
}

impl Tlb {
    pub fn new(capacity: usize) -> Self {
        kassert!(capacity > 0, "tlb: capacity must be non-zero");
        Self { slots: (0..capacity).map(TlbEntry::invalid).collect() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn entries(&self) -> &[TlbEntry] {
        &self.slots
    }

    pub fn read(&self, slot: usize) -> TlbEntry {
        self.slots[slot]
    }

    pub fn write(&mut self, slot: usize, entry: TlbEntry) {
        self.slots[slot] = entry;
    }

    /// Slot currently translating `page`, if any.
    pub fn probe(&self, page: VirtAddr) -> Option<usize> {
        self.slots.iter().position(|e| e.maps(page))
    }

    pub fn invalidate(&mut self, slot: usize) {
        self.slots[slot] = TlbEntry::invalid(slot);
    }

    pub fn invalidate_all(&mut self) {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            *entry = TlbEntry::invalid(slot);
        }
    }

    /// Drops every translation to `frame`; returns how many were dropped.
    pub fn invalidate_frame(&mut self, frame: FrameNumber) -> usize {
        let mut dropped = 0;
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_valid() && entry.frame() == frame {
                *entry = TlbEntry::invalid(slot);
                dropped += 1;
            }
        }
        dropped
    }

    /// Logs every slot at debug level.
    pub fn dump(&self) {
        for (slot, entry) in self.slots.iter().enumerate() {
            log_debug!(
                target: "tlb",
                "{:2}: {:08x} {:08x} {}",
                slot,
                entry.hi,
                entry.lo,
                if entry.is_valid() { "valid" } else { "invalid" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_words_round_trip_fields() {
        let entry = TlbEntry::new(VirtAddr(0x0040_0123), FrameNumber(0x42), true);
        assert_eq!(entry.hi, 0x0040_0000);
        assert_eq!(entry.lo, 0x0004_2000 | TLBLO_DIRTY | TLBLO_VALID);
        assert_eq!(entry.frame(), FrameNumber(0x42));
        assert!(entry.maps(VirtAddr(0x0040_0000)));
        assert!(!TlbEntry::new(VirtAddr(0), FrameNumber(1), false).is_writable());
    }

    #[test]
    fn invalid_entries_never_match_user_pages() {
        let tlb = Tlb::new(NUM_TLB);
        let his: Vec<u32> = tlb.entries().iter().map(|e| e.hi).collect();
        for (i, hi) in his.iter().enumerate() {
            assert!(*hi >= 0x8000_0000);
            assert!(!his[i + 1..].contains(hi));
        }
        assert_eq!(tlb.probe(VirtAddr(0x1000)), None);
    }

    #[test]
    fn round_robin_wraps_at_capacity() {
        let slots = [TlbEntry::invalid(0), TlbEntry::invalid(1), TlbEntry::invalid(2)];
        let mut policy = RoundRobin::new();
        let picks: Vec<usize> = (0..7).map(|_| policy.choose_victim(&slots)).collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn invalidate_frame_only_hits_that_frame() {
        let mut tlb = Tlb::new(4);
        tlb.write(0, TlbEntry::new(VirtAddr(0x1000), FrameNumber(5), true));
        tlb.write(1, TlbEntry::new(VirtAddr(0x2000), FrameNumber(6), true));
        assert_eq!(tlb.invalidate_frame(FrameNumber(5)), 1);
        assert_eq!(tlb.read(0), TlbEntry::invalid(0));
        assert_eq!(tlb.probe(VirtAddr(0x2000)), Some(1));
    }
}
