// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TLB-miss handling: resolve a faulting page to a frame and refill the TLB
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vm::fault(aspace, kind, addr)
//! DEPENDS_ON: AddressSpace (classification, page tables), loader (demand reads)
//! INVARIANTS: Addresses outside every region allocate nothing and leave the TLB untouched;
//!             the executable is read under its sleep lock, never inside a critical section;
//!             a failed demand load releases its frame and keeps the pending entry

use alloc::vec;

use super::pte::{PendingPte, ResidentPte, Status};
use super::tlb::{ReplacementPolicy, TlbEntry};
use super::vm::VmState;
use super::{AddressSpace, FrameNumber, Pte, VirtAddr, Vm};
use crate::error::VmError;
use crate::loader::read_exact;

/// Cause of a TLB exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Load from a page with no TLB entry.
    Read,
    /// Store to a page with no TLB entry.
    Write,
    /// Store to a page whose TLB entry lacks the DIRTY bit.
    ReadOnly,
}

impl<P: ReplacementPolicy> Vm<P> {
    /// Resolves a TLB miss at `addr` in `aspace` and installs the translation.
    ///
    /// On success the faulting access can be retried. Pages are always
    /// entered writable, so a [`FaultKind::ReadOnly`] fault means the TLB was
    /// corrupted and is fatal.
    pub fn fault(&self, aspace: &mut AddressSpace, kind: FaultKind, addr: VirtAddr) -> Result<(), VmError> {
        if kind == FaultKind::ReadOnly {
            kfatal!("fault: write to read-only page at {}", addr);
        }
        let page = addr.page_base();
        log_trace!(target: "fault", "as {} {:?} {}", aspace.id().to_raw(), kind, addr);

        let perms = match aspace.region_permissions(page) {
            Some(perms) => perms,
            None => {
                log_debug!(target: "fault", "as {}: {} outside every region", aspace.id().to_raw(), addr);
                return Err(VmError::AddressingFault { addr });
            }
        };

        let frame = match aspace.pte(page).copied() {
            Some(Pte::Resident(r)) if r.status.contains(Status::VALID) => r.frame,
            Some(Pte::Resident(r)) => {
                let frame = self.zeroed_frame(aspace, page)?;
                aspace.set_pte(page, Pte::Resident(ResidentPte { status: r.status | Status::VALID, frame, ..r }));
                frame
            }
            Some(Pte::Pending(chunk)) => self.demand_load(aspace, page, chunk)?,
            None => {
                aspace.ensure_table(self, page)?;
                let frame = self.zeroed_frame(aspace, page)?;
                aspace.set_pte(page, Pte::resident(frame, perms));
                frame
            }
        };

        if let Some(Pte::Resident(r)) = aspace.pte_mut(page) {
            r.status |= Status::VALID | Status::REFERENCED;
        }
        if kind == FaultKind::Write {
            self.note_write(aspace, page, frame);
        }
        self.critical(|s| Self::refill(s, page, frame));
        Ok(())
    }

    /// Records a store to `page`: the entry becomes dirty and so does its frame.
    pub(crate) fn note_write(&self, aspace: &mut AddressSpace, page: VirtAddr, frame: FrameNumber) {
        if let Some(Pte::Resident(r)) = aspace.pte_mut(page) {
            r.status |= Status::DIRTY;
        }
        self.critical(|s| s.coremap.mark_dirty(frame));
    }

    fn zeroed_frame(&self, aspace: &AddressSpace, page: VirtAddr) -> Result<FrameNumber, VmError> {
        let frame = self.allocate_user_frame(aspace.id(), page)?;
        self.phys().zero(frame);
        Ok(frame)
    }

    /// Materialises a pending chunk: fresh zeroed frame, file bytes copied in
    /// at the chunk's in-page offset, entry switched to resident.
    fn demand_load(&self, aspace: &mut AddressSpace, page: VirtAddr, chunk: PendingPte) -> Result<FrameNumber, VmError> {
        let frame = self.zeroed_frame(aspace, page)?;
        if chunk.filesz > 0 {
            let source = match aspace.exec_source() {
                Some(source) => source,
                None => kfatal!("fault: pending entry at {} without an executable", page),
            };
            let mut bytes = vec![0u8; chunk.filesz as usize];
            let read = {
                let mut guard = source.lock();
                read_exact(&mut **guard, u64::from(chunk.file_offset), &mut bytes)
            };
            if let Err(err) = read {
                log_error!(target: "fault", "demand load of {} failed: {}", page, err);
                self.free_user_frame(page, frame);
                return Err(err);
            }
            self.phys().write(frame, chunk.page_offset as usize, &bytes);
        }

        let perms = aspace.region_permissions(page).unwrap_or_else(|| Pte::Pending(chunk).perms());
        let previous = aspace.set_pte(page, Pte::resident(frame, perms));
        kassert!(previous == Some(Pte::Pending(chunk)), "fault: entry at {} changed during demand load", page);
        log_debug!(
            target: "fault",
            "as {}: loaded {} ({} file bytes at {:#x}, {} zero)",
            aspace.id().to_raw(),
            page,
            chunk.filesz,
            chunk.file_offset,
            chunk.zero_fill()
        );
        Ok(frame)
    }

    /// Writes the translation, reusing the page's slot if it already has one.
    fn refill(state: &mut VmState<P>, page: VirtAddr, frame: FrameNumber) {
        let slot = match state.tlb.probe(page) {
            Some(slot) => slot,
            None => state.policy.choose_victim(state.tlb.entries()),
        };
        kassert!(slot < state.tlb.capacity(), "fault: policy picked slot {} of {}", slot, state.tlb.capacity());
        let entry = TlbEntry::new(page, frame, true);
        log_trace!(target: "tlb", "slot {:2}: {:08x} {:08x}", slot, entry.hi, entry.lo);
        state.tlb.write(slot, entry);
    }
}
