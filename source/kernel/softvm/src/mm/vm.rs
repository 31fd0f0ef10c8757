// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The VM object: coremap, TLB, replacement policy and physical memory
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vm::{new,with_policy}, frame allocation, TLB inspection, copy_in/copy_out
//! DEPENDS_ON: sync::CriticalSection, mm::{coremap,tlb,phys}
//! INVARIANTS: Coremap, TLB and policy change only inside one critical section;
//!             a user frame is dropped from the TLB before it returns to the coremap

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use super::coremap::{Coremap, CoremapEntry};
use super::phys::PhysMem;
use super::tlb::{ReplacementPolicy, RoundRobin, Tlb, TlbEntry, NUM_TLB};
use super::{AddressSpace, AsId, FaultKind, FrameNumber, KernelAddr, VirtAddr, PAGE_SIZE};
use crate::error::VmError;
use crate::sync::CriticalSection;

/// Machine parameters for a [`Vm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical frames available to the allocator.
    pub frames: usize,
    /// TLB capacity.
    pub tlb_entries: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { frames: 512, tlb_entries: NUM_TLB }
    }
}

impl VmConfig {
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_tlb_entries(mut self, entries: usize) -> Self {
        self.tlb_entries = entries;
        self
    }
}

pub(crate) struct VmState<P> {
    pub(crate) coremap: Coremap,
    pub(crate) tlb: Tlb,
    pub(crate) policy: P,
}

/// Owner of all machine-wide VM state.
///
/// Every address-space, fault and loader operation takes the `Vm` explicitly;
/// there is no global instance.
pub struct Vm<P: ReplacementPolicy = RoundRobin> {
    state: CriticalSection<VmState<P>>,
    phys: PhysMem,
    next_as: AtomicU32,
}

impl Vm<RoundRobin> {
    pub fn new(config: VmConfig) -> Self {
        Self::with_policy(config, RoundRobin::new())
    }
}

impl<P: ReplacementPolicy> Vm<P> {
    pub fn with_policy(config: VmConfig, policy: P) -> Self {
        // Every frame must be reachable through the kernel direct map.
        kassert!(config.frames <= 1 << 19, "vm: {} frames exceed the 2 GiB window", config.frames);
        log_info!(
            target: "coremap",
            "init: {} frames ({} KiB), {} TLB slots",
            config.frames,
            config.frames * PAGE_SIZE / 1024,
            config.tlb_entries
        );
        Self {
            state: CriticalSection::new(VmState {
                coremap: Coremap::new(config.frames),
                tlb: Tlb::new(config.tlb_entries),
                policy,
            }),
            phys: PhysMem::new(config.frames),
            next_as: AtomicU32::new(1),
        }
    }

    pub(crate) fn critical<R>(&self, f: impl FnOnce(&mut VmState<P>) -> R) -> R {
        self.state.with(f)
    }

    pub(crate) fn phys(&self) -> &PhysMem {
        &self.phys
    }

    pub(crate) fn next_as_id(&self) -> AsId {
        match AsId::from_raw(self.next_as.fetch_add(1, Ordering::Relaxed)) {
            Some(id) => id,
            None => kfatal!("vm: address-space identifiers exhausted"),
        }
    }

    /// Claims one frame for page `vaddr` of address space `owner`.
    pub fn allocate_user_frame(&self, owner: AsId, vaddr: VirtAddr) -> Result<FrameNumber, VmError> {
        let frame = self.critical(|s| s.coremap.alloc_user(owner, vaddr));
        match frame {
            Some(frame) => {
                log_trace!(target: "coremap", "user frame {} -> as {} {}", frame.0, owner.to_raw(), vaddr);
                Ok(frame)
            }
            None => {
                log_warn!(target: "coremap", "out of frames for as {} {}", owner.to_raw(), vaddr);
                Err(VmError::OutOfMemory)
            }
        }
    }

    /// Releases a user frame, dropping any TLB entry that still points at it.
    pub fn free_user_frame(&self, vaddr: VirtAddr, frame: FrameNumber) {
        self.critical(|s| {
            s.tlb.invalidate_frame(frame);
            s.coremap.free_user(vaddr, frame);
        });
    }

    /// Claims `npages` physically contiguous frames for kernel use.
    pub fn allocate_kernel_block(&self, npages: usize) -> Result<KernelAddr, VmError> {
        if npages == 0 {
            return Err(VmError::InvalidArgument("empty kernel block"));
        }
        match self.critical(|s| s.coremap.alloc_kernel(npages)) {
            Some(addr) => Ok(addr),
            None => {
                log_warn!(target: "coremap", "no run of {} free frames", npages);
                Err(VmError::OutOfMemory)
            }
        }
    }

    /// Releases a block returned by [`Vm::allocate_kernel_block`].
    pub fn free_kernel_block(&self, addr: KernelAddr) -> usize {
        self.critical(|s| s.coremap.free_kernel(addr))
    }

    pub fn free_frames(&self) -> usize {
        self.critical(|s| s.coremap.free())
    }

    pub fn total_frames(&self) -> usize {
        self.critical(|s| s.coremap.total())
    }

    /// Coremap record for `frame`, if it exists.
    pub fn frame_entry(&self, frame: FrameNumber) -> Option<CoremapEntry> {
        self.critical(|s| s.coremap.entry(frame))
    }

    /// Frames currently charged to `owner`.
    pub fn owned_frames(&self, owner: AsId) -> usize {
        self.critical(|s| {
            (0..s.coremap.total())
                .filter_map(|i| s.coremap.entry(FrameNumber(i as u32)))
                .filter(|e| e.owner == Some(owner))
                .count()
        })
    }

    /// Snapshot of every TLB slot.
    pub fn tlb_entries(&self) -> Vec<TlbEntry> {
        self.critical(|s| s.tlb.entries().to_vec())
    }

    /// Slot translating the page containing `vaddr`, if any.
    pub fn tlb_probe(&self, vaddr: VirtAddr) -> Option<usize> {
        self.critical(|s| s.tlb.probe(vaddr.page_base()))
    }

    pub fn dump_tlb(&self) {
        self.critical(|s| s.tlb.dump());
    }

    /// Invalidates every TLB slot.
    pub fn flush_tlb(&self) {
        self.critical(|s| {
            s.tlb.invalidate_all();
            s.policy.reset();
        });
    }

    /// Reads user memory at `src` into `buf`, faulting pages in as needed.
    pub fn copy_in(&self, aspace: &mut AddressSpace, src: VirtAddr, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let va = src.checked_add(done).ok_or(VmError::AddressingFault { addr: src })?;
            let frame = self.user_frame(aspace, va, FaultKind::Read)?;
            let offset = va.page_offset();
            let len = (PAGE_SIZE - offset).min(buf.len() - done);
            self.phys.read(frame, offset, &mut buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Writes `data` to user memory at `dst`, faulting pages in as needed.
    pub fn copy_out(&self, aspace: &mut AddressSpace, dst: VirtAddr, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let va = dst.checked_add(done).ok_or(VmError::AddressingFault { addr: dst })?;
            let frame = self.user_frame(aspace, va, FaultKind::Write)?;
            let offset = va.page_offset();
            let len = (PAGE_SIZE - offset).min(data.len() - done);
            self.phys.write(frame, offset, &data[done..done + len]);
            done += len;
        }
        Ok(())
    }

    fn user_frame(&self, aspace: &mut AddressSpace, va: VirtAddr, kind: FaultKind) -> Result<FrameNumber, VmError> {
        if !va.is_user() {
            return Err(VmError::AddressingFault { addr: va });
        }
        if let Some(frame) = aspace.translate(va) {
            if kind == FaultKind::Write {
                self.note_write(aspace, va.page_base(), frame);
            }
            return Ok(frame);
        }
        self.fault(aspace, kind, va)?;
        aspace.translate(va).ok_or(VmError::AddressingFault { addr: va })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_machine() {
        let config = VmConfig::default();
        assert_eq!(config.frames, 512);
        assert_eq!(config.tlb_entries, NUM_TLB);
        let small = config.with_frames(8).with_tlb_entries(4);
        assert_eq!((small.frames, small.tlb_entries), (8, 4));
    }

    #[test]
    fn zero_page_kernel_block_is_rejected() {
        let vm = Vm::new(VmConfig::default().with_frames(4));
        assert_eq!(vm.allocate_kernel_block(0), Err(VmError::InvalidArgument("empty kernel block")));
        assert_eq!(vm.allocate_kernel_block(5), Err(VmError::OutOfMemory));
    }

    #[test]
    fn freeing_user_frame_drops_its_translation() {
        let vm = Vm::new(VmConfig::default().with_frames(4).with_tlb_entries(4));
        let owner = vm.next_as_id();
        let frame = vm.allocate_user_frame(owner, VirtAddr(0x1000)).expect("frame");
        vm.critical(|s| s.tlb.write(2, TlbEntry::new(VirtAddr(0x1000), frame, true)));
        assert_eq!(vm.tlb_probe(VirtAddr(0x1abc)), Some(2));

        vm.free_user_frame(VirtAddr(0x1000), frame);
        assert_eq!(vm.tlb_probe(VirtAddr(0x1000)), None);
        assert_eq!(vm.free_frames(), 4);
        assert_eq!(vm.owned_frames(owner), 0);
    }
}
