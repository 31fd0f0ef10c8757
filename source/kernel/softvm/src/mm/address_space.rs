// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address spaces
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::{create,copy,destroy,define_region,define_stack,grow_heap,activate}
//! DEPENDS_ON: mm::page_table, Vm (frames, TLB), loader::ExecSource
//! INVARIANTS: The directory is owned by exactly one address space (fork copies it);
//!             every page table holds one kernel frame until destroy;
//!             at most two static regions; the heap starts right after the higher one

use alloc::{boxed::Box, sync::Arc};
use core::num::NonZeroU32;

use super::page_table::{PageDirectory, PageTable};
use super::pte::PendingPte;
use super::tlb::ReplacementPolicy;
use super::{
    page_round_down, page_round_up, FrameNumber, FrameState, Perms, Pte, VirtAddr, Vm, HEAP_MAX_PAGES, PAGE_SIZE,
    STACK_MAX_PAGES, USER_TOP,
};
use crate::error::VmError;
use crate::loader::ExecSource;
use crate::sync::SleepLock;

/// Executable image shared by an address space and its copies.
pub type SharedSource = Arc<SleepLock<Box<dyn ExecSource>>>;

/// Identifier of an address space; recorded as the owner of its frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(NonZeroU32);

impl AsId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn to_raw(self) -> u32 {
        self.0.get()
    }
}

/// Static region of an address space (code or data).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub base: VirtAddr,
    pub npages: usize,
    pub perms: Perms,
}

impl Region {
    /// First address past the region.
    pub fn end(&self) -> VirtAddr {
        VirtAddr(self.base.as_u32() + (self.npages * PAGE_SIZE) as u32)
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && va < self.end()
    }

    fn overlaps(&self, base: VirtAddr, end: VirtAddr) -> bool {
        base < self.end() && self.base < end
    }
}

/// Lowest address of the stack reservation.
fn stack_floor() -> VirtAddr {
    VirtAddr(USER_TOP - (STACK_MAX_PAGES * PAGE_SIZE) as u32)
}

/// Virtual memory of one process.
///
/// An address space must be released with [`AddressSpace::destroy`]; dropping
/// it leaks its frames.
pub struct AddressSpace {
    id: AsId,
    directory: PageDirectory,
    regions: [Option<Region>; 2],
    heap_base: VirtAddr,
    heap_top: VirtAddr,
    stack_base: Option<VirtAddr>,
    source: Option<SharedSource>,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn create<P: ReplacementPolicy>(vm: &Vm<P>) -> Self {
        let id = vm.next_as_id();
        log_debug!(target: "as", "create as {}", id.to_raw());
        Self {
            id,
            directory: PageDirectory::new(),
            regions: [None, None],
            heap_base: VirtAddr(0),
            heap_top: VirtAddr(0),
            stack_base: None,
            source: None,
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    /// Declares a static region covering `[vaddr, vaddr + size)`, widened to
    /// page boundaries.
    ///
    /// Only two regions exist. Once the second is defined the heap is placed
    /// right after whichever region sits higher.
    pub fn define_region(&mut self, vaddr: VirtAddr, size: usize, perms: Perms) -> Result<(), VmError> {
        if size == 0 {
            return Err(VmError::InvalidArgument("empty region"));
        }
        let end = vaddr.checked_add(size).ok_or(VmError::InvalidArgument("region wraps the address space"))?;
        let base = VirtAddr(page_round_down(vaddr.as_u32()));
        let end = page_round_up(end.as_u32()).ok_or(VmError::InvalidArgument("region wraps the address space"))?;
        if end > USER_TOP {
            return Err(VmError::InvalidArgument("region reaches kernel space"));
        }
        let end = VirtAddr(end);
        if self.regions.iter().flatten().any(|r| r.overlaps(base, end)) || self.stack_base.is_some_and(|s| end > s) {
            return Err(VmError::InvalidArgument("region overlaps an existing mapping"));
        }
        if self.heap_top != self.heap_base {
            return Err(VmError::InvalidArgument("heap already in use"));
        }
        let slot = match self.regions.iter_mut().find(|r| r.is_none()) {
            Some(slot) => slot,
            None => return Err(VmError::InvalidArgument("both regions already defined")),
        };

        let npages = ((end.as_u32() - base.as_u32()) as usize) / PAGE_SIZE;
        *slot = Some(Region { base, npages, perms });
        log_debug!(target: "as", "as {}: region {}..{} {:?}", self.id.to_raw(), base, end, perms);

        if let [Some(a), Some(b)] = self.regions {
            let upper = if a.base > b.base { a } else { b };
            self.heap_base = upper.end();
            self.heap_top = self.heap_base;
        }
        Ok(())
    }

    /// Reserves the fixed-size stack below [`USER_TOP`] and returns the
    /// initial stack pointer.
    pub fn define_stack(&mut self) -> Result<VirtAddr, VmError> {
        let base = stack_floor();
        if self.regions.iter().flatten().any(|r| r.overlaps(base, VirtAddr(USER_TOP))) {
            return Err(VmError::InvalidArgument("stack overlaps a region"));
        }
        if self.heap_top > base {
            return Err(VmError::InvalidArgument("stack overlaps the heap"));
        }
        self.stack_base = Some(base);
        Ok(VirtAddr(USER_TOP))
    }

    /// Moves the heap top by `amount` bytes and returns the previous top.
    ///
    /// Growing installs frameless read/write entries that are backed on first
    /// touch. Shrinking releases whatever frames the dropped pages held.
    pub fn grow_heap<P: ReplacementPolicy>(&mut self, vm: &Vm<P>, amount: isize) -> Result<VirtAddr, VmError> {
        if amount.unsigned_abs() % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument("heap change is not a page multiple"));
        }
        if self.regions.iter().any(Option::is_none) {
            return Err(VmError::InvalidArgument("heap base not placed"));
        }
        let old_top = self.heap_top;
        let new_top = i64::from(old_top.as_u32()) + amount as i64;
        let limit = i64::from(self.heap_base.as_u32()) + (HEAP_MAX_PAGES * PAGE_SIZE) as i64;
        if new_top < i64::from(self.heap_base.as_u32()) || new_top > limit {
            return Err(VmError::InvalidArgument("heap out of bounds"));
        }
        // The stack range is fixed whether or not it has been defined yet.
        if new_top > i64::from(stack_floor().as_u32()) {
            return Err(VmError::InvalidArgument("heap would collide with stack"));
        }
        let new_top = VirtAddr(new_top as u32);

        if new_top > old_top {
            self.extend_heap(vm, old_top, new_top)?;
        } else {
            self.shrink_heap(vm, new_top, old_top);
        }
        self.heap_top = new_top;
        Ok(old_top)
    }

    fn extend_heap<P: ReplacementPolicy>(&mut self, vm: &Vm<P>, from: VirtAddr, to: VirtAddr) -> Result<(), VmError> {
        let mut page = from;
        while page < to {
            if let Err(err) = self.ensure_table(vm, page) {
                let mut undo = from;
                while undo < page {
                    self.clear_pte(undo);
                    undo = VirtAddr(undo.as_u32() + PAGE_SIZE as u32);
                }
                return Err(err);
            }
            let previous = self.set_pte(page, Pte::unbacked(Perms::RW));
            kassert!(previous.is_none(), "as {}: heap page {} already mapped", self.id.to_raw(), page);
            page = VirtAddr(page.as_u32() + PAGE_SIZE as u32);
        }
        Ok(())
    }

    fn shrink_heap<P: ReplacementPolicy>(&mut self, vm: &Vm<P>, from: VirtAddr, to: VirtAddr) {
        let mut page = from;
        while page < to {
            if let Some(frame) = self.clear_pte(page).and_then(|pte| pte.frame()) {
                vm.free_user_frame(page, frame);
            }
            page = VirtAddr(page.as_u32() + PAGE_SIZE as u32);
        }
    }

    /// Makes this address space current on the processor.
    ///
    /// The TLB carries no address-space tags, so every entry is dropped.
    pub fn activate<P: ReplacementPolicy>(&self, vm: &Vm<P>) {
        vm.flush_tlb();
    }

    /// Duplicates the address space for fork.
    ///
    /// Every resident page gets its own frame in the copy; pending and
    /// frameless entries are copied as they are. On failure the partial copy
    /// is torn down and `self` is left untouched.
    pub fn copy<P: ReplacementPolicy>(&self, vm: &Vm<P>) -> Result<AddressSpace, VmError> {
        let mut child = AddressSpace::create(vm);
        child.regions = self.regions;
        child.heap_base = self.heap_base;
        child.heap_top = self.heap_top;
        child.stack_base = self.stack_base;
        child.source = self.source.clone();

        if let Err(err) = child.duplicate_pages(self, vm) {
            log_warn!(target: "as", "copy of as {} failed: {}", self.id.to_raw(), err);
            child.destroy(vm);
            return Err(err);
        }
        log_debug!(
            target: "as",
            "copied as {} -> as {} ({} resident pages)",
            self.id.to_raw(),
            child.id.to_raw(),
            child.resident_pages()
        );
        child.debug_verify(vm);
        Ok(child)
    }

    fn duplicate_pages<P: ReplacementPolicy>(&mut self, parent: &AddressSpace, vm: &Vm<P>) -> Result<(), VmError> {
        for (dir, table) in parent.directory.tables() {
            self.ensure_table(vm, VirtAddr::join(dir, 0))?;
            for (index, pte) in table.iter() {
                let va = VirtAddr::join(dir, index);
                let copied = match pte.frame() {
                    Some(src) => {
                        let dst = vm.allocate_user_frame(self.id, va)?;
                        vm.phys().copy_frame(src, dst);
                        pte.with_frame(dst)
                    }
                    None => *pte,
                };
                self.set_pte(va, copied);
            }
        }
        Ok(())
    }

    /// Releases every frame and page table owned by the address space.
    pub fn destroy<P: ReplacementPolicy>(mut self, vm: &Vm<P>) {
        let mut frames = 0usize;
        let mut tables = 0usize;
        for (dir, table) in self.directory.drain_tables() {
            for (index, pte) in table.iter() {
                if let Some(frame) = pte.frame() {
                    vm.free_user_frame(VirtAddr::join(dir, index), frame);
                    frames += 1;
                }
            }
            vm.free_kernel_block(table.home());
            tables += 1;
        }
        log_debug!(target: "as", "destroy as {}: {} frames, {} tables", self.id.to_raw(), frames, tables);

        #[cfg(all(feature = "debug_pt_verify", debug_assertions))]
        if vm.owned_frames(self.id) != 0 {
            log_error!(target: "as", "PT-VERIFY: as {} still owns frames after destroy", self.id.to_raw());
        }
    }

    /// Permissions of the region containing `va`, or `None` if no region,
    /// heap or stack covers it.
    pub fn region_permissions(&self, va: VirtAddr) -> Option<Perms> {
        if let Some(region) = self.regions.iter().flatten().find(|r| r.contains(va)) {
            return Some(region.perms);
        }
        if va >= self.heap_base && va < self.heap_top {
            return Some(Perms::RW);
        }
        match self.stack_base {
            Some(base) if va >= base && va.is_user() => Some(Perms::RW),
            _ => None,
        }
    }

    /// Frame currently backing the page containing `va`.
    pub fn translate(&self, va: VirtAddr) -> Option<FrameNumber> {
        self.directory.entry(va.page_base())?.frame()
    }

    pub fn regions(&self) -> [Option<Region>; 2] {
        self.regions
    }

    /// Heap `(base, top)`.
    pub fn heap_bounds(&self) -> (VirtAddr, VirtAddr) {
        (self.heap_base, self.heap_top)
    }

    pub fn stack_base(&self) -> Option<VirtAddr> {
        self.stack_base
    }

    pub fn pte(&self, va: VirtAddr) -> Option<&Pte> {
        self.directory.entry(va.page_base())
    }

    /// Pages that currently hold a frame.
    pub fn resident_pages(&self) -> usize {
        self.directory.entries().filter(|(_, pte)| pte.frame().is_some()).count()
    }

    pub fn page_tables(&self) -> usize {
        self.directory.tables().count()
    }

    /// Cross-checks every page table and resident entry against the coremap.
    pub fn verify<P: ReplacementPolicy>(&self, vm: &Vm<P>) -> Result<(), &'static str> {
        for (_, table) in self.directory.tables() {
            let head = table
                .home()
                .paddr()
                .and_then(|paddr| vm.frame_entry(FrameNumber(paddr / PAGE_SIZE as u32)))
                .ok_or("page table outside physical memory")?;
            if head.state != FrameState::Kernel || head.block_size != 1 {
                return Err("page table frame is not a one-frame kernel block");
            }
        }
        for (va, pte) in self.directory.entries() {
            let Some(frame) = pte.frame() else { continue };
            let entry = vm.frame_entry(frame).ok_or("resident entry beyond physical memory")?;
            if !entry.state.is_user() {
                return Err("resident entry points at a non-user frame");
            }
            if entry.owner != Some(self.id) {
                return Err("resident frame owned by another address space");
            }
            if entry.vaddr != va.as_u32() {
                return Err("coremap records a different virtual page");
            }
        }
        Ok(())
    }

    fn debug_verify<P: ReplacementPolicy>(&self, _vm: &Vm<P>) {
        #[cfg(all(feature = "debug_pt_verify", debug_assertions))]
        if let Err(msg) = self.verify(_vm) {
            log_error!(target: "as", "PT-VERIFY: as {}: {}", self.id.to_raw(), msg);
        }
    }

    pub(crate) fn pte_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        self.directory.entry_mut(va.page_base())
    }

    /// Creates the page table covering `va` if it does not exist yet.
    pub(crate) fn ensure_table<P: ReplacementPolicy>(&mut self, vm: &Vm<P>, va: VirtAddr) -> Result<(), VmError> {
        let dir = va.dir_index();
        if !self.directory.has_table(dir) {
            let home = vm.allocate_kernel_block(1)?;
            self.directory.install_table(dir, PageTable::new(home));
            log_trace!(target: "as", "as {}: page table {} at {}", self.id.to_raw(), dir, home);
        }
        Ok(())
    }

    /// Stores `pte` for the page containing `va`; the table must exist.
    pub(crate) fn set_pte(&mut self, va: VirtAddr, pte: Pte) -> Option<Pte> {
        let va = va.page_base();
        match self.directory.table_mut(va.dir_index()) {
            Some(table) => table.set(va.table_index(), pte),
            None => kfatal!("as {}: no page table for {}", self.id.to_raw(), va),
        }
    }

    fn clear_pte(&mut self, va: VirtAddr) -> Option<Pte> {
        self.directory.table_mut(va.dir_index())?.take(va.table_index())
    }

    /// Records an unread executable chunk for page `va`.
    pub(crate) fn install_pending<P: ReplacementPolicy>(
        &mut self,
        vm: &Vm<P>,
        va: VirtAddr,
        chunk: PendingPte,
    ) -> Result<(), VmError> {
        self.ensure_table(vm, va)?;
        let previous = self.set_pte(va, Pte::pending(chunk));
        kassert!(previous.is_none(), "as {}: pending chunk over occupied entry at {}", self.id.to_raw(), va);
        Ok(())
    }

    pub(crate) fn attach_source(&mut self, source: SharedSource) {
        self.source = Some(source);
    }

    pub(crate) fn exec_source(&self) -> Option<SharedSource> {
        self.source.clone()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let leaked = self.directory.tables().count();
        if leaked != 0 {
            log_warn!(target: "as", "as {} dropped without destroy; {} page tables leaked", self.id.to_raw(), leaked);
        }
    }
}
