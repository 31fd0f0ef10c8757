// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Coremap, the registry of every physical frame
//! OWNERS: @kernel-mm-team
//! PUBLIC API: CoremapEntry, FrameState (state lives inside Vm)
//! DEPENDS_ON: nothing; callers serialise access through a CriticalSection
//! INVARIANTS: At most one owner per non-free frame; block_size set only on kernel block heads
//!
//! Both allocators are first-fit linear scans. That is O(frames) per call and
//! can starve large kernel requests; a free list or bitmap can replace the
//! scan behind this API without touching callers.

use alloc::vec::Vec;

use super::{AsId, FrameNumber, KernelAddr, VirtAddr};

/// Allocation state of a physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Free,
    Kernel,
    /// User page written since it was allocated.
    UserDirty,
    /// User page not written since it was allocated.
    UserClean,
}

impl FrameState {
    pub fn is_user(self) -> bool {
        matches!(self, FrameState::UserDirty | FrameState::UserClean)
    }
}

/// Bookkeeping for one physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoremapEntry {
    pub owner: Option<AsId>,
    /// User virtual address, or kernel direct-map address, mapped to the frame.
    pub vaddr: u32,
    /// Length of the kernel block; non-zero only on the block's first frame.
    pub block_size: usize,
    pub state: FrameState,
}

impl CoremapEntry {
    const FREE: CoremapEntry = CoremapEntry { owner: None, vaddr: 0, block_size: 0, state: FrameState::Free };
}

pub(crate) struct Coremap {
    entries: Vec<CoremapEntry>,
    free: usize,
}

impl Coremap {
    pub(crate) fn new(frames: usize) -> Self {
        Self { entries: alloc::vec![CoremapEntry::FREE; frames], free: frames }
    }

    pub(crate) fn total(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn free(&self) -> usize {
        self.free
    }

    pub(crate) fn entry(&self, frame: FrameNumber) -> Option<CoremapEntry> {
        self.entries.get(frame.index()).copied()
    }

    fn entry_mut(&mut self, frame: FrameNumber) -> &mut CoremapEntry {
        match self.entries.get_mut(frame.index()) {
            Some(entry) => entry,
            None => kfatal!("coremap: frame {} out of range", frame.0),
        }
    }

    /// Claims the first free frame for `owner` at page `vaddr`.
    pub(crate) fn alloc_user(&mut self, owner: AsId, vaddr: VirtAddr) -> Option<FrameNumber> {
        kassert!(vaddr.is_page_aligned(), "coremap: user frame for unaligned {}", vaddr);
        let index = self.entries.iter().position(|e| e.state == FrameState::Free)?;
        self.entries[index] =
            CoremapEntry { owner: Some(owner), vaddr: vaddr.as_u32(), block_size: 1, state: FrameState::UserClean };
        self.free -= 1;
        Some(FrameNumber(index as u32))
    }

    pub(crate) fn free_user(&mut self, vaddr: VirtAddr, frame: FrameNumber) {
        let entry = self.entry_mut(frame);
        kassert!(entry.state.is_user(), "coremap: frame {} freed as user page but is {:?}", frame.0, entry.state);
        kassert!(
            entry.vaddr == vaddr.as_u32(),
            "coremap: frame {} maps {:#x}, not {}",
            frame.0,
            entry.vaddr,
            vaddr
        );
        *entry = CoremapEntry::FREE;
        self.free += 1;
    }

    pub(crate) fn mark_dirty(&mut self, frame: FrameNumber) {
        let entry = self.entry_mut(frame);
        if entry.state == FrameState::UserClean {
            entry.state = FrameState::UserDirty;
        }
    }

    /// Claims `npages` contiguous free frames for the kernel.
    pub(crate) fn alloc_kernel(&mut self, npages: usize) -> Option<KernelAddr> {
        if npages == 0 {
            return None;
        }
        let mut run = 0usize;
        let mut head = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.state != FrameState::Free {
                run = 0;
                continue;
            }
            run += 1;
            if run == npages {
                head = Some(index + 1 - npages);
                break;
            }
        }
        let head = head?;

        for (i, entry) in self.entries[head..head + npages].iter_mut().enumerate() {
            let frame = FrameNumber((head + i) as u32);
            *entry = CoremapEntry {
                owner: None,
                vaddr: frame.kernel_addr().as_u32(),
                block_size: if i == 0 { npages } else { 0 },
                state: FrameState::Kernel,
            };
        }
        self.free -= npages;
        Some(FrameNumber(head as u32).kernel_addr())
    }

    /// Releases the block starting at `addr`; returns how many frames it held.
    pub(crate) fn free_kernel(&mut self, addr: KernelAddr) -> usize {
        let paddr = match addr.paddr() {
            Some(paddr) if paddr % super::PAGE_SIZE as u32 == 0 => paddr,
            _ => kfatal!("coremap: {} is not a page-aligned kernel address", addr),
        };
        let head = (paddr as usize) / super::PAGE_SIZE;
        let npages = match self.entries.get(head) {
            Some(e) if e.state == FrameState::Kernel && e.block_size != 0 => e.block_size,
            _ => kfatal!("coremap: {} is not the head of a kernel block", addr),
        };
        for entry in &mut self.entries[head..head + npages] {
            kassert!(entry.state == FrameState::Kernel, "coremap: kernel block at {} was torn", addr);
            *entry = CoremapEntry::FREE;
        }
        self.free += npages;
        npages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> AsId {
        AsId::from_raw(1).expect("non-zero id")
    }

    #[test]
    fn user_frames_are_first_fit() {
        let mut map = Coremap::new(4);
        let a = map.alloc_user(owner(), VirtAddr(0x1000)).expect("frame");
        let b = map.alloc_user(owner(), VirtAddr(0x2000)).expect("frame");
        assert_eq!((a, b), (FrameNumber(0), FrameNumber(1)));
        assert_eq!(map.entry(a).map(|e| e.state), Some(FrameState::UserClean));

        map.free_user(VirtAddr(0x1000), a);
        assert_eq!(map.free(), 3);
        assert_eq!(map.alloc_user(owner(), VirtAddr(0x3000)), Some(FrameNumber(0)));
    }

    #[test]
    fn exhaustion_is_reported_not_waited_on() {
        let mut map = Coremap::new(1);
        assert!(map.alloc_user(owner(), VirtAddr(0)).is_some());
        assert_eq!(map.alloc_user(owner(), VirtAddr(0x1000)), None);
        assert_eq!(map.alloc_kernel(1), None);
    }

    #[test]
    fn kernel_blocks_need_contiguous_runs() {
        let mut map = Coremap::new(6);
        for i in 0..6u32 {
            assert_eq!(map.alloc_user(owner(), VirtAddr(i * 0x1000)), Some(FrameNumber(i)));
        }
        // Fragment memory: F U F F F U
        map.free_user(VirtAddr(0), FrameNumber(0));
        map.free_user(VirtAddr(0x2000), FrameNumber(2));
        map.free_user(VirtAddr(0x3000), FrameNumber(3));
        map.free_user(VirtAddr(0x4000), FrameNumber(4));

        let addr = map.alloc_kernel(3).expect("run of three");
        assert_eq!(addr, FrameNumber(2).kernel_addr());
        assert_eq!(map.entry(FrameNumber(2)).map(|e| e.block_size), Some(3));
        assert_eq!(map.entry(FrameNumber(3)).map(|e| e.block_size), Some(0));
        assert_eq!(map.alloc_kernel(2), None);
        assert_eq!(map.free_kernel(addr), 3);
        assert_eq!(map.alloc_kernel(3), Some(addr));
    }

    #[test]
    fn dirty_tracking_only_touches_user_clean() {
        let mut map = Coremap::new(2);
        let frame = map.alloc_user(owner(), VirtAddr(0x5000)).expect("frame");
        map.mark_dirty(frame);
        assert_eq!(map.entry(frame).map(|e| e.state), Some(FrameState::UserDirty));
    }

    #[test]
    #[should_panic(expected = "maps")]
    fn freeing_with_wrong_vaddr_is_fatal() {
        let mut map = Coremap::new(2);
        let frame = map.alloc_user(owner(), VirtAddr(0x5000)).expect("frame");
        map.free_user(VirtAddr(0x6000), frame);
    }

    #[test]
    #[should_panic(expected = "not the head")]
    fn freeing_block_tail_is_fatal() {
        let mut map = Coremap::new(4);
        map.alloc_kernel(2).expect("block");
        map.free_kernel(FrameNumber(1).kernel_addr());
    }
}
