// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level page tables: a directory of lazily created leaf tables.

use alloc::{boxed::Box, vec, vec::Vec};

use super::{KernelAddr, Pte, VirtAddr, PD_ENTRIES, PT_ENTRIES};

/// Leaf table covering 4 MiB of user space.
///
/// Each table is charged one kernel frame from the coremap while it exists;
/// `home` is the address of that frame and must be handed back on release.
pub struct PageTable {
    entries: Box<[Option<Pte>]>,
    home: KernelAddr,
}

impl PageTable {
    pub(crate) fn new(home: KernelAddr) -> Self {
        Self { entries: vec![None; PT_ENTRIES].into_boxed_slice(), home }
    }

    /// Kernel frame backing this table.
    pub fn home(&self) -> KernelAddr {
        self.home
    }

    pub fn get(&self, index: usize) -> Option<&Pte> {
        self.entries.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Pte> {
        self.entries.get_mut(index)?.as_mut()
    }

    /// Stores `pte` at `index`, returning the entry it replaced.
    pub fn set(&mut self, index: usize, pte: Pte) -> Option<Pte> {
        self.entries[index].replace(pte)
    }

    pub fn take(&mut self, index: usize) -> Option<Pte> {
        self.entries[index].take()
    }

    /// Occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Pte)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, slot)| slot.as_ref().map(|pte| (i, pte)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
}

/// Page directory; every slot exclusively owns its table.
pub(crate) struct PageDirectory {
    slots: Vec<Option<PageTable>>,
}

impl PageDirectory {
    pub(crate) fn new() -> Self {
        Self { slots: (0..PD_ENTRIES).map(|_| None).collect() }
    }

    pub(crate) fn table(&self, dir: usize) -> Option<&PageTable> {
        self.slots.get(dir)?.as_ref()
    }

    pub(crate) fn table_mut(&mut self, dir: usize) -> Option<&mut PageTable> {
        self.slots.get_mut(dir)?.as_mut()
    }

    pub(crate) fn has_table(&self, dir: usize) -> bool {
        self.table(dir).is_some()
    }

    /// Hooks a freshly allocated table into an empty slot.
    pub(crate) fn install_table(&mut self, dir: usize, table: PageTable) -> &mut PageTable {
        kassert!(self.slots[dir].is_none(), "pt: directory slot {} already populated", dir);
        self.slots[dir].insert(table)
    }

    pub(crate) fn entry(&self, va: VirtAddr) -> Option<&Pte> {
        self.table(va.dir_index())?.get(va.table_index())
    }

    pub(crate) fn entry_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        self.table_mut(va.dir_index())?.get_mut(va.table_index())
    }

    /// Every occupied entry as `(page address, entry)`.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (VirtAddr, &Pte)> + '_ {
        self.tables().flat_map(|(dir, table)| table.iter().map(move |(i, pte)| (VirtAddr::join(dir, i), pte)))
    }

    pub(crate) fn tables(&self) -> impl Iterator<Item = (usize, &PageTable)> + '_ {
        self.slots.iter().enumerate().filter_map(|(dir, slot)| slot.as_ref().map(|table| (dir, table)))
    }

    /// Detaches every table, leaving the directory empty.
    pub(crate) fn drain_tables(&mut self) -> impl Iterator<Item = (usize, PageTable)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(dir, slot)| slot.take().map(|table| (dir, table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{FrameNumber, Perms};

    #[test]
    fn entries_are_reported_with_their_page_address() {
        let mut dir = PageDirectory::new();
        let va = VirtAddr(0x0040_3000);
        let table = dir.install_table(va.dir_index(), PageTable::new(FrameNumber(4).kernel_addr()));
        assert_eq!(table.set(va.table_index(), Pte::resident(FrameNumber(9), Perms::RW)), None);

        let seen: Vec<_> = dir.entries().map(|(va, pte)| (va, pte.frame())).collect();
        assert_eq!(seen, [(va, Some(FrameNumber(9)))]);
        assert!(dir.entry(VirtAddr(0x0040_4000)).is_none());
        assert!(dir.entry(VirtAddr(0x0080_3000)).is_none());
    }

    #[test]
    fn drain_empties_directory() {
        let mut dir = PageDirectory::new();
        dir.install_table(0, PageTable::new(FrameNumber(1).kernel_addr()));
        dir.install_table(511, PageTable::new(FrameNumber(2).kernel_addr()));
        let homes: Vec<_> = dir.drain_tables().map(|(_, t)| t.home()).collect();
        assert_eq!(homes, [FrameNumber(1).kernel_addr(), FrameNumber(2).kernel_addr()]);
        assert_eq!(dir.tables().count(), 0);
    }

    #[test]
    #[should_panic(expected = "already populated")]
    fn double_install_is_fatal() {
        let mut dir = PageDirectory::new();
        dir.install_table(3, PageTable::new(FrameNumber(1).kernel_addr()));
        dir.install_table(3, PageTable::new(FrameNumber(2).kernel_addr()));
    }
}
