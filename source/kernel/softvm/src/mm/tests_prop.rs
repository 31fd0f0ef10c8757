// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for address decomposition and frame accounting
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCENARIOS:
//!   - split_join_inverse(): directory/table indices recompose to the same page
//!   - offset_is_lost_only_below_page(): join drops exactly the in-page offset
//!   - random_touches_conserve_frames(): any set of faulted pages is fully returned by destroy

use proptest::prelude::*;

use super::{AddressSpace, FaultKind, Perms, VirtAddr, Vm, VmConfig, PAGE_SIZE, PD_ENTRIES, PT_ENTRIES};

proptest! {
    #[test]
    fn split_join_inverse(dir in 0usize..PD_ENTRIES, table in 0usize..PT_ENTRIES) {
        let va = VirtAddr::join(dir, table);
        prop_assert!(va.is_page_aligned());
        prop_assert_eq!(va.dir_index(), dir);
        prop_assert_eq!(va.table_index(), table);
        prop_assert_eq!(VirtAddr::join(va.dir_index(), va.table_index()), va);
    }

    #[test]
    fn offset_is_lost_only_below_page(raw in any::<u32>()) {
        let va = VirtAddr(raw);
        let joined = VirtAddr::join(va.dir_index(), va.table_index());
        prop_assert_eq!(joined, va.page_base());
        prop_assert_eq!(joined.as_u32() + va.page_offset() as u32, raw);
    }

    #[test]
    fn random_touches_conserve_frames(pages in proptest::collection::vec(0usize..64, 1..24), write in any::<bool>()) {
        let vm = Vm::new(VmConfig::default().with_frames(96).with_tlb_entries(8));
        let before = vm.free_frames();
        let mut aspace = AddressSpace::create(&vm);
        aspace
            .define_region(VirtAddr(0x0040_0000), 64 * PAGE_SIZE, Perms::RW)
            .expect("region");
        let kind = if write { FaultKind::Write } else { FaultKind::Read };
        for n in &pages {
            let va = VirtAddr(0x0040_0000 + (n * PAGE_SIZE) as u32);
            vm.fault(&mut aspace, kind, va).expect("fault");
        }
        let mut distinct = pages.clone();
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(aspace.resident_pages(), distinct.len());
        prop_assert_eq!(aspace.verify(&vm), Ok(()));

        aspace.destroy(&vm);
        prop_assert_eq!(vm.free_frames(), before);
    }
}
