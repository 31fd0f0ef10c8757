// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual-memory subsystem for the teaching kernel
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vm (coremap, TLB, fault handler), AddressSpace, load_executable/load_program
//! DEPENDS_ON: spin (critical sections), goblin (ELF parsing), bitflags, thiserror
//! INVARIANTS: One coremap and one TLB per Vm; page directories are never shared;
//!             demand-load reads never run inside a critical section
//!
//! The crate models a single-processor MIPS-style machine: 4 KiB pages, a
//! 32-bit user address space split 10/10/12 across a two-level page table, a
//! software-refilled TLB and physical memory addressed directly by the kernel
//! through a KSEG0-style window.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod error;
pub mod loader;
pub mod mm;
pub mod sync;

pub use diag::log;
pub use error::{IoError, VmError};
pub use loader::{load_executable, load_executable_for, load_program, ElfTarget, ExecSource, LoadedProgram};
pub use mm::{
    AddressSpace, AsId, FaultKind, FrameNumber, FrameState, KernelAddr, Perms, Pte, Region, ReplacementPolicy,
    RoundRobin, TlbEntry, VirtAddr, Vm, VmConfig, PAGE_SIZE, USER_TOP,
};
