// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the VM core and the executable loader.

use thiserror::Error;

use crate::mm::VirtAddr;

/// Failure reported by an [`ExecSource`](crate::loader::ExecSource).
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("executable source I/O error: {0}")]
pub struct IoError(pub &'static str);

/// Errors surfaced by address-space, coremap, fault and loader operations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VmError {
    /// No free frame (or contiguous run of frames) is left.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The access lies outside every region of the address space.
    #[error("addressing fault at {addr}")]
    AddressingFault { addr: VirtAddr },
    /// The executable failed header or segment validation.
    #[error("unsupported executable: {0}")]
    UnsupportedFormat(&'static str),
    /// The executable ended before a header, segment table or segment did.
    #[error("executable truncated")]
    Truncated,
    /// A region or heap request was misaligned or out of bounds.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Reading the executable failed.
    #[error(transparent)]
    Io(#[from] IoError),
}
