// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table entries.
//!
//! An entry is either *resident* (it names a physical frame, or will on first
//! touch) or *pending* (it describes a chunk of an executable segment that has
//! not been read yet). The two layouts never coexist.

use bitflags::bitflags;

use super::{FrameNumber, PAGE_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Access permissions recorded for a page or region.
    pub struct Perms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Bookkeeping bits of a resident entry.
    pub struct Status: u8 {
        /// A frame is attached to the entry.
        const VALID = 1 << 0;
        /// The page was faulted in at least once.
        const REFERENCED = 1 << 1;
        /// The page took a write fault since it became resident.
        const DIRTY = 1 << 2;
    }
}

impl Perms {
    pub const RW: Perms = Perms::READ.union(Perms::WRITE);

    /// Builds permissions from the three region flags.
    pub fn from_flags(readable: bool, writable: bool, executable: bool) -> Self {
        let mut perms = Perms::empty();
        perms.set(Perms::READ, readable);
        perms.set(Perms::WRITE, writable);
        perms.set(Perms::EXECUTE, executable);
        perms
    }
}

/// Mapping of one page to a physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidentPte {
    pub status: Status,
    pub perms: Perms,
    /// Meaningful only while [`Status::VALID`] is set.
    pub frame: FrameNumber,
}

/// Unread chunk of an executable segment covering part of one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingPte {
    pub executable: bool,
    /// Offset inside the page where the chunk starts.
    pub page_offset: u32,
    /// Bytes of the page covered by the chunk.
    pub memsz: u32,
    /// Leading bytes of the chunk backed by the file; the rest reads as zero.
    pub filesz: u32,
    /// File position of the first backed byte.
    pub file_offset: u32,
}

impl PendingPte {
    /// Describes a chunk, or `None` if it would not fit in one page or
    /// claims more file bytes than memory bytes.
    pub fn new(executable: bool, page_offset: u32, memsz: u32, filesz: u32, file_offset: u32) -> Option<Self> {
        let end = page_offset.checked_add(memsz)?;
        if end as usize > PAGE_SIZE || filesz > memsz {
            return None;
        }
        Some(Self { executable, page_offset, memsz, filesz, file_offset })
    }

    /// Bytes at the end of the chunk that must read as zero.
    pub fn zero_fill(&self) -> u32 {
        self.memsz - self.filesz
    }
}

/// One page-table entry: exactly one of the two layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pte {
    Resident(ResidentPte),
    Pending(PendingPte),
}

impl Pte {
    /// Entry for a page backed by `frame`, valid and referenced.
    pub fn resident(frame: FrameNumber, perms: Perms) -> Self {
        Pte::Resident(ResidentPte { status: Status::VALID | Status::REFERENCED, perms, frame })
    }

    /// Entry for a page that gets a zero-filled frame on first touch.
    pub fn unbacked(perms: Perms) -> Self {
        Pte::Resident(ResidentPte { status: Status::empty(), perms, frame: FrameNumber(0) })
    }

    pub fn pending(chunk: PendingPte) -> Self {
        Pte::Pending(chunk)
    }

    /// Frame attached to the entry, if it is resident and valid.
    pub fn frame(&self) -> Option<FrameNumber> {
        match self {
            Pte::Resident(r) if r.status.contains(Status::VALID) => Some(r.frame),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Pte::Pending(_))
    }

    pub fn perms(&self) -> Perms {
        match self {
            Pte::Resident(r) => r.perms,
            Pte::Pending(p) if p.executable => Perms::READ | Perms::EXECUTE,
            Pte::Pending(_) => Perms::RW,
        }
    }

    /// Returns this entry with its frame replaced, keeping every other bit.
    ///
    /// Used when duplicating an address space. Entries without a frame are
    /// returned unchanged.
    pub fn with_frame(self, frame: FrameNumber) -> Self {
        match self {
            Pte::Resident(r) if r.status.contains(Status::VALID) => Pte::Resident(ResidentPte { frame, ..r }),
            other => other,
        }
    }
}
