// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: ELF32 executable loader installing demand-load entries
//! OWNERS: @kernel-mm-team
//! PUBLIC API: load_executable(), load_program(), ExecSource, ElfTarget
//! DEPENDS_ON: goblin (header/program-header parsing), AddressSpace
//! INVARIANTS: Every header is validated before the address space is touched;
//!             loading copies no segment bytes, faults read them later

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};

use goblin::container::Ctx;
use goblin::elf::header::{
    header32, Header, EI_CLASS, EI_DATA, EI_VERSION, ELFCLASS32, ELFDATA2MSB, ELFMAG, EM_MIPS, ET_EXEC,
    EV_CURRENT, SELFMAG,
};
use goblin::elf::Elf;
use goblin::elf::program_header::{
    program_header32, ProgramHeader, PF_R, PF_W, PF_X, PT_HIPROC, PT_LOAD, PT_LOPROC, PT_NULL, PT_PHDR,
};

use crate::error::{IoError, VmError};
use crate::mm::{
    page_round_down, page_round_up, AddressSpace, PendingPte, Perms, ReplacementPolicy, VirtAddr, Vm, PAGE_SIZE,
    USER_TOP,
};
use crate::sync::SleepLock;

/// Byte-addressable executable image.
pub trait ExecSource: Send {
    /// Reads up to `buf.len()` bytes at `offset`; returns how many were read.
    /// Zero means the image ends before `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;
}

fn read_from_slice(image: &[u8], offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
    let start = usize::try_from(offset).map_err(|_| IoError("offset beyond addressable range"))?;
    let available = image.get(start..).unwrap_or(&[]);
    let len = available.len().min(buf.len());
    buf[..len].copy_from_slice(&available[..len]);
    Ok(len)
}

impl ExecSource for Vec<u8> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        read_from_slice(self, offset, buf)
    }
}

impl ExecSource for &'static [u8] {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        read_from_slice(self, offset, buf)
    }
}

/// Fills `buf` from `offset`, treating an early end of image as truncation.
pub(crate) fn read_exact(source: &mut dyn ExecSource, mut offset: u64, buf: &mut [u8]) -> Result<(), VmError> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = source.read_at(offset, &mut buf[filled..])?;
        if read == 0 {
            return Err(VmError::Truncated);
        }
        filled += read;
        offset += read as u64;
    }
    Ok(())
}

/// Machine an executable must be built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElfTarget {
    /// `EI_DATA` byte order.
    pub data: u8,
    /// `e_machine`.
    pub machine: u16,
}

impl Default for ElfTarget {
    /// Big-endian MIPS.
    fn default() -> Self {
        Self { data: ELFDATA2MSB, machine: EM_MIPS }
    }
}

/// A program ready to run.
pub struct LoadedProgram {
    pub aspace: AddressSpace,
    pub entry: VirtAddr,
    pub stack_pointer: VirtAddr,
}

struct Segment {
    vaddr: u32,
    memsz: u32,
    filesz: u32,
    offset: u32,
    perms: Perms,
}

impl Segment {
    fn pages(&self) -> (u32, u32) {
        // Bounds were checked when the segment was accepted.
        let end = page_round_up(self.vaddr + self.memsz).unwrap_or(USER_TOP);
        (page_round_down(self.vaddr), end)
    }
}

/// Loads `source` into `aspace` for the default target and returns the entry point.
pub fn load_executable<P, S>(vm: &Vm<P>, aspace: &mut AddressSpace, source: S) -> Result<VirtAddr, VmError>
where
    P: ReplacementPolicy,
    S: ExecSource + 'static,
{
    load_executable_for(vm, aspace, source, ElfTarget::default())
}

/// Loads `source` into `aspace`, checking it was built for `target`.
///
/// Regions are defined and every page of every loadable segment gets a
/// pending entry; segment bytes are read by the fault handler on first touch.
pub fn load_executable_for<P, S>(
    vm: &Vm<P>,
    aspace: &mut AddressSpace,
    mut source: S,
    target: ElfTarget,
) -> Result<VirtAddr, VmError>
where
    P: ReplacementPolicy,
    S: ExecSource + 'static,
{
    let header = read_header(&mut source, target)?;
    let segments = read_segments(&mut source, &header)?;

    for segment in &segments {
        aspace.define_region(VirtAddr(segment.vaddr), segment.memsz as usize, segment.perms)?;
    }
    for segment in &segments {
        install_segment(vm, aspace, segment)?;
    }
    aspace.attach_source(Arc::new(SleepLock::new(Box::new(source) as Box<dyn ExecSource>)));

    let entry = VirtAddr(header.e_entry as u32);
    log_info!(
        target: "elf",
        "as {}: {} segments, entry {}",
        aspace.id().to_raw(),
        segments.len(),
        entry
    );
    Ok(entry)
}

/// Creates an address space, loads `source` into it and defines the stack.
///
/// On failure the partially built address space is destroyed.
pub fn load_program<P, S>(vm: &Vm<P>, source: S) -> Result<LoadedProgram, VmError>
where
    P: ReplacementPolicy,
    S: ExecSource + 'static,
{
    let mut aspace = AddressSpace::create(vm);
    let loaded = load_executable(vm, &mut aspace, source).and_then(|entry| Ok((entry, aspace.define_stack()?)));
    match loaded {
        Ok((entry, stack_pointer)) => Ok(LoadedProgram { aspace, entry, stack_pointer }),
        Err(err) => {
            log_warn!(target: "elf", "load failed: {}", err);
            aspace.destroy(vm);
            Err(err)
        }
    }
}

fn read_header(source: &mut dyn ExecSource, target: ElfTarget) -> Result<Header, VmError> {
    let mut bytes = [0u8; header32::SIZEOF_EHDR];
    read_exact(source, 0, &mut bytes)?;

    if bytes[..SELFMAG] != ELFMAG[..] {
        return Err(VmError::UnsupportedFormat("bad magic"));
    }
    if bytes[EI_CLASS] != ELFCLASS32 {
        return Err(VmError::UnsupportedFormat("not a 32-bit executable"));
    }
    if bytes[EI_DATA] != target.data {
        return Err(VmError::UnsupportedFormat("wrong byte order"));
    }
    if bytes[EI_VERSION] != EV_CURRENT {
        return Err(VmError::UnsupportedFormat("unknown ident version"));
    }

    let header = Elf::parse_header(&bytes).map_err(|_| VmError::UnsupportedFormat("malformed header"))?;
    if header.e_version != u32::from(EV_CURRENT) {
        return Err(VmError::UnsupportedFormat("unknown header version"));
    }
    if header.e_type != ET_EXEC {
        return Err(VmError::UnsupportedFormat("not an executable"));
    }
    if header.e_machine != target.machine {
        return Err(VmError::UnsupportedFormat("wrong machine"));
    }
    if header.e_entry >= u64::from(USER_TOP) {
        return Err(VmError::UnsupportedFormat("entry point in kernel space"));
    }
    if header.e_phnum > 0 && usize::from(header.e_phentsize) != program_header32::SIZEOF_PHDR {
        return Err(VmError::UnsupportedFormat("unexpected program header size"));
    }
    Ok(header)
}

/// Reads and checks every program header, keeping the loadable ones.
fn read_segments(source: &mut dyn ExecSource, header: &Header) -> Result<Vec<Segment>, VmError> {
    let count = usize::from(header.e_phnum);
    let mut table = vec![0u8; count * program_header32::SIZEOF_PHDR];
    read_exact(source, header.e_phoff, &mut table)?;

    let container = header.container().map_err(|_| VmError::UnsupportedFormat("bad class"))?;
    let endian = header.endianness().map_err(|_| VmError::UnsupportedFormat("bad byte order"))?;
    let ctx = Ctx::new(container, endian);
    let program_headers =
        ProgramHeader::parse(&table, 0, count, ctx).map_err(|_| VmError::UnsupportedFormat("malformed program header"))?;

    let mut segments: Vec<Segment> = Vec::new();
    for ph in &program_headers {
        match ph.p_type {
            PT_LOAD => {}
            PT_NULL | PT_PHDR => continue,
            PT_LOPROC..=PT_HIPROC => {
                log_debug!(target: "elf", "skipping processor segment {:#x}", ph.p_type);
                continue;
            }
            _ => return Err(VmError::UnsupportedFormat("unknown segment type")),
        }
        let segment = segment_from_program(ph)?;
        if segment.memsz == 0 {
            continue;
        }
        let (start, end) = segment.pages();
        if segments.iter().any(|other| {
            let (other_start, other_end) = other.pages();
            start < other_end && other_start < end
        }) {
            return Err(VmError::UnsupportedFormat("segments share a page"));
        }
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(VmError::UnsupportedFormat("no loadable segments"));
    }
    if segments.len() > 2 {
        return Err(VmError::UnsupportedFormat("more than two loadable segments"));
    }
    Ok(segments)
}

fn segment_from_program(ph: &ProgramHeader) -> Result<Segment, VmError> {
    let out_of_range = VmError::UnsupportedFormat("segment outside user space");
    let vaddr = u32::try_from(ph.p_vaddr).map_err(|_| out_of_range)?;
    let memsz = u32::try_from(ph.p_memsz).map_err(|_| out_of_range)?;
    let offset = u32::try_from(ph.p_offset).map_err(|_| VmError::UnsupportedFormat("segment offset too large"))?;
    match vaddr.checked_add(memsz) {
        Some(end) if end <= USER_TOP => {}
        _ => return Err(out_of_range),
    }

    let mut filesz = u32::try_from(ph.p_filesz).unwrap_or(u32::MAX);
    if filesz > memsz {
        log_warn!(target: "elf", "segment at {:#x}: file size {:#x} > memory size {:#x}", vaddr, ph.p_filesz, memsz);
        filesz = memsz;
    }
    offset.checked_add(filesz).ok_or(VmError::UnsupportedFormat("segment offset too large"))?;

    let perms = Perms::from_flags(ph.p_flags & PF_R != 0, ph.p_flags & PF_W != 0, ph.p_flags & PF_X != 0);
    Ok(Segment { vaddr, memsz, filesz, offset, perms })
}

/// Splits a segment into per-page pending chunks.
fn install_segment<P: ReplacementPolicy>(vm: &Vm<P>, aspace: &mut AddressSpace, segment: &Segment) -> Result<(), VmError> {
    let executable = segment.perms.contains(Perms::EXECUTE);
    let seg_end = segment.vaddr + segment.memsz;
    let file_end = segment.vaddr + segment.filesz;

    let mut start = segment.vaddr;
    while start < seg_end {
        let page = page_round_down(start);
        let end = seg_end.min(page.saturating_add(PAGE_SIZE as u32));
        let filesz = file_end.min(end).saturating_sub(start);
        let chunk = match PendingPte::new(
            executable,
            start - page,
            end - start,
            filesz,
            segment.offset + (start - segment.vaddr),
        ) {
            Some(chunk) => chunk,
            None => kfatal!("elf: chunk at {:#x} does not fit its page", start),
        };
        aspace.install_pending(vm, VirtAddr(page), chunk)?;
        start = end;
    }
    log_debug!(
        target: "elf",
        "segment {:#x}..{:#x} ({:#x} file bytes at {:#x}) pending",
        segment.vaddr,
        seg_end,
        segment.filesz,
        segment.offset
    );
    Ok(())
}
