// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Big-endian ELF32 fixtures for the integration tests.

#![allow(dead_code)]

use std::io::Cursor;

use byteorder::{BigEndian, WriteBytesExt};
use goblin::elf::header::{ELFCLASS32, ELFDATA2MSB, EM_MIPS, ET_EXEC, EV_CURRENT};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct Phdr {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
}

impl Phdr {
    pub fn load(offset: u32, vaddr: u32, filesz: u32, memsz: u32, flags: u32) -> Self {
        Self { p_type: PT_LOAD, offset, vaddr, filesz, memsz, flags }
    }

    pub fn code(offset: u32, vaddr: u32, filesz: u32, memsz: u32) -> Self {
        Self::load(offset, vaddr, filesz, memsz, PF_R | PF_X)
    }

    pub fn data(offset: u32, vaddr: u32, filesz: u32, memsz: u32) -> Self {
        Self::load(offset, vaddr, filesz, memsz, PF_R | PF_W)
    }
}

/// Builder for a minimal executable image.
pub struct ElfImage {
    pub class: u8,
    pub data: u8,
    pub e_type: u16,
    pub machine: u16,
    pub entry: u32,
    pub phdrs: Vec<Phdr>,
    pub blobs: Vec<(u32, Vec<u8>)>,
}

impl ElfImage {
    pub fn new(entry: u32) -> Self {
        Self {
            class: ELFCLASS32,
            data: ELFDATA2MSB,
            e_type: ET_EXEC,
            machine: EM_MIPS,
            entry,
            phdrs: Vec::new(),
            blobs: Vec::new(),
        }
    }

    pub fn segment(mut self, phdr: Phdr) -> Self {
        self.phdrs.push(phdr);
        self
    }

    /// Places `bytes` at file offset `offset`.
    pub fn blob(mut self, offset: u32, bytes: Vec<u8>) -> Self {
        self.blobs.push((offset, bytes));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(b"\x7fELF");
        ident[4] = self.class;
        ident[5] = self.data;
        ident[6] = EV_CURRENT;
        cursor.get_mut().extend_from_slice(&ident);
        cursor.set_position(16);
        cursor.write_u16::<BigEndian>(self.e_type).unwrap();
        cursor.write_u16::<BigEndian>(self.machine).unwrap();
        cursor.write_u32::<BigEndian>(u32::from(EV_CURRENT)).unwrap(); // e_version
        cursor.write_u32::<BigEndian>(self.entry).unwrap();
        cursor.write_u32::<BigEndian>(EHDR_SIZE as u32).unwrap(); // e_phoff
        cursor.write_u32::<BigEndian>(0).unwrap(); // e_shoff
        cursor.write_u32::<BigEndian>(0).unwrap(); // e_flags
        cursor.write_u16::<BigEndian>(EHDR_SIZE as u16).unwrap();
        cursor.write_u16::<BigEndian>(PHDR_SIZE as u16).unwrap();
        cursor.write_u16::<BigEndian>(self.phdrs.len() as u16).unwrap();
        cursor.write_u16::<BigEndian>(40).unwrap(); // e_shentsize
        cursor.write_u16::<BigEndian>(0).unwrap(); // e_shnum
        cursor.write_u16::<BigEndian>(0).unwrap(); // e_shstrndx

        for ph in &self.phdrs {
            cursor.write_u32::<BigEndian>(ph.p_type).unwrap();
            cursor.write_u32::<BigEndian>(ph.offset).unwrap();
            cursor.write_u32::<BigEndian>(ph.vaddr).unwrap();
            cursor.write_u32::<BigEndian>(ph.vaddr).unwrap(); // p_paddr
            cursor.write_u32::<BigEndian>(ph.filesz).unwrap();
            cursor.write_u32::<BigEndian>(ph.memsz).unwrap();
            cursor.write_u32::<BigEndian>(ph.flags).unwrap();
            cursor.write_u32::<BigEndian>(0x1000).unwrap(); // p_align
        }

        let mut image = cursor.into_inner();
        for (offset, bytes) in &self.blobs {
            let start = *offset as usize;
            if image.len() < start + bytes.len() {
                image.resize(start + bytes.len(), 0);
            }
            image[start..start + bytes.len()].copy_from_slice(bytes);
        }
        image
    }
}

/// Recognisable, non-zero file contents.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed | 1).collect()
}
