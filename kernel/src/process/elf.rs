//! ELF32 Parser
//!
//! Reads the file header and program headers of an i386 executable.
//! Only `PT_LOAD` segments matter to `execv`; everything else is skipped.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::USER_IMAGE_BASE;
use crate::error::{KernelError, KernelResult};
use crate::fs::OpenFile;
use crate::memory::VirtAddr;

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class: 32-bit
pub const ELFCLASS32: u8 = 1;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// ELF type: executable
pub const ET_EXEC: u16 = 2;

/// Machine type: i386
pub const EM_386: u16 = 3;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Size of the ELF32 file header.
pub const EHDR_SIZE: usize = 52;

/// Size of one ELF32 program header.
pub const PHDR_SIZE: usize = 32;

/// Upper bound on program headers we are willing to read.
const MAX_PHNUM: u16 = 64;

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// ELF32 file header (the fields the loader uses).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf32Header {
    pub e_type: u16,
    pub e_machine: u16,
    /// Entry point virtual address
    pub e_entry: u32,
    /// Program header table file offset
    pub e_phoff: u32,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl Elf32Header {
    pub fn parse(bytes: &[u8; EHDR_SIZE]) -> KernelResult<Self> {
        if bytes[..4] != ELF_MAGIC || bytes[4] != ELFCLASS32 || bytes[5] != ELFDATA2LSB {
            return Err(KernelError::BadExecutable);
        }
        let header = Elf32Header {
            e_type: u16_at(bytes, 16),
            e_machine: u16_at(bytes, 18),
            e_entry: u32_at(bytes, 24),
            e_phoff: u32_at(bytes, 28),
            e_phentsize: u16_at(bytes, 42),
            e_phnum: u16_at(bytes, 44),
        };
        if header.e_type != ET_EXEC
            || header.e_machine != EM_386
            || header.e_phentsize as usize != PHDR_SIZE
            || header.e_phnum > MAX_PHNUM
        {
            return Err(KernelError::BadExecutable);
        }
        Ok(header)
    }
}

/// ELF32 program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    /// Segment file offset
    pub p_offset: u32,
    /// Segment virtual address
    pub p_vaddr: u32,
    /// Segment size in file
    pub p_filesz: u32,
    /// Segment size in memory
    pub p_memsz: u32,
    pub p_flags: u32,
}

impl Elf32ProgramHeader {
    pub fn parse(bytes: &[u8]) -> Self {
        Elf32ProgramHeader {
            p_type: u32_at(bytes, 0),
            p_offset: u32_at(bytes, 4),
            p_vaddr: u32_at(bytes, 8),
            p_filesz: u32_at(bytes, 16),
            p_memsz: u32_at(bytes, 20),
            p_flags: u32_at(bytes, 24),
        }
    }
}

/// A validated executable: entry point plus loadable segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfImage {
    pub entry: VirtAddr,
    pub segments: Vec<Elf32ProgramHeader>,
}

impl ElfImage {
    /// Read and validate headers from `file`.
    ///
    /// Every loadable segment must lie in the demand-paged image region
    /// and fit the file.
    pub fn read(file: &OpenFile) -> KernelResult<Self> {
        let mut ehdr = [0u8; EHDR_SIZE];
        file.seek(0);
        file.read_fully(&mut ehdr)?;
        let header = Elf32Header::parse(&ehdr)?;

        let mut table = vec![0u8; header.e_phnum as usize * PHDR_SIZE];
        if file.seek(header.e_phoff) != header.e_phoff {
            return Err(KernelError::BadExecutable);
        }
        file.read_fully(&mut table)?;

        let mut segments = Vec::new();
        for raw in table.chunks_exact(PHDR_SIZE) {
            let phdr = Elf32ProgramHeader::parse(raw);
            if phdr.p_type != PT_LOAD {
                continue;
            }
            let end = phdr.p_vaddr as u64 + phdr.p_memsz as u64;
            let file_end = phdr.p_offset as u64 + phdr.p_filesz as u64;
            if phdr.p_vaddr < USER_IMAGE_BASE
                || end > 1 << 32
                || phdr.p_filesz > phdr.p_memsz
                || file_end > file.len() as u64
            {
                return Err(KernelError::BadExecutable);
            }
            segments.push(phdr);
        }
        if segments.is_empty() || header.e_entry < USER_IMAGE_BASE {
            return Err(KernelError::BadExecutable);
        }
        Ok(ElfImage {
            entry: header.e_entry,
            segments,
        })
    }
}

/// Assembles minimal ELF32 executables for boot images and tests.
pub struct ImageBuilder {
    entry: VirtAddr,
    segments: Vec<(VirtAddr, Vec<u8>, u32)>,
}

impl ImageBuilder {
    pub fn new(entry: VirtAddr) -> Self {
        ImageBuilder {
            entry,
            segments: Vec::new(),
        }
    }

    /// Add a loadable segment with `data` at `vaddr` occupying `memsz` bytes.
    pub fn segment(mut self, vaddr: VirtAddr, data: &[u8], memsz: u32) -> Self {
        self.segments.push((vaddr, data.to_vec(), memsz.max(data.len() as u32)));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut data_off = phoff + self.segments.len() * PHDR_SIZE;
        let mut out = vec![0u8; data_off];
        out[..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS32;
        out[5] = ELFDATA2LSB;
        out[6] = 1;
        out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        out[18..20].copy_from_slice(&EM_386.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..28].copy_from_slice(&self.entry.to_le_bytes());
        out[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
        out[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out[44..46].copy_from_slice(&(self.segments.len() as u16).to_le_bytes());

        let mut payload = Vec::new();
        for (i, (vaddr, data, memsz)) in self.segments.iter().enumerate() {
            let ph = phoff + i * PHDR_SIZE;
            let fields = [PT_LOAD, data_off as u32, *vaddr, *vaddr, data.len() as u32, *memsz, 7, 0x1000];
            for (j, field) in fields.iter().enumerate() {
                out[ph + j * 4..ph + j * 4 + 4].copy_from_slice(&field.to_le_bytes());
            }
            payload.extend_from_slice(data);
            data_off += data.len();
        }
        out.extend_from_slice(&payload);
        out
    }
}
