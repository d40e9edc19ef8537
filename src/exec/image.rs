//! On-disk image header inspection.
//!
//! Parses PE/ELF executables with goblin and extracts what the engine
//! records per module: preferred base, mapped size, machine kind, entry
//! point, and where the debug directory points.

use std::fs;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::machine::context::CpuArch;

/// IMAGE_FILE_MACHINE values carried in module records.
pub const MACHINE_I386: u16 = 0x014c;
pub const MACHINE_AMD64: u16 = 0x8664;

/// Header facts about an executable image on disk.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub machine: u16,
    pub size: u32,
    pub preferred_base: u64,
    pub entry_point: u64,
    pub debug_info_offset: u32,
    pub debug_info_size: u32,
}

impl ImageInfo {
    pub fn arch(&self) -> Option<CpuArch> {
        match self.machine {
            MACHINE_I386 => Some(CpuArch::I386),
            MACHINE_AMD64 => Some(CpuArch::X64),
            _ => None,
        }
    }
}

/// Reads and parses the image headers of the file at `path`.
pub fn probe_image(path: &Path) -> Result<ImageInfo> {
    let data = fs::read(path).map_err(|err| EngineError::Port {
        reason: format!("cannot read image {}: {}", path.display(), err),
    })?;
    parse_image(&data)
}

/// Parses image headers from an in-memory copy of the file.
pub fn parse_image(data: &[u8]) -> Result<ImageInfo> {
    match goblin::Object::parse(data) {
        Ok(goblin::Object::PE(pe)) => Ok(from_pe(&pe)),
        Ok(goblin::Object::Elf(elf)) => Ok(from_elf(&elf)),
        Ok(_) => Err(EngineError::invalid_arg("unsupported image format")),
        Err(err) => Err(EngineError::invalid_arg(format!(
            "malformed image: {}",
            err
        ))),
    }
}

fn from_pe(pe: &goblin::pe::PE<'_>) -> ImageInfo {
    let optional = pe.header.optional_header;
    let debug_dir = optional.and_then(|opt| {
        opt.data_directories
            .get_debug_table()
            .map(|dir| (dir.virtual_address, dir.size))
    });

    ImageInfo {
        machine: pe.header.coff_header.machine,
        size: optional.map_or(0, |opt| opt.windows_fields.size_of_image),
        preferred_base: pe.image_base as u64,
        entry_point: pe.image_base as u64 + pe.entry as u64,
        debug_info_offset: debug_dir.map_or(0, |(rva, _)| rva),
        debug_info_size: debug_dir.map_or(0, |(_, size)| size),
    }
}

fn from_elf(elf: &goblin::elf::Elf<'_>) -> ImageInfo {
    let machine = match (elf.header.e_machine, elf.is_64) {
        (goblin::elf::header::EM_X86_64, true) => MACHINE_AMD64,
        (goblin::elf::header::EM_386, false) => MACHINE_I386,
        _ => 0,
    };

    let loadable = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == goblin::elf::program_header::PT_LOAD);

    let base = loadable.clone().map(|ph| ph.p_vaddr).min().unwrap_or(0);
    let top = loadable
        .map(|ph| ph.p_vaddr + ph.p_memsz)
        .max()
        .unwrap_or(0);

    ImageInfo {
        machine,
        size: top.saturating_sub(base) as u32,
        preferred_base: base,
        entry_point: elf.entry,
        debug_info_offset: 0,
        debug_info_size: 0,
    }
}
