//! ELF executable writer.
//!
//! The image is one RWX `PT_LOAD` covering every segment, followed by section
//! headers for the segments plus `.symtab`, `.strtab` and `.shstrtab`. The
//! symbol table carries the partial-array boundary symbols so the merged
//! groups can be inspected with ordinary tools.

use anyhow::{Context, Result};
use object::elf;
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::layout::{align_up, Segment};

pub const PAGE_SIZE: u64 = 0x1000;
pub const BASE_ADDR: u64 = 0x400000;

const FILE_HEADER_SIZE: u64 = 64;
const PROGRAM_HEADER_SIZE: u64 = 56;
const SECTION_HEADER_SIZE: u64 = 64;
const SYMBOL_SIZE: u64 = 24;

const E: Endianness = Endianness::Little;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(E, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(E, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(E, v)
}

/// A symbol to list in `.symtab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSymbol {
    pub name: String,
    pub address: u64,
    /// Index into the segment list, `None` for absolute symbols.
    pub segment: Option<usize>,
}

/// Accumulates a NUL-separated string table.
#[derive(Default)]
struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, name: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }
}

fn section_flags(segment: &Segment) -> u64 {
    use object::SectionKind;
    let flags = match segment.kind {
        SectionKind::Text => elf::SHF_ALLOC | elf::SHF_EXECINSTR,
        SectionKind::Data | SectionKind::UninitializedData => elf::SHF_ALLOC | elf::SHF_WRITE,
        SectionKind::Tls => elf::SHF_ALLOC | elf::SHF_WRITE | elf::SHF_TLS,
        _ => elf::SHF_ALLOC,
    };
    u64::from(flags)
}

#[allow(clippy::too_many_arguments)]
fn section_header(
    name: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
) -> elf::SectionHeader64<Endianness> {
    elf::SectionHeader64 {
        sh_name: u32(name),
        sh_type: u32(sh_type),
        sh_flags: u64(flags),
        sh_addr: u64(addr),
        sh_offset: u64(offset),
        sh_size: u64(size),
        sh_link: u32(link),
        sh_info: u32(info),
        sh_addralign: u64(align),
        sh_entsize: u64(entsize),
    }
}

/// Serializes the image into memory.
pub fn build_elf(segments: &[Segment], symbols: &[OutputSymbol], entry_point: u64) -> Vec<u8> {
    // Section header indices: 0 null, 1..=n segments, then the three tables.
    let symtab_index = segments.len() as u32 + 1;
    let strtab_index = symtab_index + 1;
    let shstrtab_index = strtab_index + 1;
    let num_sections = shstrtab_index + 1;

    let mut buffer = Vec::new();
    let file_header = elf::FileHeader64::<Endianness> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(elf::ET_EXEC),
        e_machine: u16(elf::EM_X86_64),
        e_version: u32(u32::from(elf::EV_CURRENT)),
        e_entry: u64(entry_point),
        e_phoff: u64(FILE_HEADER_SIZE),
        e_shoff: u64(0), // patched below
        e_flags: u32(0),
        e_ehsize: u16(FILE_HEADER_SIZE as u16),
        e_phentsize: u16(PROGRAM_HEADER_SIZE as u16),
        e_phnum: u16(1),
        e_shentsize: u16(SECTION_HEADER_SIZE as u16),
        e_shnum: u16(num_sections as u16),
        e_shstrndx: u16(shstrtab_index as u16),
    };
    buffer.extend_from_slice(bytes_of(&file_header));

    let file_size = segments
        .iter()
        .filter(|s| !s.is_nobits() && s.size > 0)
        .map(|s| s.file_offset + s.size)
        .max()
        .unwrap_or(PAGE_SIZE);
    let mem_size = segments
        .iter()
        .filter(|s| s.virtual_address > 0)
        .map(Segment::end_address)
        .max()
        .unwrap_or(BASE_ADDR)
        - BASE_ADDR;

    let prog_header = elf::ProgramHeader64::<Endianness> {
        p_type: u32(elf::PT_LOAD),
        p_flags: u32(elf::PF_R | elf::PF_W | elf::PF_X),
        p_offset: u64(0),
        p_vaddr: u64(BASE_ADDR),
        p_paddr: u64(BASE_ADDR),
        p_filesz: u64(file_size),
        p_memsz: u64(mem_size.max(file_size)),
        p_align: u64(PAGE_SIZE),
    };
    buffer.extend_from_slice(bytes_of(&prog_header));

    if (buffer.len() as u64) < PAGE_SIZE {
        buffer.resize(PAGE_SIZE as usize, 0);
    }
    for segment in segments.iter().filter(|s| !s.is_nobits() && s.size > 0) {
        if segment.file_offset > buffer.len() as u64 {
            buffer.resize(segment.file_offset as usize, 0);
        }
        buffer.extend_from_slice(&segment.data);
    }

    // .symtab / .strtab
    let mut strtab = StringTable::new();
    buffer.resize(align_up(buffer.len() as u64, 8) as usize, 0);
    let symtab_offset = buffer.len() as u64;
    buffer.extend_from_slice(bytes_of(&elf::Sym64::<Endianness>::default()));
    for symbol in symbols {
        let shndx = match symbol.segment {
            Some(index) => index as u16 + 1,
            None => elf::SHN_ABS,
        };
        let sym = elf::Sym64::<Endianness> {
            st_name: u32(strtab.add(&symbol.name)),
            st_info: (elf::STB_GLOBAL << 4) | elf::STT_NOTYPE,
            st_other: elf::STV_DEFAULT,
            st_shndx: u16(shndx),
            st_value: u64(symbol.address),
            st_size: u64(0),
        };
        buffer.extend_from_slice(bytes_of(&sym));
    }
    let symtab_size = buffer.len() as u64 - symtab_offset;
    let strtab_offset = buffer.len() as u64;
    buffer.extend_from_slice(&strtab.bytes);

    // .shstrtab
    let mut shstrtab = StringTable::new();
    let segment_names: Vec<u32> = segments.iter().map(|s| shstrtab.add(&s.name)).collect();
    let symtab_name = shstrtab.add(".symtab");
    let strtab_name = shstrtab.add(".strtab");
    let shstrtab_name = shstrtab.add(".shstrtab");
    let shstrtab_offset = buffer.len() as u64;
    buffer.extend_from_slice(&shstrtab.bytes);

    buffer.resize(align_up(buffer.len() as u64, 8) as usize, 0);
    let shoff = buffer.len() as u64;

    buffer.extend_from_slice(bytes_of(&section_header(0, elf::SHT_NULL, 0, 0, 0, 0, 0, 0, 0, 0)));
    for (segment, name) in segments.iter().zip(segment_names) {
        let sh_type = if segment.is_nobits() { elf::SHT_NOBITS } else { elf::SHT_PROGBITS };
        buffer.extend_from_slice(bytes_of(&section_header(
            name,
            sh_type,
            section_flags(segment),
            segment.virtual_address,
            segment.file_offset,
            segment.size,
            0,
            0,
            16,
            0,
        )));
    }
    buffer.extend_from_slice(bytes_of(&section_header(
        symtab_name,
        elf::SHT_SYMTAB,
        0,
        0,
        symtab_offset,
        symtab_size,
        strtab_index,
        1, // every listed symbol is global
        8,
        SYMBOL_SIZE,
    )));
    buffer.extend_from_slice(bytes_of(&section_header(
        strtab_name,
        elf::SHT_STRTAB,
        0,
        0,
        strtab_offset,
        strtab.bytes.len() as u64,
        0,
        0,
        1,
        0,
    )));
    buffer.extend_from_slice(bytes_of(&section_header(
        shstrtab_name,
        elf::SHT_STRTAB,
        0,
        0,
        shstrtab_offset,
        shstrtab.bytes.len() as u64,
        0,
        0,
        1,
        0,
    )));

    buffer[40..48].copy_from_slice(&shoff.to_le_bytes());
    buffer
}

/// Writes the image to `output_path` and marks it executable.
pub fn write_elf(output_path: &Path, segments: &[Segment], symbols: &[OutputSymbol], entry_point: u64) -> Result<()> {
    let buffer = build_elf(segments, symbols, entry_point);
    std::fs::write(output_path, &buffer)
        .with_context(|| format!("failed to write {}", output_path.display()))?;

    let mut perms = std::fs::metadata(output_path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(output_path, perms)?;
    Ok(())
}
