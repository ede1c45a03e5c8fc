//! Core Linker logic.
//!
//! The `Linker` drives the whole link:
//! 1. Input Loading: reads object files and archives, collecting symbols,
//!    descriptor records and partial-array fragment sections.
//! 2. Group Resolution: checks every group for a consistent element type and
//!    for a producer behind every reference.
//! 3. Verification: every other strong undefined symbol must be defined.
//! 4. Layout: maps input sections to output segments, merges each group into one
//!    contiguous block and binds its boundary symbols.
//! 5. Relocation: patches code and data, group data included.
//! 6. Output: writes the ELF executable.

use anyhow::{anyhow, Context, Result};
use object::read::{Object, ObjectSection, RelocationTarget, SectionIndex};
use object::{ObjectSymbol, RelocationKind, SectionKind, SymbolKind};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::arch::x86_64::is_gotpcrelx;
use crate::arch::{Architecture, RelocationSite};
use crate::descriptor::{parse_records, DescriptorKind};
use crate::layout::{GroupBlock, Segment, GROUP_SEGMENT};
use crate::merge::{BoundaryMetadata, ElementSignature, GroupTable, MergeError, MergeGroup};
use crate::symbol::{
    boundary_symbol, group_of_section, is_optional_symbol, parse_boundary_symbol, parse_declaration_guard, Boundary,
    DefinedSymbol, META_SECTION,
};
use crate::writer::{self, OutputSymbol, BASE_ADDR, PAGE_SIZE};

const TEXT: usize = 0;
const RODATA: usize = 1;
const DATA: usize = 2;
const BSS: usize = 3;
const GOT: usize = 4;
const TDATA: usize = 5;
const GROUPS: usize = 6;

// SHT_INIT_ARRAY / SHT_FINI_ARRAY
const SHT_INIT_ARRAY: u32 = 14;
const SHT_FINI_ARRAY: u32 = 15;

/// Whether a relocation needs a GOT slot (including the GOTPCRELX variants).
fn is_got_relocation(reloc: &object::read::Relocation) -> bool {
    matches!(reloc.kind(), RelocationKind::Got | RelocationKind::GotRelative) || is_gotpcrelx(reloc)
}

/// A fragment section as found in an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSection {
    pub file_index: usize,
    pub section_index: SectionIndex,
    pub size: u64,
    pub align: u64,
}

pub struct Linker<'a, A: Architecture> {
    arch: A,
    input_objects: Vec<object::File<'a>>,
    input_paths: Vec<String>,
    symbol_table: HashMap<String, DefinedSymbol>,
    segments: Vec<Segment>,
    section_map: HashMap<(usize, SectionIndex), (usize, u64)>,
    got_map: HashMap<String, u64>,
    /// Symbols that are allowed to remain undefined (weak, hidden or
    /// compiler-internal markers), resolving to address 0.
    allowed_undefined: HashSet<String>,
    group_table: GroupTable<FragmentSection>,
    groups: Vec<MergeGroup<FragmentSection>>,
    /// Boundary symbol name -> (segment index, offset).
    boundaries: HashMap<String, (usize, u64)>,
    group_blocks: Vec<(String, GroupBlock)>,
}

impl<'a, A: Architecture> Linker<'a, A> {
    pub fn new(arch: A) -> Self {
        Self {
            arch,
            input_objects: Vec::new(),
            input_paths: Vec::new(),
            symbol_table: HashMap::new(),
            segments: Vec::new(),
            section_map: HashMap::new(),
            got_map: HashMap::new(),
            allowed_undefined: HashSet::new(),
            group_table: GroupTable::new(),
            groups: Vec::new(),
            boundaries: HashMap::new(),
            group_blocks: Vec::new(),
        }
    }

    /// Adds an object file or an `ar` archive. Every archive member is linked.
    pub fn add_file(&mut self, path: &Path, data: &'a [u8]) -> Result<()> {
        if data.starts_with(b"!<arch>\n") {
            let archive = object::read::archive::ArchiveFile::parse(data)
                .with_context(|| format!("failed to parse archive {}", path.display()))?;
            for member in archive.members() {
                let member = member?;
                let name = String::from_utf8_lossy(member.name()).to_string();
                let bytes = member.data(data)?;
                let parsed = if bytes.as_ptr().align_offset(8) != 0 {
                    let leaked: &'a [u8] = Box::leak(bytes.to_vec().into_boxed_slice());
                    object::File::parse(leaked)
                } else {
                    object::File::parse(bytes)
                };
                let obj = parsed.with_context(|| format!("failed to parse archive member {name}"))?;
                let member_path = format!("{}({})", path.display(), name);
                self.process_object(member_path, obj)?;
            }
        } else {
            let obj = object::File::parse(data)
                .with_context(|| format!("failed to parse object file {}", path.display()))?;
            self.process_object(path.display().to_string(), obj)?;
        }
        Ok(())
    }

    /// Check if a symbol is a compiler-internal marker or optional feature
    /// that should resolve to address 0 if not defined.
    fn is_stub_symbol(&self, name: &str, sym: Option<&object::Symbol>) -> bool {
        if let Some(s) = sym {
            if s.is_weak() {
                return true;
            }
            if let object::SymbolFlags::Elf { st_other, .. } = s.flags() {
                if (st_other & 0x03) == object::elf::STV_HIDDEN && parse_boundary_symbol(name).is_none() {
                    return true;
                }
            }
            if s.kind() == SymbolKind::Tls && s.is_undefined() {
                return true;
            }
        }
        is_optional_symbol(name)
    }

    fn process_object(&mut self, path: String, obj: object::File<'a>) -> Result<()> {
        let file_index = self.input_objects.len();

        for sym in obj.symbols() {
            let name = sym.name()?;
            if sym.is_undefined() {
                if let Some((_, group)) = parse_boundary_symbol(name) {
                    if sym.is_weak() {
                        // Binds to the group when one exists, 0 otherwise.
                        self.allowed_undefined.insert(name.to_string());
                    } else {
                        self.group_table.add_reference(group, &path)?;
                    }
                    continue;
                }
                if self.is_stub_symbol(name, Some(&sym)) {
                    self.allowed_undefined.insert(name.to_string());
                }
                continue;
            }

            if sym.is_local() {
                continue;
            }
            let is_weak = sym.is_weak();
            if let Some(existing) = self.symbol_table.get(name) {
                if let Some(group) = parse_declaration_guard(name).filter(|_| !existing.is_weak && !is_weak) {
                    return Err(MergeError::DuplicateDeclaration {
                        group: group.to_string(),
                        first: self.input_paths.get(existing.input_file_index).unwrap_or(&path).clone(),
                        second: path,
                    }
                    .into());
                }
                if !(existing.is_weak && !is_weak) {
                    continue;
                }
            }
            let (section_index, is_absolute) = match sym.section_index() {
                Some(index) => (index, false),
                None => (SectionIndex(0), true),
            };
            self.symbol_table.insert(
                name.to_string(),
                DefinedSymbol {
                    input_file_index: file_index,
                    section_index,
                    value: sym.address(),
                    is_weak,
                    is_absolute,
                },
            );
        }

        for section in obj.sections() {
            let name = section.name()?;
            if name == META_SECTION {
                let records = parse_records(section.data()?, self.arch.endianness())
                    .with_context(|| format!("bad partial array descriptors in {path}"))?;
                for record in records {
                    self.group_table
                        .declare(&record.group, &path, ElementSignature::from_layout(record.layout))?;
                    if record.kind == DescriptorKind::Fragment {
                        self.group_table.describe_elements(&record.group, &path, record.count)?;
                    }
                }
            } else if let Some(group) = group_of_section(name) {
                self.group_table.add_fragment(
                    group,
                    &path,
                    FragmentSection {
                        file_index,
                        section_index: section.index(),
                        size: section.size(),
                        align: section.align().max(1),
                    },
                )?;
            }
        }

        self.input_objects.push(obj);
        self.input_paths.push(path);
        Ok(())
    }

    /// Closes the group table: type consistency, undefined groups and
    /// fragment sizes are all checked here, before anything is laid out.
    pub fn resolve_groups(&mut self) -> Result<()> {
        let groups = std::mem::take(&mut self.group_table).finish()?;

        for group in &groups {
            let Some(layout) = group.element_layout() else {
                tracing::debug!("partial array `{}` has no descriptors; element size unknown", group.name);
                continue;
            };
            let mut bytes = 0;
            for fragment in &group.fragments {
                if fragment.size % layout.size != 0 {
                    return Err(MergeError::RaggedFragment {
                        group: group.name.clone(),
                        module: self.input_paths[fragment.file_index].clone(),
                        bytes: fragment.size,
                        element_size: layout.size,
                    }
                    .into());
                }
                bytes += fragment.size;
            }
            if bytes != group.described_elements * layout.size {
                tracing::warn!(
                    "partial array `{}`: {} bytes of fragments but descriptors account for {} elements",
                    group.name,
                    bytes,
                    group.described_elements
                );
            }
        }

        self.groups = groups;
        Ok(())
    }

    fn is_defined(&self, name: &str) -> bool {
        name == "_GLOBAL_OFFSET_TABLE_"
            || self.symbol_table.contains_key(name)
            || parse_boundary_symbol(name).is_some_and(|(_, group)| self.groups.iter().any(|g| g.name == group))
            || self.allowed_undefined.contains(name)
            || self.is_stub_symbol(name, None)
    }

    /// Fails on the first relocation whose target symbol nothing defines.
    pub fn verify_unresolved(&self) -> Result<()> {
        for (file_index, obj) in self.input_objects.iter().enumerate() {
            for section in obj.sections() {
                for (_, reloc) in section.relocations() {
                    if let RelocationTarget::Symbol(idx) = reloc.target() {
                        let sym = obj.symbol_by_index(idx)?;
                        let name = sym.name()?;
                        if sym.is_undefined() && !self.is_stub_symbol(name, Some(&sym)) && !self.is_defined(name) {
                            return Err(anyhow!(
                                "undefined symbol: name={}, file={}",
                                name,
                                self.input_paths[file_index]
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn layout(&mut self) -> Result<()> {
        self.segments.push(Segment::new(".text", SectionKind::Text));
        self.segments.push(Segment::new(".rodata", SectionKind::ReadOnlyData));
        self.segments.push(Segment::new(".data", SectionKind::Data));
        self.segments.push(Segment::new(".bss", SectionKind::UninitializedData));
        self.segments.push(Segment::new(".got", SectionKind::Data));
        self.segments.push(Segment::new(".tdata", SectionKind::Tls));
        self.segments.push(Segment::new(GROUP_SEGMENT, SectionKind::Data));

        for (file_index, obj) in self.input_objects.iter().enumerate() {
            for section in obj.sections() {
                let size = section.size();
                if size == 0 {
                    continue;
                }
                let name = section.name().unwrap_or("?");
                if name == META_SECTION || group_of_section(name).is_some() {
                    continue;
                }
                let kind = section.kind();
                let segment_idx = match kind {
                    SectionKind::Text => TEXT,
                    SectionKind::ReadOnlyData | SectionKind::ReadOnlyString => RODATA,
                    SectionKind::Data => DATA,
                    SectionKind::UninitializedData => BSS,
                    SectionKind::Tls => TDATA,
                    SectionKind::Elf(SHT_INIT_ARRAY) | SectionKind::Elf(SHT_FINI_ARRAY) => DATA,
                    _ => {
                        tracing::debug!("Skipping section {} (kind: {:?}, size: {})", name, kind, size);
                        continue;
                    }
                };
                let bytes = if kind == SectionKind::UninitializedData { &[][..] } else { section.data()? };
                let offset = self.segments[segment_idx].place(
                    file_index,
                    section.index(),
                    bytes,
                    size,
                    section.align().max(1),
                );
                self.section_map.insert((file_index, section.index()), (segment_idx, offset));
            }
        }

        self.layout_groups()?;
        self.layout_got()?;

        let mut current_va = BASE_ADDR + PAGE_SIZE;
        let mut current_off = PAGE_SIZE;
        for segment in &mut self.segments {
            if segment.size == 0 {
                continue;
            }
            current_va = align_up_page(current_va);
            current_off = align_up_page(current_off);
            segment.virtual_address = current_va;
            segment.file_offset = current_off;
            current_va += segment.size;
            if !segment.is_nobits() {
                current_off += segment.size;
            }
        }
        Ok(())
    }

    /// Concatenates the fragments of each group, in link order, and binds
    /// the group's boundary symbols around the block.
    fn layout_groups(&mut self) -> Result<()> {
        for group in &self.groups {
            let align = match group.element_layout() {
                Some(layout) => layout.align.max(1),
                None => group.fragments.iter().map(|f| f.align).max().unwrap_or(1),
            };

            let segment = &mut self.segments[GROUPS];
            let start_offset = segment.pad_to(align);
            for fragment in &group.fragments {
                if fragment.align > align {
                    tracing::warn!(
                        "partial array `{}`: fragment in {} asks for alignment {} but elements are packed at {}",
                        group.name,
                        self.input_paths[fragment.file_index],
                        fragment.align,
                        align
                    );
                }
                let obj = &self.input_objects[fragment.file_index];
                let section = obj.section_by_index(fragment.section_index)?;
                let offset = segment.place(
                    fragment.file_index,
                    fragment.section_index,
                    section.data()?,
                    fragment.size,
                    align,
                );
                tracing::debug!(
                    "partial array `{}`: {} bytes from {} at offset {:#x}",
                    group.name,
                    fragment.size,
                    self.input_paths[fragment.file_index],
                    offset
                );
                self.section_map.insert((fragment.file_index, fragment.section_index), (GROUPS, offset));
            }
            let end_offset = segment.size;

            self.boundaries
                .insert(boundary_symbol(Boundary::Start, &group.name), (GROUPS, start_offset));
            self.boundaries
                .insert(boundary_symbol(Boundary::Stop, &group.name), (GROUPS, end_offset));
            self.group_blocks.push((group.name.clone(), GroupBlock { start_offset, end_offset }));
        }
        Ok(())
    }

    fn layout_got(&mut self) -> Result<()> {
        let mut got_offset = 0;
        for obj in &self.input_objects {
            for section in obj.sections() {
                for (_, reloc) in section.relocations() {
                    let RelocationTarget::Symbol(idx) = reloc.target() else {
                        continue;
                    };
                    let sym = obj.symbol_by_index(idx)?;
                    if !is_got_relocation(&reloc) && sym.kind() != SymbolKind::Tls {
                        continue;
                    }
                    let name = sym.name()?;
                    if !self.got_map.contains_key(name) {
                        self.got_map.insert(name.to_string(), got_offset);
                        got_offset += 8;
                    }
                }
            }
        }
        let got = &mut self.segments[GOT];
        got.size = got_offset;
        got.data.resize(got_offset as usize, 0);
        Ok(())
    }

    fn resolve_symbol_va(&self, file_index: usize, sym: &object::Symbol) -> Result<u64> {
        if sym.kind() == SymbolKind::Section {
            let sec_idx = sym.section_index().context("section symbol without index")?;
            return Ok(self.get_section_addr(file_index, sec_idx).unwrap_or(0));
        }

        if sym.is_local() {
            if let Some(sec_idx) = sym.section_index() {
                let base = self.get_section_addr(file_index, sec_idx).unwrap_or(0);
                return Ok(base + sym.address());
            }
            return Ok(sym.address());
        }

        let name = sym.name()?;
        self.symbol_address(name)
            .ok_or_else(|| anyhow!("symbol missing: name={}, file={}", name, self.input_paths[file_index]))
    }

    fn fill_got(&mut self) {
        let updates: Vec<(u64, u64)> = self
            .got_map
            .iter()
            .map(|(name, offset)| (*offset, self.symbol_address(name).unwrap_or(0)))
            .collect();
        let got = &mut self.segments[GOT];
        for (offset, addr) in updates {
            got.data[offset as usize..offset as usize + 8].copy_from_slice(&addr.to_le_bytes());
        }
    }

    pub fn relocate(&mut self) -> Result<()> {
        self.fill_got();
        let got_va = self.segments[GOT].virtual_address;

        for seg_idx in 0..self.segments.len() {
            let mut patches = Vec::new();
            {
                let segment = &self.segments[seg_idx];
                for input_section in &segment.sections {
                    let obj = &self.input_objects[input_section.file_index];
                    let section = obj.section_by_index(input_section.section_index)?;
                    let section_va = segment.virtual_address + input_section.offset;

                    for (offset, reloc) in section.relocations() {
                        let target_va = match reloc.target() {
                            RelocationTarget::Symbol(idx) => {
                                let sym = obj.symbol_by_index(idx)?;
                                if is_got_relocation(&reloc) || sym.kind() == SymbolKind::Tls {
                                    let slot = self.got_map.get(sym.name()?).context("GOT entry missing")?;
                                    got_va + slot
                                } else {
                                    self.resolve_symbol_va(input_section.file_index, &sym)?
                                }
                            }
                            RelocationTarget::Section(sec_idx) => {
                                self.get_section_addr(input_section.file_index, sec_idx).unwrap_or(0)
                            }
                            _ => continue,
                        };
                        let site = RelocationSite {
                            offset: input_section.offset + offset,
                            place: section_va + offset,
                            symbol: target_va,
                            addend: reloc.addend(),
                        };
                        patches.push((reloc, site));
                    }
                }
            }

            let segment_data = &mut self.segments[seg_idx].data;
            for (reloc, site) in patches {
                self.arch.apply_relocation(&reloc, site, segment_data)?;
            }
        }
        Ok(())
    }

    /// Final address of a global symbol, a boundary symbol, or a stub.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        if name == "_GLOBAL_OFFSET_TABLE_" {
            return Some(self.segments.get(GOT)?.virtual_address);
        }

        if let Some(sym) = self.symbol_table.get(name) {
            if sym.is_absolute {
                return Some(sym.value);
            }
            if let Some((seg_idx, off)) = self.section_map.get(&(sym.input_file_index, sym.section_index)) {
                return Some(self.segments[*seg_idx].virtual_address + off + sym.value);
            }
        }

        if let Some((seg_idx, off)) = self.boundaries.get(name) {
            return Some(self.segments[*seg_idx].virtual_address + off);
        }

        if self.allowed_undefined.contains(name) || self.is_stub_symbol(name, None) {
            return Some(0);
        }

        None
    }

    fn get_section_addr(&self, file_index: usize, section_index: SectionIndex) -> Option<u64> {
        let (seg_idx, offset) = self.section_map.get(&(file_index, section_index))?;
        Some(self.segments[*seg_idx].virtual_address + offset)
    }

    /// Boundary metadata of every merged group, in name order.
    pub fn groups(&self) -> Vec<BoundaryMetadata> {
        let base = self.segments.get(GROUPS).map_or(0, |s| s.virtual_address);
        self.group_blocks
            .iter()
            .map(|(name, block)| {
                let element_size = self
                    .groups
                    .iter()
                    .find(|g| &g.name == name)
                    .and_then(|g| g.element_layout())
                    .map(|layout| layout.size);
                BoundaryMetadata {
                    group: name.clone(),
                    start: base + block.start_offset,
                    end: base + block.end_offset,
                    element_size,
                }
            })
            .collect()
    }

    /// Bytes of the image at `address`, if it falls inside a file-backed segment.
    pub fn read_bytes(&self, address: u64, len: usize) -> Option<&[u8]> {
        let segment = self
            .segments
            .iter()
            .find(|s| !s.is_nobits() && address >= s.virtual_address && address < s.end_address())?;
        let start = (address - segment.virtual_address) as usize;
        segment.data.get(start..start + len)
    }

    fn output_symbols(&self) -> Vec<OutputSymbol> {
        let mut symbols: Vec<OutputSymbol> = self
            .boundaries
            .iter()
            .map(|(name, (seg_idx, off))| OutputSymbol {
                name: name.clone(),
                address: self.segments[*seg_idx].virtual_address + off,
                segment: Some(*seg_idx),
            })
            .collect();
        for (name, sym) in &self.symbol_table {
            if sym.is_absolute {
                symbols.push(OutputSymbol { name: name.clone(), address: sym.value, segment: None });
            } else if let Some((seg_idx, off)) = self.section_map.get(&(sym.input_file_index, sym.section_index)) {
                symbols.push(OutputSymbol {
                    name: name.clone(),
                    address: self.segments[*seg_idx].virtual_address + off + sym.value,
                    segment: Some(*seg_idx),
                });
            }
        }
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        symbols
    }

    pub fn write(&self, output_path: &Path) -> Result<()> {
        let entry_point = self.symbol_address("_start").unwrap_or(0);
        writer::write_elf(output_path, &self.segments, &self.output_symbols(), entry_point)
    }
}

fn align_up_page(value: u64) -> u64 {
    crate::layout::align_up(value, PAGE_SIZE)
}
