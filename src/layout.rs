//! Output layout.
//!
//! Input sections are copied into aggregated segments. Partial-array groups get
//! a segment of their own in which every group occupies one contiguous block.

use object::read::SectionIndex;
use object::SectionKind;

/// Name of the segment holding merged partial arrays.
pub const GROUP_SEGMENT: &str = ".partial_array";

/// Rounds `value` up to a multiple of `align` (a power of two; 0 means 1).
pub const fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// An input section placed inside a segment.
pub struct Section {
    pub file_index: usize,
    pub section_index: SectionIndex,
    /// Offset of the section within its segment.
    pub offset: u64,
}

/// A region of the output image built from same-kind input sections.
pub struct Segment {
    /// Output section name (e.g. ".text", ".partial_array").
    pub name: String,
    pub sections: Vec<Section>,
    pub size: u64,
    pub virtual_address: u64,
    pub file_offset: u64,
    pub data: Vec<u8>,
    /// Decides permissions and whether bytes are stored in the file.
    pub kind: SectionKind,
}

impl Segment {
    pub fn new(name: &str, kind: SectionKind) -> Self {
        Self {
            name: name.to_string(),
            sections: Vec::new(),
            size: 0,
            virtual_address: 0,
            file_offset: 0,
            data: Vec::new(),
            kind,
        }
    }

    pub fn is_nobits(&self) -> bool {
        self.kind == SectionKind::UninitializedData
    }

    /// Appends one input section, padding to `align` first.
    ///
    /// `bytes` may be shorter than `size` (e.g. zero-initialized data); the
    /// remainder is zero filled. Returns the section's offset in the segment.
    pub fn place(
        &mut self,
        file_index: usize,
        section_index: SectionIndex,
        bytes: &[u8],
        size: u64,
        align: u64,
    ) -> u64 {
        let offset = align_up(self.size, align);
        self.size = offset + size;
        if !self.is_nobits() {
            self.data.resize(offset as usize, 0);
            self.data.extend_from_slice(&bytes[..bytes.len().min(size as usize)]);
            self.data.resize(self.size as usize, 0);
        }
        self.sections.push(Section { file_index, section_index, offset });
        offset
    }

    /// Pads the segment so the next placement starts at a multiple of `align`.
    pub fn pad_to(&mut self, align: u64) -> u64 {
        self.size = align_up(self.size, align);
        if !self.is_nobits() {
            self.data.resize(self.size as usize, 0);
        }
        self.size
    }

    pub fn end_address(&self) -> u64 {
        self.virtual_address + self.size
    }
}

/// Where one merged group landed inside the group segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupBlock {
    pub start_offset: u64,
    pub end_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(13, 1), 13);
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn placement_pads_and_zero_fills() {
        let mut segment = Segment::new(GROUP_SEGMENT, SectionKind::Data);
        let first = segment.place(0, SectionIndex(1), &[1, 2, 3], 3, 1);
        let second = segment.place(1, SectionIndex(4), &[9, 9], 4, 4);

        assert_eq!(first, 0);
        assert_eq!(second, 4);
        assert_eq!(segment.size, 8);
        assert_eq!(segment.data, vec![1, 2, 3, 0, 9, 9, 0, 0]);
        assert_eq!(segment.sections.len(), 2);
    }

    #[test]
    fn nobits_segments_track_size_only() {
        let mut segment = Segment::new(".bss", SectionKind::UninitializedData);
        segment.place(0, SectionIndex(2), &[], 16, 8);
        assert_eq!(segment.pad_to(32), 32);
        assert!(segment.data.is_empty());
    }
}
