//! Descriptor records.
//!
//! Next to its element data, every declaration and fragment places one
//! [`GroupDescriptor`] into the `partial_array_meta` section. The record tells
//! the linker which group the data belongs to and what element layout the
//! contributing module compiled against, so that mismatches are caught before
//! an image is written. Fields are stored in target byte order.

use object::{Endian, Endianness};
use thiserror::Error;

use crate::merge::ElementLayout;
use crate::symbol::MAX_GROUP_NAME;

const MAGIC: [u8; 4] = *b"PARR";
const VERSION: u16 = 1;

/// Size in bytes of one encoded record.
pub const RECORD_SIZE: usize = 88;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Emitted by `partial_array!`; carries no elements.
    Declaration,
    /// Emitted by `fragment!`.
    Fragment,
}

impl DescriptorKind {
    const fn code(self) -> u16 {
        match self {
            DescriptorKind::Declaration => 0,
            DescriptorKind::Fragment => 1,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(DescriptorKind::Declaration),
            1 => Some(DescriptorKind::Fragment),
            _ => None,
        }
    }
}

/// The in-memory form of a record, built in const context by the macros.
#[repr(C)]
#[derive(Debug)]
pub struct GroupDescriptor {
    magic: [u8; 4],
    version: u16,
    kind: u16,
    element_size: u32,
    element_align: u32,
    count: u32,
    name_len: u32,
    name: [u8; MAX_GROUP_NAME],
}

const _: () = assert!(core::mem::size_of::<GroupDescriptor>() == RECORD_SIZE);

impl GroupDescriptor {
    pub const fn declaration<T>(group: &str) -> Self {
        Self::new::<T>(DescriptorKind::Declaration, group, 0)
    }

    pub const fn fragment<T>(group: &str, count: usize) -> Self {
        Self::new::<T>(DescriptorKind::Fragment, group, count)
    }

    const fn new<T>(kind: DescriptorKind, group: &str, count: usize) -> Self {
        assert!(core::mem::size_of::<T>() != 0, "partial array elements cannot be zero-sized");
        let bytes = group.as_bytes();
        assert!(bytes.len() <= MAX_GROUP_NAME, "partial array name is longer than 64 bytes");
        let mut name = [0u8; MAX_GROUP_NAME];
        let mut i = 0;
        while i < bytes.len() {
            name[i] = bytes[i];
            i += 1;
        }
        Self {
            magic: MAGIC,
            version: VERSION,
            kind: kind.code(),
            element_size: core::mem::size_of::<T>() as u32,
            element_align: core::mem::align_of::<T>() as u32,
            count: count as u32,
            name_len: bytes.len() as u32,
            name,
        }
    }

    /// The encoded record, as it appears in the object file.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) plain data; the field order leaves no padding.
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, RECORD_SIZE) }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor section is {0} bytes, not a multiple of {RECORD_SIZE}")]
    Truncated(usize),

    #[error("descriptor {index}: bad magic")]
    BadMagic { index: usize },

    #[error("descriptor {index}: unsupported version {version}")]
    UnsupportedVersion { index: usize, version: u16 },

    #[error("descriptor {index}: unknown kind {kind}")]
    UnknownKind { index: usize, kind: u16 },

    #[error("descriptor {index}: malformed group name")]
    BadName { index: usize },
}

/// A record decoded from an input object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRecord {
    pub group: String,
    pub kind: DescriptorKind,
    pub layout: ElementLayout,
    pub count: u64,
}

/// Decodes every record in a `partial_array_meta` section.
pub fn parse_records(data: &[u8], endian: Endianness) -> Result<Vec<DescriptorRecord>, DescriptorError> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(DescriptorError::Truncated(data.len()));
    }
    data.chunks_exact(RECORD_SIZE)
        .enumerate()
        .map(|(index, chunk)| parse_record(index, chunk, endian))
        .collect()
}

fn parse_record(index: usize, chunk: &[u8], endian: Endianness) -> Result<DescriptorRecord, DescriptorError> {
    let u16_at = |at: usize| endian.read_u16_bytes([chunk[at], chunk[at + 1]]);
    let u32_at = |at: usize| endian.read_u32_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]]);

    if chunk[..4] != MAGIC {
        return Err(DescriptorError::BadMagic { index });
    }
    let version = u16_at(4);
    if version != VERSION {
        return Err(DescriptorError::UnsupportedVersion { index, version });
    }
    let kind = u16_at(6);
    let kind = DescriptorKind::from_code(kind).ok_or(DescriptorError::UnknownKind { index, kind })?;

    let name_len = u32_at(20) as usize;
    if name_len > MAX_GROUP_NAME {
        return Err(DescriptorError::BadName { index });
    }
    let name = &chunk[24..24 + name_len];
    let group = std::str::from_utf8(name)
        .map_err(|_| DescriptorError::BadName { index })?
        .to_string();

    Ok(DescriptorRecord {
        group,
        kind,
        layout: ElementLayout::new(u64::from(u32_at(8)), u64::from(u32_at(12))),
        count: u64::from(u32_at(16)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native() -> Endianness {
        if cfg!(target_endian = "little") {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    #[test]
    fn decodes_records_built_by_the_macros() {
        static DECL: GroupDescriptor = GroupDescriptor::declaration::<u64>("hash_algorithms");
        static FRAG: GroupDescriptor = GroupDescriptor::fragment::<[u16; 3]>("hash_algorithms", 5);

        let mut section = DECL.as_bytes().to_vec();
        section.extend_from_slice(FRAG.as_bytes());

        let records = parse_records(&section, native()).unwrap();
        assert_eq!(
            records,
            vec![
                DescriptorRecord {
                    group: "hash_algorithms".to_string(),
                    kind: DescriptorKind::Declaration,
                    layout: ElementLayout::new(8, core::mem::align_of::<u64>() as u64),
                    count: 0,
                },
                DescriptorRecord {
                    group: "hash_algorithms".to_string(),
                    kind: DescriptorKind::Fragment,
                    layout: ElementLayout::new(6, 2),
                    count: 5,
                },
            ]
        );
    }

    #[test]
    fn rejects_partial_records() {
        let err = parse_records(&[0u8; RECORD_SIZE + 3], Endianness::Little).unwrap_err();
        assert_eq!(err, DescriptorError::Truncated(RECORD_SIZE + 3));
    }

    #[test]
    fn rejects_foreign_data() {
        let err = parse_records(&[0u8; RECORD_SIZE], Endianness::Little).unwrap_err();
        assert_eq!(err, DescriptorError::BadMagic { index: 0 });
    }

    #[test]
    fn rejects_unknown_kind_and_long_names() {
        static FRAG: GroupDescriptor = GroupDescriptor::fragment::<u8>("g", 1);
        let mut bytes = FRAG.as_bytes().to_vec();
        bytes[6..8].copy_from_slice(&9u16.to_le_bytes());
        assert_eq!(
            parse_records(&bytes, Endianness::Little).unwrap_err(),
            DescriptorError::UnknownKind { index: 0, kind: 9 }
        );

        let mut bytes = FRAG.as_bytes().to_vec();
        bytes[20..24].copy_from_slice(&200u32.to_le_bytes());
        assert_eq!(
            parse_records(&bytes, Endianness::Little).unwrap_err(),
            DescriptorError::BadName { index: 0 }
        );
    }
}
