//! Architecture abstraction.
//!
//! Everything the linker needs to know about a target lives behind
//! [`Architecture`]: the byte order used to decode descriptor records and the
//! arithmetic for each relocation kind.

use anyhow::Result;
use object::read::Relocation;
use object::Endianness;

pub mod x86_64;

/// One relocation, resolved to addresses.
#[derive(Debug, Clone, Copy)]
pub struct RelocationSite {
    /// Offset of the patched bytes inside the segment buffer.
    pub offset: u64,
    /// Run-time address of the patched bytes (P).
    pub place: u64,
    /// Symbol value or GOT slot address (S).
    pub symbol: u64,
    /// Explicit addend (A).
    pub addend: i64,
}

pub trait Architecture {
    fn endianness(&self) -> Endianness;

    /// Patches `data` for `reloc` at `site`.
    fn apply_relocation(&self, reloc: &Relocation, site: RelocationSite, data: &mut [u8]) -> Result<()>;
}
