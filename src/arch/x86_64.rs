//! x86_64 backend (ELF64, little endian).

use super::{Architecture, RelocationSite};
use anyhow::{anyhow, bail, Result};
use object::read::Relocation;
use object::{Endianness, RelocationEncoding, RelocationFlags, RelocationKind};

// ELF x86_64 relocation types the object crate reports as `Unknown`.
pub const R_X86_64_GOTPCRELX: u32 = 41;
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;

/// Whether the relocation is one of the relaxable GOT-relative forms.
pub fn is_gotpcrelx(reloc: &Relocation) -> bool {
    matches!(
        reloc.flags(),
        RelocationFlags::Elf { r_type } if r_type == R_X86_64_GOTPCRELX || r_type == R_X86_64_REX_GOTPCRELX
    )
}

/// Computes the value a relocation stores, or `None` for unsupported kinds.
fn relocation_value(kind: RelocationKind, gotpcrelx: bool, site: &RelocationSite) -> Option<u64> {
    let s = site.symbol as i64;
    let p = site.place as i64;
    let a = site.addend;
    match kind {
        // R_X86_64_64 / R_X86_64_32: S + A
        RelocationKind::Absolute => Some(s.wrapping_add(a) as u64),
        // PC32 / PLT32 / GOTPCREL: S + A - P
        RelocationKind::Relative | RelocationKind::PltRelative | RelocationKind::GotRelative => {
            Some(s.wrapping_add(a).wrapping_sub(p) as u64)
        }
        _ if gotpcrelx => Some(s.wrapping_add(a).wrapping_sub(p) as u64),
        _ => None,
    }
}

/// Whether a 32-bit field holds a sign-extended value. Only `R_X86_64_32`
/// is zero-extended.
fn is_signed_field(reloc: &Relocation) -> bool {
    reloc.kind() != RelocationKind::Absolute || reloc.encoding() == RelocationEncoding::X86Signed
}

/// Stores the low `bits` of `value` at `offset`.
fn store(data: &mut [u8], offset: usize, bits: u8, signed: bool, value: u64, site: &RelocationSite) -> Result<()> {
    let bytes = match bits {
        32 => {
            let fits = if signed {
                i32::try_from(value as i64).is_ok()
            } else {
                u32::try_from(value).is_ok()
            };
            if !fits {
                bail!(
                    "relocation overflow at VA 0x{:x}: value 0x{:x} does not fit in {} 32 bits (S=0x{:x})",
                    site.place,
                    value,
                    if signed { "signed" } else { "unsigned" },
                    site.symbol
                );
            }
            (value as u32).to_le_bytes().to_vec()
        }
        64 => value.to_le_bytes().to_vec(),
        other => bail!("unsupported relocation size: {other}"),
    };
    let slot = data
        .get_mut(offset..offset + bytes.len())
        .ok_or_else(|| anyhow!("relocation offset out of bounds at 0x{:x}", offset))?;
    slot.copy_from_slice(&bytes);
    Ok(())
}

pub struct X86_64;

impl Architecture for X86_64 {
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn apply_relocation(&self, reloc: &Relocation, mut site: RelocationSite, data: &mut [u8]) -> Result<()> {
        let offset = site.offset as usize;
        let gotpcrelx = is_gotpcrelx(reloc);
        // GOTPCRELX reports size 0 through the generic interface.
        let bits = if reloc.size() == 0 && gotpcrelx { 32 } else { reloc.size() };

        if reloc.has_implicit_addend() && bits == 32 {
            if let Some(raw) = data.get(offset..offset + 4) {
                site.addend = i64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
            }
        }

        let Some(value) = relocation_value(reloc.kind(), gotpcrelx, &site) else {
            tracing::trace!("Unsupported relocation kind: {:?}", reloc.kind());
            return Ok(());
        };
        store(data, offset, bits, is_signed_field(reloc), value, &site)
    }
}
