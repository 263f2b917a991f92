//! GBA ROM pointer validation.
//!
//! A ROM pointer is a little-endian word whose high byte names a bus bank
//! and whose low 24 bits are the offset into the cartridge image:
//!
//! ```text
//! 0x08_xxxxxx  ROM, wait state 0
//! 0x09_xxxxxx  ROM, upper mirror
//! ```
//!
//! [`validate`] is the cheapest check the decoder can make, so scanning
//! evaluates it before anything recursive.

use std::collections::BTreeSet;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

pub const ROM_BANK_0:   u8  = 0x08;
pub const ROM_BANK_1:   u8  = 0x09;
pub const OFFSET_MASK:  u32 = 0x00FF_FFFF;
/// Raw value of an absent nullable pointer.
pub const NULL_POINTER: u32 = 0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerError {
    #[error("bank 0x{bank:02x} is not a ROM bank")]
    BadBank { bank: u8 },
    #[error("offset 0x{offset:06x} is outside the {len}-byte image")]
    OutOfRange { offset: usize, len: usize },
}

/// Resolve a raw pointer word to an offset inside a buffer of `buffer_len` bytes.
#[inline]
pub fn validate(raw: u32, buffer_len: usize) -> Result<usize, PointerError> {
    let bank = (raw >> 24) as u8;
    if bank != ROM_BANK_0 && bank != ROM_BANK_1 {
        return Err(PointerError::BadBank { bank });
    }
    let offset = (raw & OFFSET_MASK) as usize;
    if offset >= buffer_len {
        return Err(PointerError::OutOfRange { offset, len: buffer_len });
    }
    Ok(offset)
}

#[inline]
pub fn is_pointer(raw: u32, buffer_len: usize) -> bool {
    validate(raw, buffer_len).is_ok()
}

/// Encode `offset` as a bank-0 ROM pointer.
pub fn to_rom_pointer(offset: usize) -> u32 {
    ((ROM_BANK_0 as u32) << 24) | (offset as u32 & OFFSET_MASK)
}

/// Every offset referenced by a valid pointer stored at a multiple of `alignment`.
pub fn pointer_targets(buffer: &[u8], alignment: usize) -> BTreeSet<usize> {
    let step = alignment.max(1);
    let len = buffer.len();
    (0..len.saturating_sub(3))
        .step_by(step)
        .filter_map(|at| validate(LittleEndian::read_u32(&buffer[at..at + 4]), len).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_rom_banks() {
        assert_eq!(validate(0x0800_0010, 0x100), Ok(0x10));
        assert_eq!(validate(0x0900_0010, 0x100), Ok(0x10));
    }

    #[test]
    fn rejects_other_banks() {
        assert_eq!(validate(0x0200_0010, 0x100), Err(PointerError::BadBank { bank: 0x02 }));
        assert_eq!(validate(0x0A00_0010, 0x100), Err(PointerError::BadBank { bank: 0x0A }));
        assert_eq!(validate(NULL_POINTER, 0x100), Err(PointerError::BadBank { bank: 0 }));
    }

    #[test]
    fn rejects_offsets_at_or_past_end() {
        assert_eq!(validate(0x0800_00FF, 0x100), Ok(0xFF));
        assert_eq!(
            validate(0x0800_0100, 0x100),
            Err(PointerError::OutOfRange { offset: 0x100, len: 0x100 })
        );
        assert!(!is_pointer(0x0800_0000, 0));
    }

    #[test]
    fn encodes_bank_zero() {
        assert_eq!(to_rom_pointer(0x1234), 0x0800_1234);
        assert_eq!(validate(to_rom_pointer(0x40), 0x80), Ok(0x40));
    }

    #[test]
    fn collects_aligned_targets() {
        let mut rom = vec![0u8; 0x40];
        rom[0x00..0x04].copy_from_slice(&to_rom_pointer(0x20).to_le_bytes());
        rom[0x08..0x0C].copy_from_slice(&0x0900_0030u32.to_le_bytes());
        // Unaligned copy is skipped at 4-byte alignment.
        rom[0x11..0x15].copy_from_slice(&to_rom_pointer(0x10).to_le_bytes());
        rom[0x3C..0x40].copy_from_slice(&to_rom_pointer(0x3C).to_le_bytes());

        let targets: Vec<usize> = pointer_targets(&rom, 4).into_iter().collect();
        assert_eq!(targets, vec![0x20, 0x30, 0x3C]);

        let all: Vec<usize> = pointer_targets(&rom, 1).into_iter().collect();
        assert!(all.contains(&0x10));
    }

    #[test]
    fn tiny_buffers_have_no_targets() {
        assert!(pointer_targets(&[0x08, 0x00, 0x00], 1).is_empty());
        assert!(pointer_targets(&[], 4).is_empty());
    }
}
