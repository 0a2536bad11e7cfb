//! PE image checksum.
//!
//! The loader only verifies this for drivers and some system files, so
//! recalculation leaves it alone; [`crate::PeImage::update_checksum`]
//! stores it on request.

use crate::coff::{CoffHeader, PE_SIGNATURE_SIZE};
use crate::dos::MzHeader;
use crate::reader::{checked_end, Reader};
use crate::Result;

/// Offset of `check_sum` inside the optional header (same for PE32 and PE32+).
pub const CHECKSUM_FIELD_OFFSET: usize = 64;

/// Calculate the PE checksum for a file.
///
/// The algorithm:
/// 1. Sum all 16-bit words, using 32-bit arithmetic with carry-add
/// 2. Skip the checksum field itself (at offset checksum_offset)
/// 3. Fold the result to 16 bits
/// 4. Add the file size
pub fn calculate_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    let len = data.len();

    let mut i = 0;
    while i + 1 < len {
        if i >= checksum_offset && i < checksum_offset + 4 {
            i += 2;
            continue;
        }

        sum += u16::from_le_bytes([data[i], data[i + 1]]) as u64;
        i += 2;
    }

    // Odd trailing byte
    if i < len {
        sum += data[i] as u64;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    (sum as u32).wrapping_add(len as u32)
}

/// File offset of the checksum field, found through `e_lfanew`.
pub fn checksum_field_offset(data: &[u8]) -> Result<usize> {
    let pe_offset = data.read_u32_at(MzHeader::LFANEW_OFFSET)? as usize;
    let offset = pe_offset
        .saturating_add(PE_SIGNATURE_SIZE + CoffHeader::SIZE + CHECKSUM_FIELD_OFFSET);
    checked_end(offset, 4, data.len())?;
    Ok(offset)
}

/// Compute the checksum of a serialized image.
pub fn compute(data: &[u8]) -> Result<u32> {
    let offset = checksum_field_offset(data)?;
    Ok(calculate_checksum(data, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_checksum_field_offset() {
        let mut data = vec![0u8; 256];
        data[0] = b'M';
        data[1] = b'Z';
        data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        data[0x80..0x84].copy_from_slice(b"PE\0\0");

        assert_eq!(checksum_field_offset(&data).unwrap(), 0x80 + 4 + 20 + 64);
    }

    #[test]
    fn test_checksum_field_out_of_bounds() {
        let mut data = vec![0u8; 0x90];
        data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        assert!(matches!(
            compute(&data),
            Err(Error::TruncatedInput { .. })
        ));
        assert!(compute(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_calculate_checksum() {
        let data = vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        // Sum of words: 0x0201 + 0x0403 + 0x0605 + 0x0807 = 0x1410, plus size 8
        assert_eq!(calculate_checksum(&data, 1000), 0x1418);
    }

    #[test]
    fn test_checksum_skips_field_and_folds() {
        let mut data = vec![0xFFu8; 16];
        let base = calculate_checksum(&data, 4);
        data[4..8].copy_from_slice(&[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(calculate_checksum(&data, 4), base);

        // Six 0xFFFF words fold to 0xFFFF + 5 carries.
        assert_eq!(base, 0x0005 + 0xFFFA + 16);
    }
}
