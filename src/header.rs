//! The PE header: signature, COFF header and optional header as one unit.

use crate::coff::{verify_pe_signature, CoffHeader, PE_SIGNATURE, PE_SIGNATURE_SIZE};
use crate::codec;
use crate::data_dir::DataDirectory;
use crate::optional::OptionalHeader;
use crate::reader::checked_end;
use crate::Result;

/// COFF and optional header of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub coff: CoffHeader,
    pub optional: OptionalHeader,
}

impl Header {
    /// Parse the signature, COFF header and optional header starting at `offset`.
    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self> {
        verify_pe_signature(data, offset)?;
        let coff = CoffHeader::parse(data, offset + PE_SIGNATURE_SIZE)?;
        let optional = OptionalHeader::parse(data, offset + PE_SIGNATURE_SIZE + CoffHeader::SIZE)?;

        log::debug!(
            "PE header at {:#x}: machine {:#06x}, {} sections, magic {:#x}, {} directories",
            offset,
            coff.machine,
            coff.number_of_sections,
            optional.magic(),
            optional.number_of_rva_and_sizes()
        );

        Ok(Self { coff, optional })
    }

    /// Bytes from the signature through the end of the directory array.
    pub fn size(&self) -> usize {
        PE_SIGNATURE_SIZE + CoffHeader::SIZE + self.optional.size()
    }

    /// Offset of the optional header relative to the signature.
    pub const fn optional_header_offset() -> usize {
        PE_SIGNATURE_SIZE + CoffHeader::SIZE
    }

    /// Write the header at `offset`.
    ///
    /// With no buffer this only reports the number of bytes it would write.
    pub fn write(&self, buf: Option<&mut [u8]>, offset: usize) -> Result<usize> {
        let size = self.size();
        let Some(buf) = buf else {
            return Ok(size);
        };
        checked_end(offset, size, buf.len())?;

        codec::write_u32(buf, offset, PE_SIGNATURE);
        self.coff.write(buf, offset + PE_SIGNATURE_SIZE)?;
        self.optional
            .write(buf, offset + Self::optional_header_offset())?;
        Ok(size)
    }

    pub fn data_directories(&self) -> &[DataDirectory] {
        self.optional.data_directories()
    }

    pub fn is_pe32(&self) -> bool {
        self.optional.is_pe32()
    }

    /// Field-by-field equality.
    pub fn compare(&self, other: &Header) -> bool {
        self == other
    }

    /// Equality ignoring the fields recalculation derives from the sections.
    pub fn compare_non_volatile(&self, other: &Header) -> bool {
        self.without_volatile() == other.without_volatile()
    }

    fn without_volatile(&self) -> Header {
        let mut header = self.clone();
        let opt = &mut header.optional;
        opt.set_base_of_code(0);
        opt.set_base_of_data(0);
        opt.set_size_of_code(0);
        opt.set_size_of_initialized_data(0);
        opt.set_size_of_uninitialized_data(0);
        opt.set_size_of_image(0);
        opt.set_size_of_headers(0);
        opt.set_check_sum(0);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coff::MachineType;
    use crate::optional::{OptionalHeader32, OptionalHeader64};
    use crate::Error;

    fn pe32_header() -> Header {
        Header {
            coff: CoffHeader {
                machine: MachineType::I386 as u16,
                number_of_sections: 1,
                size_of_optional_header: 224,
                ..Default::default()
            },
            optional: OptionalHeader::Pe32(OptionalHeader32 {
                image_base: 0x400000,
                section_alignment: 0x1000,
                file_alignment: 0x200,
                data_directories: vec![DataDirectory::default(); 16],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = pe32_header();
        assert_eq!(header.size(), 4 + 20 + 224);
        assert_eq!(header.write(None, 0x40).unwrap(), 248);

        let mut buf = vec![0u8; 0x40 + 248];
        header.write(Some(&mut buf), 0x40).unwrap();
        assert_eq!(&buf[0x40..0x44], b"PE\0\0");

        let parsed = Header::parse_at(&buf, 0x40).unwrap();
        assert!(parsed.compare(&header));
    }

    #[test]
    fn test_header_write_too_small() {
        let header = pe32_header();
        let mut buf = vec![0u8; 100];
        assert!(matches!(
            header.write(Some(&mut buf), 0),
            Err(Error::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_header_unknown_magic() {
        let header = pe32_header();
        let mut buf = vec![0u8; 248];
        header.write(Some(&mut buf), 0).unwrap();
        buf[24..26].copy_from_slice(&[0xFF, 0xFF]);

        assert!(matches!(
            Header::parse_at(&buf, 0),
            Err(Error::UnknownMagic(0xFFFF))
        ));
    }

    #[test]
    fn test_compare_non_volatile() {
        let header = pe32_header();
        let mut other = header.clone();
        other.optional.set_size_of_image(0x5000);
        other.optional.set_size_of_code(0x200);
        other.optional.set_check_sum(0xDEAD);
        other.optional.set_base_of_data(0x2000);

        assert!(!header.compare(&other));
        assert!(header.compare_non_volatile(&other));

        other.optional.set_address_of_entry_point(0x1010);
        assert!(!header.compare_non_volatile(&other));
    }

    #[test]
    fn test_compare_across_variants() {
        let header = pe32_header();
        let mut other = header.clone();
        other.optional = OptionalHeader::Pe32Plus(OptionalHeader64 {
            image_base: 0x400000,
            section_alignment: 0x1000,
            file_alignment: 0x200,
            data_directories: vec![DataDirectory::default(); 16],
            ..Default::default()
        });
        assert!(!header.compare_non_volatile(&other));
    }
}
