//! Section headers and owned section contents.

use crate::codec;
use crate::error::{try_alloc, try_copy};
use crate::reader::{checked_end, Reader};
use crate::{Error, Result};

/// Section characteristics flags.
pub mod characteristics {
    /// Section contains executable code.
    pub const CODE: u32 = 0x00000020;
    /// Section contains initialized data.
    pub const INITIALIZED_DATA: u32 = 0x00000040;
    /// Section contains uninitialized data.
    pub const UNINITIALIZED_DATA: u32 = 0x00000080;
    /// Section cannot be cached.
    pub const NO_CACHE: u32 = 0x04000000;
    /// Section is not pageable.
    pub const NO_PAGE: u32 = 0x08000000;
    /// Section is shared.
    pub const SHARED: u32 = 0x10000000;
    /// Section is executable.
    pub const EXECUTE: u32 = 0x20000000;
    /// Section is readable.
    pub const READ: u32 = 0x40000000;
    /// Section is writable.
    pub const WRITE: u32 = 0x80000000;
}

/// Section Header (IMAGE_SECTION_HEADER).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SectionHeader {
    /// Section name (8 bytes, not necessarily NUL-terminated).
    pub name: [u8; 8],
    /// Virtual size of the section.
    pub virtual_size: u32,
    /// RVA of the section.
    pub virtual_address: u32,
    /// Size of raw data on disk.
    pub size_of_raw_data: u32,
    /// File offset to raw data.
    pub pointer_to_raw_data: u32,
    /// File offset to relocations.
    pub pointer_to_relocations: u32,
    /// File offset to line numbers.
    pub pointer_to_linenumbers: u32,
    /// Number of relocations.
    pub number_of_relocations: u16,
    /// Number of line numbers.
    pub number_of_linenumbers: u16,
    /// Section characteristics.
    pub characteristics: u32,
}

impl SectionHeader {
    /// Size of a section header in bytes.
    pub const SIZE: usize = 40;

    /// Parse a section header at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::SIZE)?;

        let mut name = [0u8; 8];
        name.copy_from_slice(&d[0..8]);

        Ok(Self {
            name,
            virtual_size: codec::read_u32(d, 8),
            virtual_address: codec::read_u32(d, 12),
            size_of_raw_data: codec::read_u32(d, 16),
            pointer_to_raw_data: codec::read_u32(d, 20),
            pointer_to_relocations: codec::read_u32(d, 24),
            pointer_to_linenumbers: codec::read_u32(d, 28),
            number_of_relocations: codec::read_u16(d, 32),
            number_of_linenumbers: codec::read_u16(d, 34),
            characteristics: codec::read_u32(d, 36),
        })
    }

    /// Write the section header at `offset`.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        checked_end(offset, Self::SIZE, buf.len())?;
        let b = &mut buf[offset..];

        b[0..8].copy_from_slice(&self.name);
        codec::write_u32(b, 8, self.virtual_size);
        codec::write_u32(b, 12, self.virtual_address);
        codec::write_u32(b, 16, self.size_of_raw_data);
        codec::write_u32(b, 20, self.pointer_to_raw_data);
        codec::write_u32(b, 24, self.pointer_to_relocations);
        codec::write_u32(b, 28, self.pointer_to_linenumbers);
        codec::write_u16(b, 32, self.number_of_relocations);
        codec::write_u16(b, 34, self.number_of_linenumbers);
        codec::write_u32(b, 36, self.characteristics);

        Ok(())
    }

    /// Section name with trailing NUL padding removed.
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Set the name, NUL-padding to 8 bytes.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() > 8 {
            return Err(Error::out_of_range(format!(
                "section name '{name}' longer than 8 bytes"
            )));
        }
        self.name = [0; 8];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn is_code(&self) -> bool {
        self.characteristics & characteristics::CODE != 0
    }

    /// Check if the section is executable.
    pub fn is_executable(&self) -> bool {
        self.characteristics & characteristics::EXECUTE != 0
    }

    /// Check if the section is readable.
    pub fn is_readable(&self) -> bool {
        self.characteristics & characteristics::READ != 0
    }

    /// Check if the section is writable.
    pub fn is_writable(&self) -> bool {
        self.characteristics & characteristics::WRITE != 0
    }

    /// File offset one past the section's raw data.
    pub fn raw_end(&self) -> u64 {
        self.pointer_to_raw_data as u64 + self.size_of_raw_data as u64
    }
}

/// A section header together with its owned contents.
///
/// Contents start as `min(virtual_size, size_of_raw_data)` bytes read from
/// the file and are tracked independently after edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub header: SectionHeader,
    contents: Vec<u8>,
    modified: bool,
}

impl Section {
    /// Create a section holding `contents`.
    pub fn new(name: &str, characteristics: u32, contents: Vec<u8>) -> Result<Self> {
        let size = u32::try_from(contents.len())
            .map_err(|_| Error::out_of_range("section contents larger than 4 GiB"))?;
        let mut header = SectionHeader {
            virtual_size: size,
            size_of_raw_data: size,
            characteristics,
            ..Default::default()
        };
        header.set_name(name)?;

        Ok(Self {
            header,
            contents,
            modified: true,
        })
    }

    /// Parse section `index` whose header sits at `offset` in `data`.
    pub fn parse(data: &[u8], offset: usize, index: usize) -> Result<Self> {
        let header = SectionHeader::parse(data, offset)?;
        let len = header.virtual_size.min(header.size_of_raw_data) as usize;

        let contents = if len == 0 {
            Vec::new()
        } else {
            let start = header.pointer_to_raw_data as usize;
            let end = start as u64 + len as u64;
            if end > data.len() as u64 {
                return Err(Error::SectionOutOfBounds {
                    index,
                    start: start as u64,
                    end,
                    file_size: data.len(),
                });
            }
            try_copy(&data[start..start + len])?
        };

        log::trace!(
            "section {} '{}': va {:#x} vs {:#x} raw {:#x}@{:#x}",
            index,
            header.name_str(),
            header.virtual_address,
            header.virtual_size,
            header.size_of_raw_data,
            header.pointer_to_raw_data
        );

        Ok(Self {
            header,
            contents,
            modified: false,
        })
    }

    pub fn name(&self) -> String {
        self.header.name_str()
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Mutable view of the contents. The length cannot change through it.
    pub fn contents_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        &mut self.contents
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn set_modified(&mut self) {
        self.modified = true;
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified = false;
    }

    /// Remove `start..end` from the contents, shrinking the section sizes.
    pub fn excise(&mut self, start: usize, end: usize) -> Result<()> {
        if end > self.contents.len() {
            return Err(Error::out_of_range(format!(
                "cannot excise past section end ({end} > {})",
                self.contents.len()
            )));
        }
        if start >= end {
            return Ok(());
        }

        let removed = (end - start) as u32;
        self.contents.drain(start..end);
        self.contents.shrink_to_fit();
        self.header.virtual_size = self.header.virtual_size.saturating_sub(removed);
        self.header.size_of_raw_data = self.header.size_of_raw_data.saturating_sub(removed);
        self.modified = true;
        Ok(())
    }

    /// Insert `size` zero bytes at `offset`, growing the section sizes.
    pub fn insert_capacity(&mut self, size: usize, offset: usize) -> Result<()> {
        if offset > self.contents.len() {
            return Err(Error::out_of_range(format!(
                "cannot insert at {offset}, contents are {} bytes",
                self.contents.len()
            )));
        }
        let grow = u32::try_from(size)
            .map_err(|_| Error::out_of_range("section size out of range"))?;
        let virtual_size = self
            .header
            .virtual_size
            .checked_add(grow)
            .ok_or_else(|| Error::out_of_range("section size out of range"))?;
        let raw_size = self
            .header
            .size_of_raw_data
            .checked_add(grow)
            .ok_or_else(|| Error::out_of_range("section size out of range"))?;

        let gap = try_alloc(size)?;
        self.contents
            .try_reserve_exact(size)
            .map_err(|_| Error::AllocationFailure(size))?;
        self.contents.splice(offset..offset, gap);

        self.header.virtual_size = virtual_size;
        self.header.size_of_raw_data = raw_size;
        self.modified = true;
        Ok(())
    }

    /// Grow (zero-filled at the end) or shrink the contents to `size` bytes.
    pub fn resize(&mut self, size: usize) -> Result<()> {
        let len = self.contents.len();
        if size < len {
            self.excise(size, len)
        } else if size > len {
            self.insert_capacity(size - len, len)
        } else {
            Ok(())
        }
    }

    /// Replace the contents wholesale, setting both sizes to the new length.
    pub fn set_contents(&mut self, contents: Vec<u8>) -> Result<()> {
        let size = u32::try_from(contents.len())
            .map_err(|_| Error::out_of_range("section contents larger than 4 GiB"))?;
        self.contents = contents;
        self.header.virtual_size = size;
        self.header.size_of_raw_data = size;
        self.modified = true;
        Ok(())
    }

    /// Write this section's raw data to `buf` at `pointer_to_raw_data`,
    /// zero-filling up to `size_of_raw_data`.
    pub fn write_data(&self, buf: &mut [u8]) -> Result<()> {
        let raw = self.header.size_of_raw_data as usize;
        if raw == 0 {
            return Ok(());
        }
        let start = self.header.pointer_to_raw_data as usize;
        let end = checked_end(start, raw, buf.len())?;
        let copied = self.contents.len().min(raw);

        buf[start..start + copied].copy_from_slice(&self.contents[..copied]);
        buf[start + copied..end].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_section() -> Section {
        let mut section = Section::new(
            ".text",
            characteristics::CODE | characteristics::EXECUTE | characteristics::READ,
            (0u8..16).collect(),
        )
        .unwrap();
        section.clear_modified();
        section
    }

    #[test]
    fn test_section_header_size() {
        assert_eq!(SectionHeader::SIZE, 40);
    }

    #[test]
    fn test_section_header_name() {
        let mut header = SectionHeader::default();
        header.name[..6].copy_from_slice(b".text\0");
        assert_eq!(header.name_str(), ".text");

        header.name = *b"LONGNAME";
        assert_eq!(header.name_str(), "LONGNAME");

        assert!(header.set_name("toolongname").is_err());
        assert_eq!(header.name_str(), "LONGNAME");
    }

    #[test]
    fn test_section_header_roundtrip() {
        let mut header = SectionHeader {
            virtual_size: 0x1000,
            virtual_address: 0x1000,
            size_of_raw_data: 0x800,
            pointer_to_raw_data: 0x400,
            characteristics: characteristics::CODE | characteristics::EXECUTE | characteristics::READ,
            ..Default::default()
        };
        header.set_name(".text").unwrap();

        let mut buf = [0u8; 40];
        header.write(&mut buf, 0).unwrap();

        let parsed = SectionHeader::parse(&buf, 0).unwrap();
        assert_eq!(header, parsed);
        assert!(parsed.is_executable());
        assert!(parsed.is_readable());
        assert!(!parsed.is_writable());
    }

    #[test]
    fn test_section_contents_min_of_sizes() {
        let mut file = vec![0u8; 0x300];
        let header = SectionHeader {
            virtual_size: 0x10,
            size_of_raw_data: 0x200,
            pointer_to_raw_data: 0x100,
            ..Default::default()
        };
        header.write(&mut file, 0).unwrap();
        file[0x100..0x110].fill(0xAA);

        let section = Section::parse(&file, 0, 0).unwrap();
        assert_eq!(section.contents().len(), 0x10);
        assert!(section.contents().iter().all(|&b| b == 0xAA));
        assert!(!section.is_modified());
    }

    #[test]
    fn test_section_out_of_bounds() {
        let mut file = vec![0u8; 0x100];
        let header = SectionHeader {
            virtual_size: 0x200,
            size_of_raw_data: 0x200,
            pointer_to_raw_data: 0x80,
            ..Default::default()
        };
        header.write(&mut file, 0).unwrap();

        assert!(matches!(
            Section::parse(&file, 0, 3),
            Err(Error::SectionOutOfBounds { index: 3, .. })
        ));
    }

    #[test]
    fn test_excise() {
        let mut section = text_section();
        section.excise(4, 8).unwrap();

        assert_eq!(section.contents().len(), 12);
        assert_eq!(&section.contents()[..6], &[0, 1, 2, 3, 8, 9]);
        assert_eq!(section.header.virtual_size, 12);
        assert_eq!(section.header.size_of_raw_data, 12);
        assert!(section.is_modified());
    }

    #[test]
    fn test_excise_past_end() {
        let mut section = text_section();
        assert!(matches!(section.excise(4, 17), Err(Error::OutOfRange(_))));
        assert_eq!(section.contents().len(), 16);
        assert!(!section.is_modified());

        // Empty range is a no-op.
        section.excise(5, 5).unwrap();
        assert!(!section.is_modified());
    }

    #[test]
    fn test_insert_capacity() {
        let mut section = text_section();
        section.insert_capacity(4, 2).unwrap();

        assert_eq!(section.contents().len(), 20);
        assert_eq!(&section.contents()[..8], &[0, 1, 0, 0, 0, 0, 2, 3]);
        assert_eq!(section.header.virtual_size, 20);

        assert!(section.insert_capacity(1, 21).is_err());
    }

    #[test]
    fn test_resize() {
        let mut section = text_section();
        section.resize(32).unwrap();
        assert_eq!(section.contents().len(), 32);
        assert_eq!(section.contents()[15], 15);
        assert_eq!(section.contents()[31], 0);

        section.resize(8).unwrap();
        assert_eq!(section.contents(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(section.header.virtual_size, 8);
    }

    #[test]
    fn test_write_data_pads_raw() {
        let mut section = text_section();
        section.header.pointer_to_raw_data = 4;
        section.header.size_of_raw_data = 32;

        let mut buf = vec![0xFFu8; 40];
        section.write_data(&mut buf).unwrap();
        assert_eq!(&buf[4..20], &(0u8..16).collect::<Vec<_>>()[..]);
        assert!(buf[20..36].iter().all(|&b| b == 0));
        assert_eq!(buf[36], 0xFF);
    }
}
