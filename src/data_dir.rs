//! Data directories: raw (RVA, size) pairs and their resolved locations.

use crate::codec;
use crate::reader::{checked_end, Reader};
use crate::section::SectionHeader;
use crate::Result;

/// Data directory type - type-safe enum for data directory indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum DataDirectoryType {
    /// Export table (.edata)
    Export = 0,
    /// Import table (.idata)
    Import = 1,
    /// Resource table (.rsrc)
    Resource = 2,
    /// Exception table (.pdata)
    Exception = 3,
    /// Certificate table (file offset, not RVA)
    Certificate = 4,
    /// Base relocation table (.reloc)
    BaseReloc = 5,
    /// Debug directory
    Debug = 6,
    /// Architecture-specific data
    Architecture = 7,
    /// Global pointer register value
    GlobalPtr = 8,
    /// Thread local storage (.tls)
    Tls = 9,
    /// Load configuration
    LoadConfig = 10,
    /// Bound import table
    BoundImport = 11,
    /// Import address table
    Iat = 12,
    /// Delay import descriptor
    DelayImport = 13,
    /// CLR runtime header
    ClrRuntime = 14,
    /// Reserved
    Reserved = 15,
}

impl DataDirectoryType {
    /// Get the index value.
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// Try to create from an index.
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Export),
            1 => Some(Self::Import),
            2 => Some(Self::Resource),
            3 => Some(Self::Exception),
            4 => Some(Self::Certificate),
            5 => Some(Self::BaseReloc),
            6 => Some(Self::Debug),
            7 => Some(Self::Architecture),
            8 => Some(Self::GlobalPtr),
            9 => Some(Self::Tls),
            10 => Some(Self::LoadConfig),
            11 => Some(Self::BoundImport),
            12 => Some(Self::Iat),
            13 => Some(Self::DelayImport),
            14 => Some(Self::ClrRuntime),
            15 => Some(Self::Reserved),
            _ => None,
        }
    }

    /// Get the name of this directory type.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Export => "Export",
            Self::Import => "Import",
            Self::Resource => "Resource",
            Self::Exception => "Exception",
            Self::Certificate => "Certificate",
            Self::BaseReloc => "BaseReloc",
            Self::Debug => "Debug",
            Self::Architecture => "Architecture",
            Self::GlobalPtr => "GlobalPtr",
            Self::Tls => "TLS",
            Self::LoadConfig => "LoadConfig",
            Self::BoundImport => "BoundImport",
            Self::Iat => "IAT",
            Self::DelayImport => "DelayImport",
            Self::ClrRuntime => "CLR",
            Self::Reserved => "Reserved",
        }
    }

    /// Iterate over all directory types.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..NUMBER_OF_DIRECTORY_ENTRIES).filter_map(Self::from_index)
    }
}

/// Number of standard data directory slots.
pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = 16;

/// Data Directory entry (IMAGE_DATA_DIRECTORY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDirectory {
    /// RVA of the table (a file offset for the certificate table).
    pub virtual_address: u32,
    /// Size of the table in bytes.
    pub size: u32,
}

impl DataDirectory {
    /// Size of a data directory entry in bytes.
    pub const SIZE: usize = 8;

    pub fn new(virtual_address: u32, size: u32) -> Self {
        Self {
            virtual_address,
            size,
        }
    }

    /// Parse a data directory at `offset`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::SIZE)?;
        Ok(Self {
            virtual_address: codec::read_u32(d, 0),
            size: codec::read_u32(d, 4),
        })
    }

    /// Write the data directory at `offset`.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        checked_end(offset, Self::SIZE, buf.len())?;
        codec::write_u32(buf, offset, self.virtual_address);
        codec::write_u32(buf, offset + 4, self.size);
        Ok(())
    }

    /// Check if this directory entry is present (non-zero).
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 || self.size != 0
    }
}

/// Where a directory's table lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryLocation {
    /// Zero address and size.
    Empty,
    /// Inside section `index`, `offset` bytes from its start.
    Section { index: usize, offset: u32 },
    /// The certificate table: stored by file offset after the section data.
    FileOffset(u32),
    /// Present but not inside any section (e.g. a bound import table in
    /// the header area). Written back unchanged.
    Detached,
}

/// A data directory slot with its resolved location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// The (RVA, size) pair as last written to or read from the header.
    pub raw: DataDirectory,
    pub location: DirectoryLocation,
}

impl DirectoryEntry {
    pub fn size(&self) -> u32 {
        self.raw.size
    }

    /// Section index this directory resolves to, if any.
    pub fn section_index(&self) -> Option<usize> {
        match self.location {
            DirectoryLocation::Section { index, .. } => Some(index),
            _ => None,
        }
    }
}

/// First section whose range `[virtual_address, virtual_address + size_of_raw_data]`
/// contains `rva`, with the offset of `rva` inside it.
///
/// Overlapping sections are not arbitrated: the earliest in table order wins.
pub fn find_containing_section(sections: &[SectionHeader], rva: u32) -> Option<(usize, u32)> {
    sections.iter().enumerate().find_map(|(index, header)| {
        let start = header.virtual_address as u64;
        let end = start + header.size_of_raw_data as u64;
        let rva = rva as u64;
        (start <= rva && rva <= end).then(|| (index, (rva - start) as u32))
    })
}

/// Resolve every directory slot against the section table.
pub fn resolve_directories(
    directories: &[DataDirectory],
    sections: &[SectionHeader],
) -> Vec<DirectoryEntry> {
    directories
        .iter()
        .enumerate()
        .map(|(slot, &raw)| {
            let location = if !raw.is_present() {
                DirectoryLocation::Empty
            } else if slot == DataDirectoryType::Certificate.as_index() {
                DirectoryLocation::FileOffset(raw.virtual_address)
            } else {
                match find_containing_section(sections, raw.virtual_address) {
                    Some((index, offset)) => DirectoryLocation::Section { index, offset },
                    None => DirectoryLocation::Detached,
                }
            };

            if let Some(kind) = DataDirectoryType::from_index(slot) {
                log::trace!("directory {} -> {:?}", kind.name(), location);
            }
            DirectoryEntry { raw, location }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(va: u32, raw: u32) -> SectionHeader {
        SectionHeader {
            virtual_address: va,
            virtual_size: raw,
            size_of_raw_data: raw,
            ..Default::default()
        }
    }

    #[test]
    fn test_data_directory_size() {
        assert_eq!(DataDirectory::SIZE, 8);
    }

    #[test]
    fn test_data_directory_roundtrip() {
        let dir = DataDirectory::new(0x1000, 0x200);

        let mut buf = [0u8; 12];
        dir.write(&mut buf, 4).unwrap();

        let parsed = DataDirectory::parse(&buf, 4).unwrap();
        assert_eq!(dir, parsed);
        assert!(parsed.is_present());
        assert!(DataDirectory::parse(&buf, 5).is_err());
    }

    #[test]
    fn test_data_directory_not_present() {
        let dir = DataDirectory::default();
        assert!(!dir.is_present());
    }

    #[test]
    fn test_data_directory_type_roundtrip() {
        for dir_type in DataDirectoryType::all() {
            let index = dir_type.as_index();
            let recovered = DataDirectoryType::from_index(index).unwrap();
            assert_eq!(dir_type, recovered);
            assert!(!dir_type.name().is_empty());
        }
        assert_eq!(DataDirectoryType::all().count(), 16);
    }

    #[test]
    fn test_data_directory_type_values() {
        assert_eq!(DataDirectoryType::Export.as_index(), 0);
        assert_eq!(DataDirectoryType::Import.as_index(), 1);
        assert_eq!(DataDirectoryType::Resource.as_index(), 2);
        assert_eq!(DataDirectoryType::Certificate.as_index(), 4);
        assert_eq!(DataDirectoryType::Tls.as_index(), 9);
    }

    #[test]
    fn test_first_containing_section_wins() {
        // Second section overlaps the first; the first in table order wins.
        let sections = vec![section(0x1000, 0x1000), section(0x1800, 0x1000)];
        assert_eq!(
            find_containing_section(&sections, 0x1900),
            Some((0, 0x900))
        );
        assert_eq!(
            find_containing_section(&sections, 0x2100),
            Some((1, 0x900))
        );
        assert_eq!(find_containing_section(&sections, 0x500), None);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let sections = vec![section(0x1000, 0x200), section(0x2000, 0x400)];
        let dirs = vec![
            DataDirectory::default(),
            DataDirectory::new(0x2010, 0x28),
            DataDirectory::new(0x2100, 0x40),
            DataDirectory::default(),
            DataDirectory::new(0x1000, 0x10),
            DataDirectory::new(0x300, 0x20),
        ];

        let first = resolve_directories(&dirs, &sections);
        let second = resolve_directories(&dirs, &sections);
        assert_eq!(first, second);

        assert_eq!(first[0].location, DirectoryLocation::Empty);
        assert_eq!(
            first[1].location,
            DirectoryLocation::Section {
                index: 1,
                offset: 0x10
            }
        );
        // Certificate slot is never matched against sections.
        assert_eq!(first[4].location, DirectoryLocation::FileOffset(0x1000));
        assert_eq!(first[5].location, DirectoryLocation::Detached);
        assert_eq!(first[2].section_index(), Some(1));
    }
}
