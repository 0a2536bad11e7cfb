//! Import table parsing.
//!
//! Descriptors, DLL names, lookup tables and hint/name entries are all
//! addressed by RVA and read from the contents of whichever section holds
//! them.

use crate::codec;
use crate::data_dir::find_containing_section;
use crate::reader::{checked_end, Reader};
use crate::section::{Section, SectionHeader};
use crate::{Error, Result};

/// IMAGE_IMPORT_DESCRIPTOR - 20 bytes
/// Describes one imported DLL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportDescriptor {
    /// RVA to the Import Lookup Table (or INT - Import Name Table).
    pub original_first_thunk: u32,
    /// Timestamp (0 if not bound).
    pub time_date_stamp: u32,
    /// Forwarder chain index (-1 if no forwarders).
    pub forwarder_chain: u32,
    /// RVA to the DLL name (null-terminated string).
    pub name_rva: u32,
    /// RVA to the Import Address Table (IAT).
    pub first_thunk: u32,
}

impl ImportDescriptor {
    pub const SIZE: usize = 20;

    /// Check if this is a null terminator descriptor.
    pub fn is_null(&self) -> bool {
        self.original_first_thunk == 0
            && self.time_date_stamp == 0
            && self.forwarder_chain == 0
            && self.name_rva == 0
            && self.first_thunk == 0
    }

    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::SIZE)?;
        Ok(Self {
            original_first_thunk: codec::read_u32(d, 0),
            time_date_stamp: codec::read_u32(d, 4),
            forwarder_chain: codec::read_u32(d, 8),
            name_rva: codec::read_u32(d, 12),
            first_thunk: codec::read_u32(d, 16),
        })
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        checked_end(offset, Self::SIZE, buf.len())?;
        codec::write_u32(buf, offset, self.original_first_thunk);
        codec::write_u32(buf, offset + 4, self.time_date_stamp);
        codec::write_u32(buf, offset + 8, self.forwarder_chain);
        codec::write_u32(buf, offset + 12, self.name_rva);
        codec::write_u32(buf, offset + 16, self.first_thunk);
        Ok(())
    }

    /// RVA of the lookup table, falling back to the IAT when there is no INT.
    pub fn lookup_table_rva(&self) -> u32 {
        if self.original_first_thunk != 0 {
            self.original_first_thunk
        } else {
            self.first_thunk
        }
    }
}

/// Import thunk entry - can be either ordinal or name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportThunk {
    /// Import by ordinal number.
    Ordinal(u16),
    /// Import by name (hint, name).
    Name { hint: u16, name: String },
}

/// A single imported DLL with its imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub dll_name: String,
    pub descriptor: ImportDescriptor,
    pub imports: Vec<ImportThunk>,
}

/// The complete import table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportTable {
    pub entries: Vec<ImportEntry>,
}

/// RVA-addressed reads over section contents.
struct RvaReader<'a> {
    sections: &'a [Section],
    headers: Vec<SectionHeader>,
}

impl<'a> RvaReader<'a> {
    fn new(sections: &'a [Section]) -> Self {
        Self {
            sections,
            headers: sections.iter().map(|s| s.header.clone()).collect(),
        }
    }

    /// Contents of the section holding `rva`, and the offset of `rva` in it.
    fn locate(&self, rva: u32) -> Result<(&'a [u8], usize)> {
        let (index, offset) = find_containing_section(&self.headers, rva).ok_or_else(|| {
            Error::malformed(format!("RVA {rva:#x} is not inside any section"))
        })?;
        Ok((self.sections[index].contents(), offset as usize))
    }

    fn u16_at(&self, rva: u32) -> Result<u16> {
        let (contents, offset) = self.locate(rva)?;
        contents.read_u16_at(offset)
    }

    fn u32_at(&self, rva: u32) -> Result<u32> {
        let (contents, offset) = self.locate(rva)?;
        contents.read_u32_at(offset)
    }

    fn u64_at(&self, rva: u32) -> Result<u64> {
        let (contents, offset) = self.locate(rva)?;
        contents.read_u64_at(offset)
    }

    fn cstring_at(&self, rva: u32) -> Result<String> {
        let (contents, offset) = self.locate(rva)?;
        contents.read_cstring_at(offset)
    }

    fn descriptor_at(&self, rva: u32) -> Result<ImportDescriptor> {
        let (contents, offset) = self.locate(rva)?;
        ImportDescriptor::parse(contents, offset)
    }
}

impl ImportTable {
    /// Parse the import table at `import_rva`.
    ///
    /// Descriptors are walked until the null terminator. An entry whose
    /// name or lookup table cannot be read is dropped and the walk moves on
    /// to the next descriptor; the dropped entries' errors are returned.
    pub fn parse(sections: &[Section], import_rva: u32, pe32plus: bool) -> (Self, Vec<Error>) {
        let reader = RvaReader::new(sections);
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        let mut rva = import_rva;

        loop {
            let descriptor = match reader.descriptor_at(rva) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    log::warn!("import descriptor at RVA {rva:#x} unreadable: {err}");
                    errors.push(err);
                    break;
                }
            };
            if descriptor.is_null() {
                break;
            }

            match Self::parse_entry(&reader, descriptor, pe32plus) {
                Ok(entry) => {
                    log::debug!(
                        "import {}: {} symbols",
                        entry.dll_name,
                        entry.imports.len()
                    );
                    entries.push(entry);
                }
                Err(err) => {
                    log::warn!("dropping import descriptor at RVA {rva:#x}: {err}");
                    errors.push(err);
                }
            }

            rva = match rva.checked_add(ImportDescriptor::SIZE as u32) {
                Some(next) => next,
                None => break,
            };
        }

        (Self { entries }, errors)
    }

    fn parse_entry(reader: &RvaReader<'_>, descriptor: ImportDescriptor, pe32plus: bool) -> Result<ImportEntry> {
        let dll_name = reader.cstring_at(descriptor.name_rva)?;
        let thunk_size = if pe32plus { 8u32 } else { 4 };
        let mut imports = Vec::new();
        let mut rva = descriptor.lookup_table_rva();

        loop {
            let (ordinal, value) = if pe32plus {
                let raw = reader.u64_at(rva)?;
                (raw & (1 << 63) != 0, raw)
            } else {
                let raw = reader.u32_at(rva)?;
                (raw & (1 << 31) != 0, raw as u64)
            };
            if value == 0 {
                break;
            }

            let thunk = if ordinal {
                ImportThunk::Ordinal((value & 0xFFFF) as u16)
            } else {
                let hint_rva = (value & 0x7FFF_FFFF) as u32;
                let name_rva = hint_rva
                    .checked_add(2)
                    .ok_or_else(|| Error::out_of_range("hint/name RVA overflows"))?;
                ImportThunk::Name {
                    hint: reader.u16_at(hint_rva)?,
                    name: reader.cstring_at(name_rva)?,
                }
            };
            imports.push(thunk);

            rva = rva
                .checked_add(thunk_size)
                .ok_or_else(|| Error::out_of_range("import lookup table RVA overflows"))?;
        }

        Ok(ImportEntry {
            dll_name,
            descriptor,
            imports,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an imported DLL by name (case-insensitive).
    pub fn find(&self, dll_name: &str) -> Option<&ImportEntry> {
        self.entries
            .iter()
            .find(|entry| entry.dll_name.eq_ignore_ascii_case(dll_name))
    }
}
