//! Resource directory tree: parsing and serialization.
//!
//! The resource table is a tree of directory tables. Each directory owns
//! subdirectories and data entries, keyed by a numeric ID or a UTF-16 name.
//! All offsets inside the table are relative to the start of the table,
//! except data entry addresses which are RVAs.
//!
//! # Examples
//!
//! ```
//! use peforge::resource::{ResourceData, ResourceDirectory, ResourceId, ResourceTable, ResourceType};
//!
//! let mut language = ResourceDirectory::new(ResourceId::Id(1));
//! language.data_entries.push(ResourceData::new(ResourceId::Id(0x409), b"<assembly/>".to_vec()));
//! let mut manifest = ResourceDirectory::new(ResourceId::Id(ResourceType::Manifest as u32));
//! manifest.subdirectories.push(language);
//!
//! let mut table = ResourceTable::default();
//! table.root.subdirectories.push(manifest);
//!
//! let bytes = table.to_bytes(0x3000)?;
//! let (parsed, error) = ResourceTable::parse(&bytes, 0x3000);
//! assert!(error.is_none());
//! assert_eq!(parsed, table);
//! # Ok::<(), peforge::Error>(())
//! ```

use std::collections::{HashMap, HashSet};

use crate::codec;
use crate::error::try_copy;
use crate::layout::align_up_usize;
use crate::reader::{checked_end, Reader};
use crate::{Error, Result};

/// Deepest directory nesting accepted by the parser.
pub const MAX_DEPTH: usize = 10;

const HIGH_BIT: u32 = 0x8000_0000;

/// Standard resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResourceType {
    Cursor = 1,
    Bitmap = 2,
    Icon = 3,
    Menu = 4,
    Dialog = 5,
    String = 6,
    FontDir = 7,
    Font = 8,
    Accelerator = 9,
    RcData = 10,
    MessageTable = 11,
    GroupCursor = 12,
    GroupIcon = 14,
    Version = 16,
    DlgInclude = 17,
    PlugPlay = 19,
    Vxd = 20,
    AniCursor = 21,
    AniIcon = 22,
    Html = 23,
    Manifest = 24,
}

impl ResourceType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Cursor),
            2 => Some(Self::Bitmap),
            3 => Some(Self::Icon),
            4 => Some(Self::Menu),
            5 => Some(Self::Dialog),
            6 => Some(Self::String),
            7 => Some(Self::FontDir),
            8 => Some(Self::Font),
            9 => Some(Self::Accelerator),
            10 => Some(Self::RcData),
            11 => Some(Self::MessageTable),
            12 => Some(Self::GroupCursor),
            14 => Some(Self::GroupIcon),
            16 => Some(Self::Version),
            17 => Some(Self::DlgInclude),
            19 => Some(Self::PlugPlay),
            20 => Some(Self::Vxd),
            21 => Some(Self::AniCursor),
            22 => Some(Self::AniIcon),
            23 => Some(Self::Html),
            24 => Some(Self::Manifest),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cursor => "CURSOR",
            Self::Bitmap => "BITMAP",
            Self::Icon => "ICON",
            Self::Menu => "MENU",
            Self::Dialog => "DIALOG",
            Self::String => "STRING",
            Self::FontDir => "FONTDIR",
            Self::Font => "FONT",
            Self::Accelerator => "ACCELERATOR",
            Self::RcData => "RCDATA",
            Self::MessageTable => "MESSAGETABLE",
            Self::GroupCursor => "GROUP_CURSOR",
            Self::GroupIcon => "GROUP_ICON",
            Self::Version => "VERSION",
            Self::DlgInclude => "DLGINCLUDE",
            Self::PlugPlay => "PLUGPLAY",
            Self::Vxd => "VXD",
            Self::AniCursor => "ANICURSOR",
            Self::AniIcon => "ANIICON",
            Self::Html => "HTML",
            Self::Manifest => "MANIFEST",
        }
    }
}

/// Key of a resource node: numeric ID or UTF-16 name.
///
/// Names are kept as raw code units so that unpaired surrogates survive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Id(u32),
    Name(Vec<u16>),
}

impl ResourceId {
    /// A name key from a Rust string.
    pub fn named(name: &str) -> Self {
        Self::Name(name.encode_utf16().collect())
    }

    pub fn is_named(&self) -> bool {
        matches!(self, Self::Name(_))
    }

    /// The name decoded lossily, if this is a name key.
    pub fn name(&self) -> Option<String> {
        match self {
            Self::Id(_) => None,
            Self::Name(units) => Some(String::from_utf16_lossy(units)),
        }
    }

    /// Check if this is a standard resource type ID.
    pub fn as_resource_type(&self) -> Option<ResourceType> {
        match self {
            Self::Id(id) => ResourceType::from_u32(*id),
            Self::Name(_) => None,
        }
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::Id(0)
    }
}

/// IMAGE_RESOURCE_DIRECTORY - 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDirectoryHeader {
    /// Resource flags (reserved, usually 0).
    pub characteristics: u32,
    /// Time/date stamp.
    pub time_date_stamp: u32,
    /// Major version.
    pub major_version: u16,
    /// Minor version.
    pub minor_version: u16,
    /// Number of named entries.
    pub number_of_named_entries: u16,
    /// Number of ID entries.
    pub number_of_id_entries: u16,
}

impl ResourceDirectoryHeader {
    pub const SIZE: usize = 16;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::SIZE)?;
        Ok(Self {
            characteristics: codec::read_u32(d, 0),
            time_date_stamp: codec::read_u32(d, 4),
            major_version: codec::read_u16(d, 8),
            minor_version: codec::read_u16(d, 10),
            number_of_named_entries: codec::read_u16(d, 12),
            number_of_id_entries: codec::read_u16(d, 14),
        })
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) {
        codec::write_u32(buf, offset, self.characteristics);
        codec::write_u32(buf, offset + 4, self.time_date_stamp);
        codec::write_u16(buf, offset + 8, self.major_version);
        codec::write_u16(buf, offset + 10, self.minor_version);
        codec::write_u16(buf, offset + 12, self.number_of_named_entries);
        codec::write_u16(buf, offset + 14, self.number_of_id_entries);
    }

    pub fn total_entries(&self) -> usize {
        self.number_of_named_entries as usize + self.number_of_id_entries as usize
    }
}

/// IMAGE_RESOURCE_DIRECTORY_ENTRY - 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDirectoryEntry {
    /// Name offset (high bit set) or ID.
    pub name_or_id: u32,
    /// Offset to data or subdirectory (high bit set = subdirectory).
    pub offset_to_data: u32,
}

impl ResourceDirectoryEntry {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::SIZE)?;
        Ok(Self {
            name_or_id: codec::read_u32(d, 0),
            offset_to_data: codec::read_u32(d, 4),
        })
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) {
        codec::write_u32(buf, offset, self.name_or_id);
        codec::write_u32(buf, offset + 4, self.offset_to_data);
    }

    /// Check if this entry has a string name (vs numeric ID).
    pub fn is_named(&self) -> bool {
        (self.name_or_id & HIGH_BIT) != 0
    }

    /// Get the name offset (only valid if is_named() is true).
    pub fn name_offset(&self) -> u32 {
        self.name_or_id & !HIGH_BIT
    }

    /// Check if this points to a subdirectory (vs data entry).
    pub fn is_directory(&self) -> bool {
        (self.offset_to_data & HIGH_BIT) != 0
    }

    /// Get the offset to subdirectory or data entry.
    pub fn data_offset(&self) -> u32 {
        self.offset_to_data & !HIGH_BIT
    }
}

/// IMAGE_RESOURCE_DATA_ENTRY - 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDataEntry {
    /// RVA of the resource data.
    pub offset_to_data: u32,
    /// Size of the resource data.
    pub size: u32,
    /// Code page.
    pub code_page: u32,
    /// Reserved.
    pub reserved: u32,
}

impl ResourceDataEntry {
    pub const SIZE: usize = 16;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::SIZE)?;
        Ok(Self {
            offset_to_data: codec::read_u32(d, 0),
            size: codec::read_u32(d, 4),
            code_page: codec::read_u32(d, 8),
            reserved: codec::read_u32(d, 12),
        })
    }

    pub fn write(&self, buf: &mut [u8], offset: usize) {
        codec::write_u32(buf, offset, self.offset_to_data);
        codec::write_u32(buf, offset + 4, self.size);
        codec::write_u32(buf, offset + 8, self.code_page);
        codec::write_u32(buf, offset + 12, self.reserved);
    }
}

/// A leaf of the tree: one resource blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceData {
    pub id: ResourceId,
    pub code_page: u32,
    pub reserved: u32,
    pub data: Vec<u8>,
}

impl ResourceData {
    pub fn new(id: ResourceId, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            ..Default::default()
        }
    }
}

/// A directory table and everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceDirectory {
    /// Key under which the parent refers to this directory.
    pub id: ResourceId,
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub subdirectories: Vec<ResourceDirectory>,
    pub data_entries: Vec<ResourceData>,
}

impl ResourceDirectory {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn subdirectory(&self, id: &ResourceId) -> Option<&ResourceDirectory> {
        self.subdirectories.iter().find(|dir| &dir.id == id)
    }

    pub fn subdirectory_mut(&mut self, id: &ResourceId) -> Option<&mut ResourceDirectory> {
        self.subdirectories.iter_mut().find(|dir| &dir.id == id)
    }

    pub fn data_entry(&self, id: &ResourceId) -> Option<&ResourceData> {
        self.data_entries.iter().find(|data| &data.id == id)
    }

    fn entry_count(&self) -> usize {
        self.subdirectories.len() + self.data_entries.len()
    }

    /// Bytes this directory table and all tables below it occupy.
    fn table_length(&self) -> usize {
        ResourceDirectoryHeader::SIZE
            + self.entry_count() * ResourceDirectoryEntry::SIZE
            + self
                .subdirectories
                .iter()
                .map(ResourceDirectory::table_length)
                .sum::<usize>()
    }

    fn data_entry_count(&self) -> usize {
        self.data_entries.len()
            + self
                .subdirectories
                .iter()
                .map(ResourceDirectory::data_entry_count)
                .sum::<usize>()
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a ResourceData>) {
        for dir in &self.subdirectories {
            dir.collect_leaves(out);
        }
        out.extend(self.data_entries.iter());
    }
}

/// The resource tree of an image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceTable {
    pub root: ResourceDirectory,
}

impl ResourceTable {
    /// Parse a resource table.
    ///
    /// `data` starts at the table and ends at the end of the owning section's
    /// contents. `rva_base` is the table's RVA, used to turn data entry RVAs
    /// into table offsets.
    ///
    /// Failures are contained: the node being built when a check fails is
    /// dropped, its siblings are still parsed, and the first error is
    /// returned next to whatever could be recovered.
    pub fn parse(data: &[u8], rva_base: u32) -> (Self, Option<Error>) {
        let mut parser = TreeParser {
            data,
            rva_base,
            entries_left: data.len() / ResourceDirectoryEntry::SIZE + 1,
            bytes_left: data.len(),
            first_error: None,
        };

        let root = match parser.directory(ResourceId::default(), 0, 1) {
            Ok(root) => root,
            Err(err) => {
                parser.record(err);
                ResourceDirectory::default()
            }
        };

        (Self { root }, parser.first_error)
    }

    /// Every data entry, depth-first in serialization order.
    pub fn leaves(&self) -> Vec<&ResourceData> {
        let mut out = Vec::new();
        self.root.collect_leaves(&mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.root.entry_count() == 0
    }

    /// Top-level directory for a standard resource type.
    pub fn find_type(&self, rt: ResourceType) -> Option<&ResourceDirectory> {
        self.root.subdirectory(&ResourceId::Id(rt as u32))
    }

    /// Serialized size of the table.
    pub fn size(&self) -> Result<usize> {
        Ok(TreeLayout::compute(self)?.total)
    }

    /// Serialize the table at the start of `buf` for a table placed at
    /// `rva_base`.
    ///
    /// With no buffer this only reports the number of bytes it would write.
    pub fn write(&self, buf: Option<&mut [u8]>, rva_base: u32) -> Result<usize> {
        let layout = TreeLayout::compute(self)?;
        let Some(buf) = buf else {
            return Ok(layout.total);
        };
        checked_end(0, layout.total, buf.len())?;
        buf[..layout.total].fill(0);

        for (units, offset) in &layout.strings {
            let at = layout.string_base + *offset;
            codec::write_u16(buf, at, units.len() as u16);
            for (i, unit) in units.iter().enumerate() {
                codec::write_u16(buf, at + 2 + i * 2, *unit);
            }
        }

        let mut writer = TreeWriter {
            buf,
            layout: &layout,
            rva_base,
            next_descriptor: layout.descriptor_base,
            next_data: layout.data_base,
        };
        writer.directory(&self.root, 0)?;

        log::debug!(
            "serialized resource table: {} bytes, {} strings",
            layout.total,
            layout.strings.len()
        );
        Ok(layout.total)
    }

    pub fn to_bytes(&self, rva_base: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size()?];
        self.write(Some(&mut buf), rva_base)?;
        Ok(buf)
    }
}

/// Move every data entry RVA in a serialized table by `new_base - old_base`.
///
/// Used when the section holding an unmodified table is relocated. Each
/// directory and descriptor is visited at most once and nesting is capped
/// at [`MAX_DEPTH`]; entries pointing outside `data` are skipped.
pub fn rebase(data: &mut [u8], old_base: u32, new_base: u32) -> Result<usize> {
    if old_base == new_base {
        return Ok(0);
    }
    let mut rebaser = Rebaser {
        old_base,
        new_base,
        directories: HashSet::new(),
        descriptors: HashSet::new(),
    };
    rebaser.directory(data, 0, 1)?;
    log::debug!(
        "rebased {} resource data entries from {:#x} to {:#x}",
        rebaser.descriptors.len(),
        old_base,
        new_base
    );
    Ok(rebaser.descriptors.len())
}

struct Rebaser {
    old_base: u32,
    new_base: u32,
    directories: HashSet<usize>,
    descriptors: HashSet<usize>,
}

impl Rebaser {
    fn directory(&mut self, data: &mut [u8], offset: usize, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH || !self.directories.insert(offset) {
            return Ok(());
        }
        let header = ResourceDirectoryHeader::parse(data, offset)?;
        let entries_start = offset + ResourceDirectoryHeader::SIZE;

        for i in 0..header.total_entries() {
            let Ok(entry) =
                ResourceDirectoryEntry::parse(data, entries_start + i * ResourceDirectoryEntry::SIZE)
            else {
                break;
            };
            let target = entry.data_offset() as usize;
            if entry.is_directory() {
                // Damaged subtrees were dropped at parse time too.
                let _ = self.directory(data, target, depth + 1);
            } else if self.descriptors.insert(target) {
                if let Ok(rva) = data.read_u32_at(target) {
                    if let Some(moved) = rva
                        .checked_sub(self.old_base)
                        .and_then(|delta| delta.checked_add(self.new_base))
                    {
                        codec::write_u32(data, target, moved);
                    }
                }
            }
        }
        Ok(())
    }
}

struct TreeParser<'a> {
    data: &'a [u8],
    rva_base: u32,
    // A well-formed tree cannot hold more entries or blob bytes than its
    // section. Shared subtrees that exceed this are rejected.
    entries_left: usize,
    bytes_left: usize,
    first_error: Option<Error>,
}

impl TreeParser<'_> {
    fn record(&mut self, err: Error) {
        log::warn!("dropping resource node: {err}");
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    fn directory(&mut self, id: ResourceId, offset: usize, depth: usize) -> Result<ResourceDirectory> {
        if depth > MAX_DEPTH {
            return Err(Error::malformed(format!(
                "resource directory nesting exceeds {MAX_DEPTH} levels"
            )));
        }

        let header = ResourceDirectoryHeader::parse(self.data, offset)?;
        let count = header.total_entries();
        let entries_start = offset + ResourceDirectoryHeader::SIZE;
        checked_end(entries_start, count * ResourceDirectoryEntry::SIZE, self.data.len())?;

        let mut dir = ResourceDirectory {
            id,
            characteristics: header.characteristics,
            time_date_stamp: header.time_date_stamp,
            major_version: header.major_version,
            minor_version: header.minor_version,
            subdirectories: Vec::new(),
            data_entries: Vec::new(),
        };

        for i in 0..count {
            let entry =
                ResourceDirectoryEntry::parse(self.data, entries_start + i * ResourceDirectoryEntry::SIZE)?;
            if let Err(err) = self.entry(&mut dir, entry, depth) {
                self.record(err);
            }
        }

        Ok(dir)
    }

    fn entry(&mut self, dir: &mut ResourceDirectory, entry: ResourceDirectoryEntry, depth: usize) -> Result<()> {
        self.entries_left = self
            .entries_left
            .checked_sub(1)
            .ok_or_else(|| Error::malformed("resource tree has more entries than fit in its section"))?;

        let id = if entry.is_named() {
            ResourceId::Name(self.string(entry.name_offset() as usize)?)
        } else {
            ResourceId::Id(entry.name_or_id)
        };

        if entry.is_directory() {
            let sub = self.directory(id, entry.data_offset() as usize, depth + 1)?;
            dir.subdirectories.push(sub);
        } else {
            let data = self.data_entry(id, entry.data_offset() as usize)?;
            dir.data_entries.push(data);
        }
        Ok(())
    }

    fn string(&self, offset: usize) -> Result<Vec<u16>> {
        let len = self.data.read_u16_at(offset)? as usize;
        let bytes = self.data.slice_at(offset + 2, len * 2)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn data_entry(&mut self, id: ResourceId, offset: usize) -> Result<ResourceData> {
        let entry = ResourceDataEntry::parse(self.data, offset)?;
        let start = entry.offset_to_data.checked_sub(self.rva_base).ok_or_else(|| {
            Error::malformed(format!(
                "resource data RVA {:#x} below table RVA {:#x}",
                entry.offset_to_data, self.rva_base
            ))
        })? as usize;
        let size = entry.size as usize;
        let end = checked_end(start, size, self.data.len())?;

        self.bytes_left = self
            .bytes_left
            .checked_sub(size)
            .ok_or_else(|| Error::malformed("resource data exceeds its section"))?;

        Ok(ResourceData {
            id,
            code_page: entry.code_page,
            reserved: entry.reserved,
            data: try_copy(&self.data[start..end])?,
        })
    }
}

/// Offsets of every region of a serialized tree.
struct TreeLayout {
    /// Deduplicated names and their offsets within the string area.
    strings: Vec<(Vec<u16>, usize)>,
    string_index: HashMap<Vec<u16>, usize>,
    string_base: usize,
    descriptor_base: usize,
    data_base: usize,
    total: usize,
}

impl TreeLayout {
    fn compute(table: &ResourceTable) -> Result<Self> {
        let string_base = table.root.table_length();
        let mut layout = Self {
            strings: Vec::new(),
            string_index: HashMap::new(),
            string_base,
            descriptor_base: 0,
            data_base: 0,
            total: 0,
        };

        let mut string_bytes = 0usize;
        layout.collect_strings(&table.root, &mut string_bytes)?;

        layout.descriptor_base = align_up_usize(string_base + string_bytes, 4);
        layout.data_base = align_up_usize(
            layout.descriptor_base + table.root.data_entry_count() * ResourceDataEntry::SIZE,
            8,
        );

        let mut end = layout.data_base;
        for leaf in table.leaves() {
            end = align_up_usize(end, 8) + leaf.data.len();
        }
        layout.total = end;

        if layout.total > (HIGH_BIT - 1) as usize {
            return Err(Error::out_of_range("resource table larger than 2 GiB"));
        }
        Ok(layout)
    }

    fn collect_strings(&mut self, dir: &ResourceDirectory, bytes: &mut usize) -> Result<()> {
        self.put_string(&dir.id, bytes)?;
        for sub in &dir.subdirectories {
            self.collect_strings(sub, bytes)?;
        }
        for data in &dir.data_entries {
            self.put_string(&data.id, bytes)?;
        }
        Ok(())
    }

    fn put_string(&mut self, id: &ResourceId, bytes: &mut usize) -> Result<()> {
        let ResourceId::Name(units) = id else {
            return Ok(());
        };
        if self.string_index.contains_key(units) {
            return Ok(());
        }
        if units.len() > u16::MAX as usize {
            return Err(Error::out_of_range(format!(
                "resource name of {} characters too long",
                units.len()
            )));
        }

        self.string_index.insert(units.clone(), *bytes);
        self.strings.push((units.clone(), *bytes));
        *bytes += 2 + units.len() * 2;
        Ok(())
    }

    fn name_or_id(&self, id: &ResourceId) -> Result<u32> {
        match id {
            ResourceId::Id(id) => Ok(*id),
            ResourceId::Name(units) => {
                let offset = self
                    .string_index
                    .get(units)
                    .ok_or_else(|| Error::malformed("resource name missing from string table"))?;
                Ok((self.string_base + offset) as u32 | HIGH_BIT)
            }
        }
    }
}

struct TreeWriter<'a> {
    buf: &'a mut [u8],
    layout: &'a TreeLayout,
    rva_base: u32,
    next_descriptor: usize,
    next_data: usize,
}

impl TreeWriter<'_> {
    fn directory(&mut self, dir: &ResourceDirectory, offset: usize) -> Result<()> {
        let named = dir.subdirectories.iter().filter(|d| d.id.is_named()).count()
            + dir.data_entries.iter().filter(|d| d.id.is_named()).count();
        let ids = dir.entry_count() - named;
        if named > u16::MAX as usize || ids > u16::MAX as usize {
            return Err(Error::out_of_range("too many entries in resource directory"));
        }

        ResourceDirectoryHeader {
            characteristics: dir.characteristics,
            time_date_stamp: dir.time_date_stamp,
            major_version: dir.major_version,
            minor_version: dir.minor_version,
            number_of_named_entries: named as u16,
            number_of_id_entries: ids as u16,
        }
        .write(self.buf, offset);

        let mut entry_offset = offset + ResourceDirectoryHeader::SIZE;
        let mut next_table = entry_offset + dir.entry_count() * ResourceDirectoryEntry::SIZE;

        for sub in &dir.subdirectories {
            ResourceDirectoryEntry {
                name_or_id: self.layout.name_or_id(&sub.id)?,
                offset_to_data: next_table as u32 | HIGH_BIT,
            }
            .write(self.buf, entry_offset);
            self.directory(sub, next_table)?;

            next_table += sub.table_length();
            entry_offset += ResourceDirectoryEntry::SIZE;
        }

        for data in &dir.data_entries {
            let descriptor = self.next_descriptor;
            let start = align_up_usize(self.next_data, 8);
            let size = u32::try_from(data.data.len())
                .map_err(|_| Error::out_of_range("resource blob larger than 4 GiB"))?;
            let rva = self
                .rva_base
                .checked_add(start as u32)
                .ok_or_else(|| Error::out_of_range("resource data RVA overflows"))?;

            ResourceDirectoryEntry {
                name_or_id: self.layout.name_or_id(&data.id)?,
                offset_to_data: descriptor as u32,
            }
            .write(self.buf, entry_offset);

            ResourceDataEntry {
                offset_to_data: rva,
                size,
                code_page: data.code_page,
                reserved: data.reserved,
            }
            .write(self.buf, descriptor);
            self.buf[start..start + data.data.len()].copy_from_slice(&data.data);

            self.next_descriptor += ResourceDataEntry::SIZE;
            self.next_data = start + data.data.len();
            entry_offset += ResourceDirectoryEntry::SIZE;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> ResourceTable {
        let mut english = ResourceDirectory::new(ResourceId::Id(1));
        english
            .data_entries
            .push(ResourceData::new(ResourceId::Id(0x409), b"manifest".to_vec()));

        let mut manifest = ResourceDirectory::new(ResourceId::Id(ResourceType::Manifest as u32));
        manifest.subdirectories.push(english);

        let mut custom = ResourceDirectory::new(ResourceId::named("MYDATA"));
        let mut blob = ResourceData::new(ResourceId::named("BLOB"), vec![1, 2, 3]);
        blob.code_page = 1252;
        custom.data_entries.push(blob);
        custom
            .data_entries
            .push(ResourceData::new(ResourceId::named("MYDATA"), vec![9; 17]));

        let mut table = ResourceTable::default();
        table.root.time_date_stamp = 0x1234;
        table.root.subdirectories.push(manifest);
        table.root.subdirectories.push(custom);
        table
    }

    fn raw_directory(named: u16, ids: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        codec::write_u16(&mut buf, 12, named);
        codec::write_u16(&mut buf, 14, ids);
        buf
    }

    #[test]
    fn test_resource_type_lookup() {
        assert_eq!(ResourceType::from_u32(24), Some(ResourceType::Manifest));
        assert_eq!(ResourceType::from_u32(13), None);
        assert_eq!(ResourceType::Version.name(), "VERSION");
        assert_eq!(
            ResourceId::Id(3).as_resource_type(),
            Some(ResourceType::Icon)
        );
        assert_eq!(ResourceId::named("X").name().as_deref(), Some("X"));
    }

    #[test]
    fn test_table_roundtrip() {
        let table = sample_table();
        let bytes = table.to_bytes(0x5000).unwrap();
        assert_eq!(table.write(None, 0x5000).unwrap(), bytes.len());

        let (parsed, error) = ResourceTable::parse(&bytes, 0x5000);
        assert!(error.is_none());
        assert_eq!(parsed, table);
        assert_eq!(parsed.leaves().len(), 3);
        assert!(parsed.find_type(ResourceType::Manifest).is_some());
    }

    #[test]
    fn test_layout_regions() {
        let table = sample_table();
        let bytes = table.to_bytes(0).unwrap();

        // root(16 + 2*8) + manifest(16 + 8) + english(16 + 8) + custom(16 + 2*8)
        let tables = 32 + 24 + 24 + 32;
        assert_eq!(table.root.table_length(), tables);

        // Root header carries one named and one id entry.
        let root = ResourceDirectoryHeader::parse(&bytes, 0).unwrap();
        assert_eq!(root.number_of_named_entries, 1);
        assert_eq!(root.number_of_id_entries, 1);
        assert_eq!(root.time_date_stamp, 0x1234);

        // "MYDATA" is stored once and the string table follows the tables.
        let custom = ResourceDirectoryEntry::parse(&bytes, 24).unwrap();
        assert!(custom.is_named());
        assert_eq!(custom.name_offset() as usize, tables);
        assert_eq!(codec::read_u16(&bytes, tables), 6);

        let strings = 2 + 12 + 2 + 8;
        let descriptors = align_up_usize(tables + strings, 4);
        let first = ResourceDataEntry::parse(&bytes, descriptors).unwrap();
        assert_eq!(first.size, 8);
        assert_eq!(first.offset_to_data as usize % 8, 0);
        assert_eq!(bytes.len(), first.offset_to_data as usize + 8 + 8 + 17);
    }

    #[test]
    fn test_depth_limit_rejects_cycle() {
        // Root with a single subdirectory entry pointing back at itself.
        let mut bytes = raw_directory(0, 1);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&HIGH_BIT.to_le_bytes());
        bytes.resize(256, 0);

        let (parsed, error) = ResourceTable::parse(&bytes, 0);
        assert!(matches!(error, Some(Error::MalformedStructure(_))));

        // Every level above the failing one is kept.
        let mut depth = 1;
        let mut dir = &parsed.root;
        while let Some(sub) = dir.subdirectories.first() {
            depth += 1;
            dir = sub;
        }
        assert_eq!(depth, MAX_DEPTH);
    }

    #[test]
    fn test_failing_entry_dropped_siblings_kept() {
        // Root: data entry with bad RVA, then a good data entry.
        let mut bytes = raw_directory(0, 2);
        for (id, offset) in [(1u32, 32u32), (2, 48)] {
            bytes.extend_from_slice(&id.to_le_bytes());
            bytes.extend_from_slice(&offset.to_le_bytes());
        }
        // Bad descriptor: RVA far past the table.
        let mut bad = [0u8; 16];
        codec::write_u32(&mut bad, 0, 0x9000);
        codec::write_u32(&mut bad, 4, 4);
        bytes.extend_from_slice(&bad);
        let mut good = [0u8; 16];
        codec::write_u32(&mut good, 0, 0x1000 + 64);
        codec::write_u32(&mut good, 4, 4);
        bytes.extend_from_slice(&good);
        bytes.extend_from_slice(b"DATA");

        let (parsed, error) = ResourceTable::parse(&bytes, 0x1000);
        assert!(matches!(error, Some(Error::TruncatedInput { .. })));
        assert_eq!(parsed.root.data_entries.len(), 1);
        assert_eq!(parsed.root.data_entries[0].id, ResourceId::Id(2));
        assert_eq!(parsed.root.data_entries[0].data, b"DATA");
    }

    #[test]
    fn test_truncated_root() {
        let (parsed, error) = ResourceTable::parse(&[0u8; 8], 0);
        assert!(matches!(error, Some(Error::TruncatedInput { .. })));
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_entry_count_past_table() {
        let bytes = raw_directory(0, 40);
        let (parsed, error) = ResourceTable::parse(&bytes, 0);
        assert!(error.is_some());
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_string_past_table() {
        let mut bytes = raw_directory(1, 0);
        bytes.extend_from_slice(&(HIGH_BIT | 24).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&100u16.to_le_bytes());

        let (parsed, error) = ResourceTable::parse(&bytes, 0);
        assert!(matches!(error, Some(Error::TruncatedInput { .. })));
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_rebase_moves_data_rvas() {
        let table = sample_table();
        let mut bytes = table.to_bytes(0x3000).unwrap();

        assert_eq!(rebase(&mut bytes, 0x3000, 0x5000).unwrap(), 3);
        let (parsed, error) = ResourceTable::parse(&bytes, 0x5000);
        assert!(error.is_none());
        assert_eq!(parsed, table);
        assert_eq!(bytes, table.to_bytes(0x5000).unwrap());
    }

    #[test]
    fn test_rebase_survives_cycle() {
        let mut bytes = vec![0u8; 32];
        codec::write_u16(&mut bytes, 14, 1);
        codec::write_u32(&mut bytes, 16, 7);
        codec::write_u32(&mut bytes, 20, HIGH_BIT);
        assert_eq!(rebase(&mut bytes, 0x1000, 0x2000).unwrap(), 0);
    }

    #[test]
    fn test_name_too_long() {
        let mut table = ResourceTable::default();
        table.root.data_entries.push(ResourceData::new(
            ResourceId::Name(vec![b'a' as u16; 70_000]),
            Vec::new(),
        ));
        assert!(matches!(table.size(), Err(Error::OutOfRange(_))));
    }
}
