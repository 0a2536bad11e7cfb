//! The image model: parsing, editing, recalculation and serialization.
//!
//! A [`PeImage`] owns every structure of a file. Edits flag the parts they
//! touch; [`PeImage::recalculate`] then re-places sections and re-derives
//! the header fields and directory entries that depend on them, and
//! [`PeImage::write_to_buffer`] emits the bytes.
//!
//! # Examples
//!
//! ```
//! use peforge::{ImageBuilder, PeImage};
//! use peforge::section::characteristics;
//!
//! let mut image = ImageBuilder::new()
//!     .add_section(".text", vec![0xC3], characteristics::CODE | characteristics::EXECUTE)
//!     .build()?;
//! let bytes = image.write_to_vec()?;
//!
//! let parsed = PeImage::create_from_buffer(&bytes)?;
//! assert_eq!(parsed.sections().len(), 1);
//! assert_eq!(parsed.section(0)?.contents(), &[0xC3]);
//! # Ok::<(), peforge::Error>(())
//! ```

use std::fs;
use std::ops::Range;
use std::path::Path;

use crate::certificate::CertificateTable;
use crate::checksum;
use crate::data_dir::{
    find_containing_section, resolve_directories, DataDirectory, DataDirectoryType,
    DirectoryEntry, DirectoryLocation,
};
use crate::dos::DosHeader;
use crate::error::{try_alloc, try_copy};
use crate::header::Header;
use crate::import::ImportTable;
use crate::layout::{
    align_up_usize, place_sections, section_table_end, summarize_sections, LayoutConfig,
};
use crate::reader::checked_end;
use crate::resource::{self, ResourceTable};
use crate::section::{Section, SectionHeader};
use crate::{Error, Result};

const IMPORT_SLOT: usize = DataDirectoryType::Import.as_index();
const RESOURCE_SLOT: usize = DataDirectoryType::Resource.as_index();
const CERTIFICATE_SLOT: usize = DataDirectoryType::Certificate.as_index();

/// File offsets of every region, derived from the current model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileLayout {
    pe_offset: usize,
    section_table: usize,
    slack_end: usize,
    end_of_sections: usize,
    certificate_offset: Option<usize>,
    total: usize,
}

/// A parsed or built PE/PE+ image.
#[derive(Debug)]
pub struct PeImage {
    dos: DosHeader,
    header: Header,
    sections: Vec<Section>,
    directories: Vec<DirectoryEntry>,
    /// Non-zero bytes between the section table and the first section.
    header_slack: Vec<u8>,
    /// File offset the slack was read from or last written to.
    slack_offset: usize,
    certificates: CertificateTable,
    overlay: Vec<u8>,
    /// Number of overlay bytes that precede the certificate table.
    overlay_split: usize,
    resource_table: Option<ResourceTable>,
    import_table: ImportTable,
    diagnostics: Vec<Error>,
    /// Alignments the current section placement was made with.
    placement: LayoutConfig,
    header_modified: bool,
    layout_modified: bool,
}

fn section_headers(sections: &[Section]) -> Vec<SectionHeader> {
    sections.iter().map(|s| s.header.clone()).collect()
}

impl PeImage {
    /// Parse an image from a byte buffer.
    ///
    /// The DOS header, PE header and section table must be intact. Problems
    /// in the certificate, resource or import tables are recorded in
    /// [`diagnostics`](Self::diagnostics) and do not fail the parse.
    pub fn create_from_buffer(data: &[u8]) -> Result<Self> {
        let dos = DosHeader::parse(data)?;
        let pe_offset = dos.pe_header_offset() as usize;
        let header = Header::parse_at(data, pe_offset)?;
        let mut header_modified = false;

        let declared = header.coff.size_of_optional_header as usize;
        if declared < header.optional.size() {
            log::warn!(
                "size_of_optional_header {declared:#x} smaller than the {:#x}-byte optional header",
                header.optional.size()
            );
            header_modified = true;
        }

        let table_offset = pe_offset + Header::optional_header_offset() + declared;
        let count = header.coff.number_of_sections as usize;
        let table_end = checked_end(table_offset, count * SectionHeader::SIZE, data.len())?;

        let mut sections = Vec::new();
        sections
            .try_reserve_exact(count)
            .map_err(|_| Error::AllocationFailure(count * std::mem::size_of::<Section>()))?;
        for index in 0..count {
            sections.push(Section::parse(
                data,
                table_offset + index * SectionHeader::SIZE,
                index,
            )?);
        }

        let directories =
            resolve_directories(header.data_directories(), &section_headers(&sections));

        let slack_limit = sections
            .iter()
            .map(|s| &s.header)
            .filter(|h| h.size_of_raw_data > 0 && h.pointer_to_raw_data as usize >= table_end)
            .map(|h| h.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(header.optional.size_of_headers() as usize)
            .clamp(table_end, data.len());
        let slack = &data[table_end..slack_limit];
        let used = slack.iter().rposition(|&b| b != 0).map_or(0, |last| last + 1);
        let header_slack = try_copy(&slack[..used])?;

        let end_of_sections = sections
            .iter()
            .filter(|s| s.header.size_of_raw_data > 0)
            .map(|s| s.header.raw_end())
            .fold((table_end + header_slack.len()) as u64, u64::max)
            .min(data.len() as u64) as usize;

        let mut diagnostics = Vec::new();
        let mut certificates = CertificateTable::default();
        let mut overlay = try_copy(&data[end_of_sections..])?;
        let mut overlay_split = overlay.len();

        if let Some(entry) = directories.get(CERTIFICATE_SLOT).filter(|e| e.raw.size > 0) {
            let start = entry.raw.virtual_address as usize;
            let size = entry.raw.size as usize;
            match CertificateTable::parse(data, start, size) {
                Ok(table) if !table.is_empty() => {
                    let before = &data[end_of_sections..start.max(end_of_sections)];
                    let after = &data[(start + size).max(end_of_sections)..];
                    overlay = try_copy(before)?;
                    overlay_split = overlay.len();
                    overlay
                        .try_reserve_exact(after.len())
                        .map_err(|_| Error::AllocationFailure(after.len()))?;
                    overlay.extend_from_slice(after);

                    if align_up_usize(end_of_sections + overlay_split, 8) != start {
                        header_modified = true;
                    }
                    log::debug!("{} certificates at {:#x}", table.len(), start);
                    certificates = table;
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("certificate table at {start:#x} rejected: {err}");
                    diagnostics.push(err);
                }
            }
        }

        let resource_table = match directories.get(RESOURCE_SLOT) {
            Some(&DirectoryEntry {
                raw,
                location: DirectoryLocation::Section { index, offset },
            }) => {
                let contents = sections[index].contents();
                let offset = offset as usize;
                if offset > contents.len() {
                    let err = Error::truncated(offset, raw.size as usize, contents.len());
                    log::warn!("resource table outside section data: {err}");
                    diagnostics.push(err);
                    None
                } else {
                    let (table, err) = ResourceTable::parse(&contents[offset..], raw.virtual_address);
                    if let Some(err) = err {
                        log::warn!("resource table partially parsed: {err}");
                        diagnostics.push(err);
                    }
                    Some(table)
                }
            }
            Some(DirectoryEntry {
                location: DirectoryLocation::Detached,
                raw,
            }) => {
                let err = Error::malformed(format!(
                    "resource directory RVA {:#x} is not inside any section",
                    raw.virtual_address
                ));
                log::warn!("{err}");
                diagnostics.push(err);
                None
            }
            _ => None,
        };

        let import_table = match directories.get(IMPORT_SLOT) {
            Some(entry) if entry.section_index().is_some() => {
                let (table, errors) = ImportTable::parse(
                    &sections,
                    entry.raw.virtual_address,
                    header.optional.is_pe32plus(),
                );
                diagnostics.extend(errors);
                table
            }
            _ => ImportTable::default(),
        };

        log::debug!(
            "parsed image: {} sections, {} bytes of header slack, {} overlay bytes, {} diagnostics",
            sections.len(),
            header_slack.len(),
            overlay.len(),
            diagnostics.len()
        );

        let placement = LayoutConfig::new(
            header.optional.file_alignment(),
            header.optional.section_alignment(),
            header.coff.machine,
        );

        Ok(Self {
            dos,
            header,
            sections,
            directories,
            header_slack,
            slack_offset: table_end,
            certificates,
            overlay,
            overlay_split,
            resource_table,
            import_table,
            diagnostics,
            placement,
            header_modified,
            layout_modified: false,
        })
    }

    /// Read and parse an image from disk.
    pub fn create_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        Self::create_from_buffer(&data)
    }

    /// A fresh image with no sections placed yet.
    pub(crate) fn from_parts(dos: DosHeader, header: Header, sections: Vec<Section>) -> Self {
        let directories =
            resolve_directories(header.data_directories(), &section_headers(&sections));
        Self {
            dos,
            header,
            sections,
            directories,
            header_slack: Vec::new(),
            slack_offset: 0,
            certificates: CertificateTable::default(),
            overlay: Vec::new(),
            overlay_split: 0,
            resource_table: None,
            import_table: ImportTable::default(),
            diagnostics: Vec::new(),
            placement: LayoutConfig::default(),
            header_modified: true,
            layout_modified: true,
        }
    }

    // ---- serialization ----

    /// Recalculate if needed, then write the image into `buf`.
    ///
    /// With no buffer this returns the number of bytes a write needs. A
    /// buffer shorter than that is rejected with `TruncatedInput`.
    pub fn write_to_buffer(&mut self, buf: Option<&mut [u8]>) -> Result<usize> {
        self.recalculate()?;
        let layout = self.file_layout()?;
        let Some(buf) = buf else {
            return Ok(layout.total);
        };
        if buf.len() < layout.total {
            return Err(Error::truncated(0, layout.total, buf.len()));
        }

        let buf = &mut buf[..layout.total];
        buf.fill(0);

        // Section data first: headers win where a section overlaps them.
        for section in &self.sections {
            section.write_data(buf)?;
        }

        self.dos.write(buf)?;
        self.header.write(Some(&mut *buf), layout.pe_offset)?;
        for (i, section) in self.sections.iter().enumerate() {
            section
                .header
                .write(buf, layout.section_table + i * SectionHeader::SIZE)?;
        }
        let slack_start = layout.slack_end - self.header_slack.len();
        buf[slack_start..layout.slack_end].copy_from_slice(&self.header_slack);

        let (before, after) = self.overlay.split_at(self.overlay_split.min(self.overlay.len()));
        let mut cursor = layout.end_of_sections;
        buf[cursor..cursor + before.len()].copy_from_slice(before);
        cursor += before.len();
        if let Some(at) = layout.certificate_offset {
            cursor = at + self.certificates.write(Some(&mut *buf), at)?;
        }
        buf[cursor..cursor + after.len()].copy_from_slice(after);

        log::debug!("wrote {} bytes", layout.total);
        Ok(layout.total)
    }

    /// Recalculate if needed and serialize into a new vector.
    pub fn write_to_vec(&mut self) -> Result<Vec<u8>> {
        let size = self.write_to_buffer(None)?;
        let mut buf = try_alloc(size)?;
        self.write_to_buffer(Some(&mut buf))?;
        Ok(buf)
    }

    /// Serialize and write the image to disk, returning the byte count.
    pub fn write_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let buf = self.write_to_vec()?;
        fs::write(path, &buf)?;
        Ok(buf.len())
    }

    fn file_layout(&self) -> Result<FileLayout> {
        let declared = self.header.coff.size_of_optional_header as usize;
        self.file_layout_for(declared.max(self.header.optional.size()))
    }

    fn file_layout_for(&self, optional_size: usize) -> Result<FileLayout> {
        let pe_offset = self.dos.pe_header_offset() as usize;
        if pe_offset < self.dos.size() {
            return Err(Error::malformed(format!(
                "PE header offset {pe_offset:#x} overlaps the {}-byte DOS header",
                self.dos.size()
            )));
        }

        let section_table = pe_offset + Header::optional_header_offset() + optional_size;
        let slack_end =
            section_table + self.sections.len() * SectionHeader::SIZE + self.header_slack.len();
        let end_of_sections = self
            .sections
            .iter()
            .filter(|s| s.header.size_of_raw_data > 0)
            .map(|s| s.header.raw_end())
            .fold(slack_end as u64, u64::max);
        let end_of_sections = usize::try_from(end_of_sections)
            .map_err(|_| Error::out_of_range("section data does not fit in memory"))?;

        let split = self.overlay_split.min(self.overlay.len());
        let mut total = end_of_sections + self.overlay.len();
        let certificate_offset = if self.certificates.is_empty() {
            None
        } else {
            let at = align_up_usize(end_of_sections + split, 8);
            total = at + self.certificates.size() + (self.overlay.len() - split);
            Some(at)
        };

        Ok(FileLayout {
            pe_offset,
            section_table,
            slack_end,
            end_of_sections,
            certificate_offset,
            total,
        })
    }

    // ---- recalculation ----

    /// Bring derived header fields, placement and directories up to date.
    ///
    /// Does nothing when nothing was edited. A changed DOS stub, section or
    /// section list re-places every section; a header-only edit re-places
    /// them only if the header area changed size.
    pub fn recalculate(&mut self) -> Result<()> {
        let full = self.dos.is_modified()
            || self.layout_modified
            || self.sections.iter().any(Section::is_modified);
        if !full && !self.header_modified {
            return Ok(());
        }
        self.recalculate_with(full)
    }

    /// Recalculate everything, whether or not anything was edited.
    pub fn recalculate_force(&mut self) -> Result<()> {
        self.recalculate_with(true)
    }

    fn recalculate_with(&mut self, full: bool) -> Result<()> {
        let pe_offset = self.dos.pe_header_offset();
        if (pe_offset as usize) < self.dos.size() {
            return Err(Error::malformed(format!(
                "PE header offset {pe_offset:#x} overlaps the {}-byte DOS header",
                self.dos.size()
            )));
        }

        let config = LayoutConfig::new(
            self.header.optional.file_alignment(),
            self.header.optional.section_alignment(),
            self.header.coff.machine,
        );
        let section_count = u16::try_from(self.sections.len()).map_err(|_| {
            Error::out_of_range(format!("{} sections do not fit the COFF header", self.sections.len()))
        })?;
        let optional_size = u16::try_from(self.header.optional.size()).map_err(|_| {
            Error::out_of_range(format!(
                "{} data directories do not fit the COFF header",
                self.directories.len()
            ))
        })?;

        let table_end =
            section_table_end(pe_offset, self.header.optional.size(), self.sections.len());
        let size_of_headers = u32::try_from(table_end + self.header_slack.len())
            .map(|size| config.align_file(size))
            .map_err(|_| Error::out_of_range("headers larger than 4 GiB"))?;
        let realigned = config != self.placement;
        let moved = size_of_headers != self.header.optional.size_of_headers()
            || table_end != self.slack_offset
            || realigned;

        let snapshot = section_headers(&self.sections);
        if full || moved {
            let mut first = self.sections.first().map_or(0, |s| s.header.virtual_address);
            if realigned {
                first = config.align_section(first);
            }
            let virtual_start = config.align_section(size_of_headers).max(first);
            place_sections(&mut self.sections, &config, virtual_start, size_of_headers)?;
        }

        let (header, directories) = match self.derive_header(
            &config,
            table_end,
            size_of_headers,
            section_count,
            optional_size,
        ) {
            Ok(derived) => derived,
            Err(err) => {
                for (section, header) in self.sections.iter_mut().zip(snapshot) {
                    section.header = header;
                }
                return Err(err);
            }
        };

        self.rebase_resources(&directories);
        self.header = header;
        self.directories = directories;
        self.slack_offset = table_end;
        self.placement = config;

        self.dos.clear_modified();
        for section in &mut self.sections {
            section.clear_modified();
        }
        self.header_modified = false;
        self.layout_modified = false;

        log::debug!(
            "recalculated {} layout: size_of_headers {:#x}, size_of_image {:#x}",
            if full || moved { "full" } else { "header" },
            size_of_headers,
            self.header.optional.size_of_image()
        );
        Ok(())
    }

    /// Header and directories implied by the current placement.
    fn derive_header(
        &self,
        config: &LayoutConfig,
        table_end: usize,
        size_of_headers: u32,
        section_count: u16,
        optional_size: u16,
    ) -> Result<(Header, Vec<DirectoryEntry>)> {
        let summary =
            summarize_sections(&self.sections, config, self.header.is_pe32(), size_of_headers);

        let mut header = self.header.clone();
        header.coff.number_of_sections = section_count;
        header.coff.size_of_optional_header = optional_size;

        let opt = &mut header.optional;
        opt.set_file_alignment(config.file_alignment);
        opt.set_section_alignment(config.section_alignment);
        opt.set_size_of_headers(size_of_headers);
        if let Some(base) = summary.base_of_code {
            opt.set_base_of_code(base);
        }
        if let Some(base) = summary.base_of_data {
            opt.set_base_of_data(base);
        }
        opt.set_size_of_code(summary.size_of_code);
        opt.set_size_of_initialized_data(summary.size_of_initialized_data);
        opt.set_size_of_uninitialized_data(summary.size_of_uninitialized_data);
        opt.set_size_of_image(summary.size_of_image);

        let layout = self.file_layout_for(optional_size as usize)?;
        let certificate = match layout.certificate_offset {
            Some(at) => Some(DataDirectory::new(
                u32::try_from(at)
                    .map_err(|_| Error::out_of_range("certificate table offset past 4 GiB"))?,
                u32::try_from(self.certificates.size())
                    .map_err(|_| Error::out_of_range("certificate table larger than 4 GiB"))?,
            )),
            None => None,
        };

        let slack_delta = table_end as i64 - self.slack_offset as i64;
        let old_slack: Range<u64> =
            self.slack_offset as u64..(self.slack_offset + self.header_slack.len()) as u64;

        let directories = self
            .directories
            .iter()
            .map(|entry| {
                let mut entry = *entry;
                match entry.location {
                    DirectoryLocation::Section { index, offset } => {
                        let section = self
                            .sections
                            .get(index)
                            .ok_or_else(|| Error::index(index, self.sections.len()))?;
                        entry.raw.virtual_address = section
                            .header
                            .virtual_address
                            .checked_add(offset)
                            .ok_or_else(|| Error::out_of_range("directory RVA overflows"))?;
                    }
                    DirectoryLocation::FileOffset(_) => match certificate {
                        Some(raw) => {
                            entry.raw = raw;
                            entry.location = DirectoryLocation::FileOffset(raw.virtual_address);
                        }
                        None => {
                            entry.raw = DataDirectory::default();
                            entry.location = DirectoryLocation::Empty;
                        }
                    },
                    DirectoryLocation::Empty => entry.raw = DataDirectory::default(),
                    DirectoryLocation::Detached => {
                        // Tables kept in the header slack travel with it.
                        if slack_delta != 0 && old_slack.contains(&(entry.raw.virtual_address as u64)) {
                            entry.raw.virtual_address =
                                u32::try_from(entry.raw.virtual_address as i64 + slack_delta)
                                    .map_err(|_| Error::out_of_range("directory RVA overflows"))?;
                        }
                    }
                }
                Ok(entry)
            })
            .collect::<Result<Vec<_>>>()?;

        *header.optional.data_directories_mut() = directories.iter().map(|e| e.raw).collect();
        Ok((header, directories))
    }

    /// Patch resource data RVAs when the section holding the table moved.
    fn rebase_resources(&mut self, directories: &[DirectoryEntry]) {
        let (Some(old), Some(new)) = (
            self.directories.get(RESOURCE_SLOT),
            directories.get(RESOURCE_SLOT),
        ) else {
            return;
        };
        let DirectoryLocation::Section { index, offset } = new.location else {
            return;
        };
        if old.raw.virtual_address == new.raw.virtual_address {
            return;
        }
        let (old_base, new_base) = (old.raw.virtual_address, new.raw.virtual_address);

        let Some(section) = self.sections.get_mut(index) else {
            return;
        };
        let offset = offset as usize;
        if offset >= section.contents().len() {
            return;
        }
        if let Err(err) = resource::rebase(&mut section.contents_mut()[offset..], old_base, new_base) {
            log::warn!("resource table not rebased: {err}");
        }
    }

    // ---- DOS and PE headers ----

    pub fn dos_header(&self) -> &DosHeader {
        &self.dos
    }

    /// Mutable DOS header. Stub edits through its setters are tracked.
    pub fn dos_header_mut(&mut self) -> &mut DosHeader {
        self.header_modified = true;
        &mut self.dos
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Mutable header access; marks the header modified.
    ///
    /// Data directory slots are owned by the model and rewritten on
    /// recalculation: use [`set_data_directory`](Self::set_data_directory).
    pub fn header_mut(&mut self) -> &mut Header {
        self.header_modified = true;
        &mut self.header
    }

    /// Replace the header.
    ///
    /// The new header must have the same optional header variant, section
    /// count and directory count as the current one. Directories are
    /// resolved again against the section table.
    pub fn set_header(&mut self, header: Header) -> Result<()> {
        if header.is_pe32() != self.header.is_pe32() {
            return Err(Error::malformed(format!(
                "cannot replace a {:#x} optional header with a {:#x} one",
                self.header.optional.magic(),
                header.optional.magic()
            )));
        }
        if header.coff.number_of_sections as usize != self.sections.len() {
            return Err(Error::out_of_range(format!(
                "header declares {} sections, image has {}",
                header.coff.number_of_sections,
                self.sections.len()
            )));
        }
        if header.data_directories().len() != self.directories.len() {
            return Err(Error::out_of_range(format!(
                "header declares {} data directories, image has {}",
                header.data_directories().len(),
                self.directories.len()
            )));
        }

        let mut directories =
            resolve_directories(header.data_directories(), &section_headers(&self.sections));
        if !self.certificates.is_empty() {
            if let Some(entry) = directories.get_mut(CERTIFICATE_SLOT) {
                entry.location = DirectoryLocation::FileOffset(entry.raw.virtual_address);
            }
        }

        self.header = header;
        self.directories = directories;
        self.header_modified = true;
        Ok(())
    }

    pub fn is_pe32plus(&self) -> bool {
        self.header.optional.is_pe32plus()
    }

    // ---- sections ----

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, index: usize) -> Result<&Section> {
        self.sections
            .get(index)
            .ok_or_else(|| Error::index(index, self.sections.len()))
    }

    /// Mutable access to a section; marks it modified.
    pub fn section_mut(&mut self, index: usize) -> Result<&mut Section> {
        let len = self.sections.len();
        let section = self
            .sections
            .get_mut(index)
            .ok_or_else(|| Error::index(index, len))?;
        section.set_modified();
        Ok(section)
    }

    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name() == name)
    }

    /// Append a section. It is placed on the next recalculation.
    pub fn add_section(&mut self, name: &str, characteristics: u32, contents: Vec<u8>) -> Result<usize> {
        if self.sections.len() >= u16::MAX as usize {
            return Err(Error::out_of_range("section table is full"));
        }
        let section = Section::new(name, characteristics, contents)?;
        self.sections
            .try_reserve(1)
            .map_err(|_| Error::AllocationFailure(std::mem::size_of::<Section>()))?;
        self.sections.push(section);
        self.layout_modified = true;

        log::debug!("added section '{name}' at index {}", self.sections.len() - 1);
        Ok(self.sections.len() - 1)
    }

    /// Remove a section. Directories that pointed into it become empty.
    pub fn remove_section(&mut self, index: usize) -> Result<Section> {
        if index >= self.sections.len() {
            return Err(Error::index(index, self.sections.len()));
        }
        let removed = self.sections.remove(index);

        for (slot, entry) in self.directories.iter_mut().enumerate() {
            if let DirectoryLocation::Section { index: i, offset } = entry.location {
                if i == index {
                    entry.location = DirectoryLocation::Empty;
                    entry.raw = DataDirectory::default();
                    if slot == RESOURCE_SLOT {
                        self.resource_table = None;
                    } else if slot == IMPORT_SLOT {
                        self.import_table = ImportTable::default();
                    }
                } else if i > index {
                    entry.location = DirectoryLocation::Section { index: i - 1, offset };
                }
            }
        }
        self.layout_modified = true;

        log::debug!("removed section {index} '{}'", removed.name());
        Ok(removed)
    }

    // ---- data directories ----

    pub fn data_directories(&self) -> &[DirectoryEntry] {
        &self.directories
    }

    pub fn data_directory(&self, index: usize) -> Result<&DirectoryEntry> {
        self.directories
            .get(index)
            .ok_or_else(|| Error::index(index, self.directories.len()))
    }

    /// Point directory `index` at a new (RVA, size) pair.
    ///
    /// The certificate slot is managed through
    /// [`set_certificates`](Self::set_certificates) instead.
    pub fn set_data_directory(&mut self, index: usize, raw: DataDirectory) -> Result<()> {
        if index >= self.directories.len() {
            return Err(Error::index(index, self.directories.len()));
        }
        if index == CERTIFICATE_SLOT {
            return Err(Error::out_of_range(
                "the certificate directory is derived from the certificate table",
            ));
        }

        let location = if !raw.is_present() {
            DirectoryLocation::Empty
        } else {
            match find_containing_section(&section_headers(&self.sections), raw.virtual_address) {
                Some((index, offset)) => DirectoryLocation::Section { index, offset },
                None => DirectoryLocation::Detached,
            }
        };
        self.directories[index] = DirectoryEntry { raw, location };
        self.header_modified = true;
        Ok(())
    }

    /// Bind a directory slot to a location inside a section.
    pub(crate) fn set_directory_location(&mut self, slot: usize, index: usize, offset: u32, size: u32) -> Result<()> {
        let section = self.section(index)?;
        let virtual_address = section
            .header
            .virtual_address
            .checked_add(offset)
            .ok_or_else(|| Error::out_of_range("directory RVA overflows"))?;
        let len = self.directories.len();
        let entry = self
            .directories
            .get_mut(slot)
            .ok_or_else(|| Error::index(slot, len))?;
        *entry = DirectoryEntry {
            raw: DataDirectory::new(virtual_address, size),
            location: DirectoryLocation::Section { index, offset },
        };
        self.header_modified = true;
        Ok(())
    }

    // ---- certificates ----

    pub fn certificates(&self) -> &CertificateTable {
        &self.certificates
    }

    /// Drop every certificate. The certificate directory is zeroed on the
    /// next recalculation.
    pub fn remove_certificates(&mut self) {
        self.certificates = CertificateTable::default();
        self.header_modified = true;
    }

    /// Replace the certificate table. It is written after the section data
    /// and any overlay that preceded it.
    pub fn set_certificates(&mut self, table: CertificateTable) -> Result<()> {
        let len = self.directories.len();
        let entry = self
            .directories
            .get_mut(CERTIFICATE_SLOT)
            .ok_or_else(|| Error::index(CERTIFICATE_SLOT, len))?;
        entry.location = DirectoryLocation::FileOffset(entry.raw.virtual_address);
        self.certificates = table;
        self.header_modified = true;
        Ok(())
    }

    // ---- resources ----

    pub fn resource_table(&self) -> Option<&ResourceTable> {
        self.resource_table.as_ref()
    }

    /// Mutable resource tree. Call
    /// [`update_resource_table`](Self::update_resource_table) to write
    /// edits back into the section.
    pub fn resource_table_mut(&mut self) -> Option<&mut ResourceTable> {
        self.resource_table.as_mut()
    }

    /// Attach a resource tree to the section the resource directory points
    /// into and serialize it there.
    pub fn set_resource_table(&mut self, table: ResourceTable) -> Result<()> {
        let previous = self.resource_table.replace(table);
        if let Err(err) = self.update_resource_table() {
            self.resource_table = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Re-serialize the resource tree into its section.
    ///
    /// The bytes replace the old table in place; the section grows or
    /// shrinks to fit and other directories later in the same section are
    /// shifted with it.
    pub fn update_resource_table(&mut self) -> Result<()> {
        let entry = *self.data_directory(RESOURCE_SLOT)?;
        let DirectoryLocation::Section { index, offset } = entry.location else {
            return Err(Error::malformed("resource directory does not point into a section"));
        };
        let table = self
            .resource_table
            .as_ref()
            .ok_or_else(|| Error::malformed("image has no resource table"))?;

        let section = self.section(index)?;
        let rva_base = section
            .header
            .virtual_address
            .checked_add(offset)
            .ok_or_else(|| Error::out_of_range("resource table RVA overflows"))?;
        let start = offset as usize;
        let contents_len = section.contents().len();
        if start > contents_len {
            return Err(Error::truncated(start, entry.raw.size as usize, contents_len));
        }
        let old_end = (start + entry.raw.size as usize).min(contents_len);

        let bytes = table.to_bytes(rva_base)?;
        let new_size = u32::try_from(bytes.len())
            .map_err(|_| Error::out_of_range("resource table larger than 4 GiB"))?;
        let new_end = start + bytes.len();

        let mut shifted = Vec::new();
        for (slot, other) in self.directories.iter().enumerate() {
            if let DirectoryLocation::Section { index: i, offset: o } = other.location {
                if slot != RESOURCE_SLOT && i == index && o as usize >= old_end {
                    let moved = u32::try_from(o as usize - old_end + new_end)
                        .map_err(|_| Error::out_of_range("directory offset overflows"))?;
                    shifted.push((slot, moved));
                }
            }
        }

        let section = self.section_mut(index)?;
        if new_end > old_end {
            section.insert_capacity(new_end - old_end, old_end)?;
        } else if new_end < old_end {
            section.excise(new_end, old_end)?;
        }
        section.contents_mut()[start..new_end].copy_from_slice(&bytes);

        for (slot, moved) in shifted {
            self.directories[slot].location = DirectoryLocation::Section { index, offset: moved };
        }
        self.directories[RESOURCE_SLOT].raw = DataDirectory::new(rva_base, new_size);
        self.layout_modified = true;

        log::debug!(
            "resource table rewritten in section {index}: {} -> {} bytes",
            old_end - start,
            bytes.len()
        );
        Ok(())
    }

    // ---- everything else ----

    pub fn import_table(&self) -> &ImportTable {
        &self.import_table
    }

    /// Bytes after the last section that belong to no known structure.
    pub fn overlay(&self) -> &[u8] {
        &self.overlay
    }

    /// Replace the overlay. It is written ahead of any certificate table.
    pub fn set_overlay(&mut self, overlay: Vec<u8>) {
        self.overlay_split = overlay.len();
        self.overlay = overlay;
        self.header_modified = true;
    }

    /// Non-zero bytes kept between the section table and the first section.
    pub fn header_slack(&self) -> &[u8] {
        &self.header_slack
    }

    /// Non-fatal errors recorded while parsing certificates, resources and
    /// imports.
    pub fn diagnostics(&self) -> &[Error] {
        &self.diagnostics
    }

    /// Compute the checksum of the serialized image and store it.
    pub fn update_checksum(&mut self) -> Result<u32> {
        let bytes = self.write_to_vec()?;
        let sum = checksum::compute(&bytes)?;
        self.header.optional.set_check_sum(sum);
        log::debug!("checksum {sum:#010x}");
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{Certificate, CertificateRevision, CertificateType};
    use crate::codec;
    use crate::dos::MzHeader;
    use crate::resource::{ResourceData, ResourceDirectory, ResourceId};
    use crate::section::characteristics;

    const OPT: usize = 0x58;
    const TABLE: usize = OPT + 224;

    /// PE32, one 16-byte `.text` section at 0x1000 / file 0x200, 0x400 bytes.
    fn minimal_pe32() -> Vec<u8> {
        let mut data = vec![0u8; 0x400];
        codec::write_u16(&mut data, 0, 0x5A4D);
        codec::write_u32(&mut data, MzHeader::LFANEW_OFFSET, 0x40);
        data[0x40..0x44].copy_from_slice(b"PE\0\0");

        codec::write_u16(&mut data, 0x44, 0x014C);
        codec::write_u16(&mut data, 0x46, 1);
        codec::write_u16(&mut data, 0x54, 224);
        codec::write_u16(&mut data, 0x56, 0x0102);

        codec::write_u16(&mut data, OPT, 0x10B);
        codec::write_u32(&mut data, OPT + 4, 0x200);
        codec::write_u32(&mut data, OPT + 16, 0x1000);
        codec::write_u32(&mut data, OPT + 20, 0x1000);
        codec::write_u32(&mut data, OPT + 28, 0x40_0000);
        codec::write_u32(&mut data, OPT + 32, 0x1000);
        codec::write_u32(&mut data, OPT + 36, 0x200);
        codec::write_u32(&mut data, OPT + 56, 0x2000);
        codec::write_u32(&mut data, OPT + 60, 0x200);
        codec::write_u16(&mut data, OPT + 68, 3);
        codec::write_u32(&mut data, OPT + 92, 16);

        data[TABLE..TABLE + 5].copy_from_slice(b".text");
        codec::write_u32(&mut data, TABLE + 8, 0x10);
        codec::write_u32(&mut data, TABLE + 12, 0x1000);
        codec::write_u32(&mut data, TABLE + 16, 0x200);
        codec::write_u32(&mut data, TABLE + 20, 0x200);
        codec::write_u32(&mut data, TABLE + 36, 0x6000_0020);

        for (i, b) in data[0x200..0x210].iter_mut().enumerate() {
            *b = 0x90 + i as u8;
        }
        data
    }

    fn set_directory(data: &mut [u8], slot: usize, rva: u32, size: u32) {
        let at = OPT + 96 + slot * 8;
        codec::write_u32(data, at, rva);
        codec::write_u32(data, at + 4, size);
    }

    #[test]
    fn test_parse_minimal() {
        let data = minimal_pe32();
        let image = PeImage::create_from_buffer(&data).unwrap();

        assert_eq!(image.sections().len(), 1);
        assert_eq!(image.section(0).unwrap().name(), ".text");
        assert_eq!(image.section(0).unwrap().contents().len(), 0x10);
        assert!(!image.is_pe32plus());
        assert!(image.overlay().is_empty());
        assert!(image.header_slack().is_empty());
        assert!(image.diagnostics().is_empty());
        assert!(matches!(image.section(1), Err(Error::IndexOutOfRange { index: 1, len: 1 })));
    }

    #[test]
    fn test_unmodified_write_is_identical() {
        let data = minimal_pe32();
        let mut image = PeImage::create_from_buffer(&data).unwrap();
        assert_eq!(image.write_to_buffer(None).unwrap(), data.len());
        assert_eq!(image.write_to_vec().unwrap(), data);
    }

    #[test]
    fn test_forced_recalculation_is_identical() {
        let data = minimal_pe32();
        let mut image = PeImage::create_from_buffer(&data).unwrap();
        image.recalculate_force().unwrap();
        assert_eq!(image.write_to_vec().unwrap(), data);

        // Idempotent.
        image.recalculate_force().unwrap();
        assert_eq!(image.write_to_vec().unwrap(), data);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();
        let mut buf = vec![0u8; 0x100];
        assert!(matches!(
            image.write_to_buffer(Some(&mut buf)),
            Err(Error::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_truncated_section_table() {
        let data = minimal_pe32();
        assert!(matches!(
            PeImage::create_from_buffer(&data[..TABLE + 20]),
            Err(Error::TruncatedInput { .. })
        ));
        assert!(matches!(
            PeImage::create_from_buffer(&data[..0x208]),
            Err(Error::SectionOutOfBounds { index: 0, .. })
        ));
    }

    #[test]
    fn test_overlay_and_slack_preserved() {
        let mut data = minimal_pe32();
        data[TABLE + 40..TABLE + 44].copy_from_slice(b"BND!");
        data.extend_from_slice(b"installer payload");

        let mut image = PeImage::create_from_buffer(&data).unwrap();
        assert_eq!(image.header_slack(), b"BND!");
        assert_eq!(image.overlay(), b"installer payload");
        assert_eq!(image.write_to_vec().unwrap(), data);
    }

    #[test]
    fn test_slack_moves_detached_directory() {
        let mut data = minimal_pe32();
        data[TABLE + 40..TABLE + 48].copy_from_slice(&[7; 8]);
        set_directory(&mut data, 11, (TABLE + 40) as u32, 8);

        let mut image = PeImage::create_from_buffer(&data).unwrap();
        assert_eq!(image.data_directory(11).unwrap().location, DirectoryLocation::Detached);

        image.dos_header_mut().set_message("X").unwrap();
        let out = image.write_to_vec().unwrap();

        let moved = image.data_directory(11).unwrap().raw.virtual_address as usize;
        assert_eq!(moved, TABLE + 40 + 24);
        assert_eq!(&out[moved..moved + 8], &[7; 8]);
    }

    #[test]
    fn test_set_message_moves_headers() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();
        image.dos_header_mut().set_message("X").unwrap();
        image.recalculate().unwrap();
        assert_eq!(image.dos_header().pe_header_offset(), 88);

        let out = image.write_to_vec().unwrap();
        let parsed = PeImage::create_from_buffer(&out).unwrap();
        assert_eq!(parsed.dos_header().pe_header_offset(), 88);
        assert_eq!(parsed.dos_header().message(), Some("X"));
        assert_eq!(parsed.section(0).unwrap().contents()[0], 0x90);
        assert_eq!(parsed.header().optional.size_of_headers(), 0x200);
    }

    #[test]
    fn test_certificates_roundtrip() {
        let mut data = minimal_pe32();
        data.extend_from_slice(b"pre!");
        data.resize(0x408, 0);
        let mut cert = vec![0u8; 16];
        codec::write_u32(&mut cert, 0, 12);
        codec::write_u16(&mut cert, 4, 0x0200);
        codec::write_u16(&mut cert, 6, 0x0002);
        cert[8..12].copy_from_slice(&[1, 2, 3, 4]);
        data.extend_from_slice(&cert);
        set_directory(&mut data, 4, 0x408, 16);

        let mut image = PeImage::create_from_buffer(&data).unwrap();
        assert_eq!(image.certificates().len(), 1);
        assert_eq!(image.certificates().certificates[0].data, vec![1, 2, 3, 4]);
        assert_eq!(&image.overlay()[..4], b"pre!");
        assert_eq!(image.write_to_vec().unwrap(), data);

        image.remove_certificates();
        let out = image.write_to_vec().unwrap();
        assert_eq!(image.data_directory(4).unwrap().raw, DataDirectory::default());
        assert_eq!(out.len(), 0x408);
    }

    #[test]
    fn test_malformed_certificate_is_diagnosed() {
        let mut data = minimal_pe32();
        let mut cert = vec![0u8; 8];
        codec::write_u32(&mut cert, 0, 4);
        data.extend_from_slice(&cert);
        set_directory(&mut data, 4, 0x400, 8);

        let image = PeImage::create_from_buffer(&data).unwrap();
        assert!(image.certificates().is_empty());
        assert!(matches!(
            image.diagnostics()[0],
            Error::MalformedCertificate { length: 4, .. }
        ));
        assert_eq!(image.overlay().len(), 8);
    }

    #[test]
    fn test_set_certificates_places_after_overlay() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();
        image.set_overlay(b"abc".to_vec());
        image
            .set_certificates(CertificateTable {
                certificates: vec![Certificate::new(
                    CertificateRevision::Revision2,
                    CertificateType::PkcsSignedData,
                    vec![5; 8],
                )],
            })
            .unwrap();

        let out = image.write_to_vec().unwrap();
        let dir = image.data_directory(4).unwrap().raw;
        assert_eq!(dir, DataDirectory::new(0x408, 16));
        assert_eq!(&out[0x400..0x403], b"abc");
        assert_eq!(out.len(), 0x418);

        let parsed = PeImage::create_from_buffer(&out).unwrap();
        assert_eq!(parsed.certificates(), image.certificates());
    }

    #[test]
    fn test_add_and_remove_section() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();
        let index = image
            .add_section(".data", characteristics::INITIALIZED_DATA | characteristics::READ, vec![1; 0x300])
            .unwrap();
        assert_eq!(index, 1);
        assert!(image.add_section(".toolongname", 0, Vec::new()).is_err());

        let out = image.write_to_vec().unwrap();
        let data = image.section(1).unwrap();
        assert_eq!(data.header.virtual_address, 0x2000);
        assert_eq!(data.header.pointer_to_raw_data, 0x400);
        assert_eq!(data.header.size_of_raw_data, 0x400);
        assert_eq!(image.header().coff.number_of_sections, 2);
        assert_eq!(image.header().optional.size_of_image(), 0x3000);
        assert_eq!(image.header().optional.size_of_initialized_data(), 0x400);
        assert_eq!(image.header().optional.base_of_data(), Some(0x2000));
        assert_eq!(out.len(), 0x800);

        image
            .set_data_directory(1, DataDirectory::new(0x2010, 0x28))
            .unwrap();
        assert_eq!(
            image.data_directory(1).unwrap().location,
            DirectoryLocation::Section { index: 1, offset: 0x10 }
        );

        image.remove_section(1).unwrap();
        assert_eq!(image.data_directory(1).unwrap().location, DirectoryLocation::Empty);
        let out = image.write_to_vec().unwrap();
        assert_eq!(out.len(), 0x400);
        assert_eq!(image.header().optional.size_of_image(), 0x2000);
        assert!(matches!(image.remove_section(5), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_certificate_directory_not_settable() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();
        assert!(matches!(
            image.set_data_directory(4, DataDirectory::new(0x400, 8)),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            image.set_data_directory(16, DataDirectory::default()),
            Err(Error::IndexOutOfRange { index: 16, len: 16 })
        ));
    }

    #[test]
    fn test_resource_table_update_and_rebase() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();
        let index = image
            .add_section(".rsrc", characteristics::INITIALIZED_DATA | characteristics::READ, Vec::new())
            .unwrap();
        image.recalculate().unwrap();
        image
            .set_directory_location(RESOURCE_SLOT, index, 0, 0)
            .unwrap();

        let mut language = ResourceDirectory::new(ResourceId::Id(1));
        language
            .data_entries
            .push(ResourceData::new(ResourceId::Id(0x409), b"hello".to_vec()));
        let mut table = ResourceTable::default();
        table.root.subdirectories.push(language);
        image.set_resource_table(table.clone()).unwrap();

        let out = image.write_to_vec().unwrap();
        let parsed = PeImage::create_from_buffer(&out).unwrap();
        assert_eq!(parsed.resource_table(), Some(&table));
        assert!(parsed.diagnostics().is_empty());

        // Growing .text pushes .rsrc to a new RVA; its data entries follow.
        let mut image = parsed;
        image.section_mut(0).unwrap().resize(0x1800).unwrap();
        let out = image.write_to_vec().unwrap();
        let parsed = PeImage::create_from_buffer(&out).unwrap();
        assert_eq!(parsed.section(1).unwrap().header.virtual_address, 0x3000);
        assert_eq!(parsed.resource_table(), Some(&table));
        assert!(parsed.diagnostics().is_empty());
    }

    #[test]
    fn test_set_header_validation() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();

        let mut header = image.header().clone();
        header.coff.number_of_sections = 3;
        assert!(matches!(image.set_header(header), Err(Error::OutOfRange(_))));

        let mut header = image.header().clone();
        header.optional.data_directories_mut().truncate(4);
        assert!(image.set_header(header).is_err());

        let mut header = image.header().clone();
        header.coff.time_date_stamp = 0x5EED;
        image.set_header(header).unwrap();
        let out = image.write_to_vec().unwrap();
        assert_eq!(codec::read_u32(&out, 0x48), 0x5EED);
    }

    #[test]
    fn test_update_checksum() {
        let mut image = PeImage::create_from_buffer(&minimal_pe32()).unwrap();
        let sum = image.update_checksum().unwrap();
        let out = image.write_to_vec().unwrap();
        assert_eq!(image.header().optional.check_sum(), sum);
        assert_eq!(checksum::compute(&out).unwrap(), sum);
        assert_eq!(codec::read_u32(&out, OPT + 64), sum);
    }
}
