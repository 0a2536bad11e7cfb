//! Layout arithmetic: alignment, section placement and the derived size fields.

use crate::coff::{page_size, CoffHeader, PE_SIGNATURE_SIZE};
use crate::section::{characteristics, Section, SectionHeader};
use crate::{Error, Result};

/// Smallest file alignment the loader accepts for page-aligned images.
pub const MIN_FILE_ALIGNMENT: u32 = 0x200;

/// Code sections with this name are left out of `size_of_code`.
///
/// Linkers that emit a `.bind` section do not count it, so neither do we.
pub const BIND_SECTION_NAME: &str = ".bind";

/// Align a value up to the given alignment.
///
/// Values that would overflow saturate to the largest aligned `u32`.
#[inline]
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    let aligned = align_up_u64(value as u64, alignment as u64);
    u32::try_from(aligned).unwrap_or(u32::MAX & !(alignment - 1))
}

#[inline]
pub fn align_up_u64(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[inline]
pub fn align_up_usize(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Align a value down to the given alignment.
#[inline]
pub fn align_down(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value - value % alignment
}

/// File and section alignment in effect for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutConfig {
    /// File alignment (typically 0x200).
    pub file_alignment: u32,
    /// Section alignment (typically 0x1000).
    pub section_alignment: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            file_alignment: MIN_FILE_ALIGNMENT,
            section_alignment: 0x1000,
        }
    }
}

impl LayoutConfig {
    /// Build a normalised config from raw header values.
    ///
    /// Zero alignments take their defaults, odd ones round up to a power of
    /// two, and page-aligned images get at least a 512-byte file alignment.
    pub fn new(file_alignment: u32, section_alignment: u32, machine: u16) -> Self {
        let page = page_size(machine);

        let mut file_alignment = match file_alignment {
            0 => MIN_FILE_ALIGNMENT,
            fa => next_power_of_two(fa),
        };
        let mut section_alignment = match section_alignment {
            0 => page,
            sa => next_power_of_two(sa),
        };

        if section_alignment >= page && file_alignment < MIN_FILE_ALIGNMENT {
            file_alignment = MIN_FILE_ALIGNMENT;
        }
        if section_alignment < file_alignment {
            section_alignment = page.max(file_alignment);
        }

        Self {
            file_alignment,
            section_alignment,
        }
    }

    /// Align to file alignment.
    pub fn align_file(&self, value: u32) -> u32 {
        align_up(value, self.file_alignment)
    }

    /// Align to section alignment.
    pub fn align_section(&self, value: u32) -> u32 {
        align_up(value, self.section_alignment)
    }
}

fn next_power_of_two(value: u32) -> u32 {
    value.checked_next_power_of_two().unwrap_or(1 << 31)
}

/// File offset one past the section table.
pub fn section_table_end(pe_offset: u32, optional_size: usize, sections: usize) -> usize {
    pe_offset as usize
        + PE_SIGNATURE_SIZE
        + CoffHeader::SIZE
        + optional_size
        + sections * SectionHeader::SIZE
}

/// Whether a section contributes to `size_of_code`.
pub fn counts_toward_code_size(header: &SectionHeader) -> bool {
    header.is_code() && header.name_str() != BIND_SECTION_NAME
}

/// Assign virtual addresses and file offsets in table order.
///
/// Virtual placement starts at `virtual_start`, physical placement at
/// `physical_start`. Returns the file offset one past the last section's
/// raw data.
pub fn place_sections(
    sections: &mut [Section],
    config: &LayoutConfig,
    virtual_start: u32,
    physical_start: u32,
) -> Result<u64> {
    let mut next_virtual = align_up_u64(virtual_start as u64, config.section_alignment as u64);
    let mut next_physical = align_up_u64(physical_start as u64, config.file_alignment as u64);
    let mut end = next_physical;

    // Placement is computed in full before any header is touched.
    let mut placements = Vec::with_capacity(sections.len());
    for section in sections.iter() {
        let header = &section.header;
        let vs = header.virtual_size;
        let raw = if header.size_of_raw_data > 0 && vs != 0 && vs <= header.size_of_raw_data {
            config.align_file(vs)
        } else {
            config.align_file(header.size_of_raw_data)
        };

        let va = to_u32(next_virtual, "section virtual address")?;
        let span = if vs != 0 { vs } else { raw };
        next_virtual += align_up_u64(span as u64, config.section_alignment as u64);

        let pointer = if raw > 0 {
            let pointer = to_u32(next_physical, "section file offset")?;
            next_physical += raw as u64;
            end = next_physical;
            Some(pointer)
        } else {
            None
        };
        placements.push((va, raw, pointer));
    }
    to_u32(next_virtual, "image size")?;
    to_u32(end, "end of section data")?;

    for (section, (va, raw, pointer)) in sections.iter_mut().zip(placements) {
        let header = &mut section.header;
        header.virtual_address = va;
        header.size_of_raw_data = raw;
        if let Some(pointer) = pointer {
            header.pointer_to_raw_data = pointer;
        }

        log::trace!(
            "placed '{}' at va {:#x} file {:#x} (raw {:#x})",
            header.name_str(),
            header.virtual_address,
            header.pointer_to_raw_data,
            header.size_of_raw_data
        );
    }

    Ok(end)
}

fn to_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::out_of_range(format!("{what} exceeds 4 GiB")))
}

/// Header fields derived from the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionSummary {
    pub base_of_code: Option<u32>,
    pub base_of_data: Option<u32>,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub size_of_image: u32,
}

/// Derive the code/data bases and size totals from already placed sections.
pub fn summarize_sections(
    sections: &[Section],
    config: &LayoutConfig,
    pe32: bool,
    size_of_headers: u32,
) -> SectionSummary {
    let fa = config.file_alignment as u64;
    let mut summary = SectionSummary::default();
    let mut code = 0u64;
    let mut initialized = 0u64;
    let mut uninitialized = 0u64;
    let mut image_end = size_of_headers as u64;

    for section in sections {
        let header = &section.header;
        let vs = header.virtual_size as u64;
        let raw = header.size_of_raw_data as u64;

        if header.is_code() {
            summary.base_of_code.get_or_insert(header.virtual_address);
        } else {
            summary.base_of_data.get_or_insert(header.virtual_address);
        }

        if counts_toward_code_size(header) {
            code += align_up_u64(vs, fa);
        }
        if header.characteristics & characteristics::INITIALIZED_DATA != 0 {
            initialized += if pe32 {
                align_up_u64(vs, fa).max(raw)
            } else {
                align_up_u64(raw, fa)
            };
        }
        if header.characteristics & characteristics::UNINITIALIZED_DATA != 0 {
            uninitialized += align_up_u64(vs, fa);
        }

        let span = if vs != 0 { vs } else { raw };
        image_end = image_end.max(header.virtual_address as u64 + span);
    }

    let clamp = |value: u64| u32::try_from(align_up_u64(value, fa)).unwrap_or(u32::MAX);
    summary.size_of_code = clamp(code);
    summary.size_of_initialized_data = clamp(initialized);
    summary.size_of_uninitialized_data = clamp(uninitialized);
    summary.size_of_image = u32::try_from(align_up_u64(
        image_end,
        config.section_alignment as u64,
    ))
    .unwrap_or(u32::MAX);

    summary
}
