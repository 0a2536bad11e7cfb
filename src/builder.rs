//! Builder for creating new images from scratch.
//!
//! # Example
//!
//! ```
//! use peforge::{ImageBuilder, MachineType, Subsystem};
//! use peforge::section::characteristics;
//!
//! let code = vec![0xCC; 0x100]; // INT3 instructions
//! let data = vec![0u8; 0x50];
//!
//! let mut image = ImageBuilder::new()
//!     .machine(MachineType::Amd64)
//!     .subsystem(Subsystem::WindowsCui)
//!     .entry_point(0x1000)
//!     .add_section(".text", code, characteristics::CODE | characteristics::EXECUTE | characteristics::READ)
//!     .add_section(".data", data, characteristics::INITIALIZED_DATA | characteristics::READ | characteristics::WRITE)
//!     .build()?;
//!
//! assert!(image.is_pe32plus());
//! assert_eq!(image.section(1)?.header.virtual_address, 0x2000);
//! let bytes = image.write_to_vec()?;
//! assert_eq!(bytes.len(), 0x600);
//! # Ok::<(), peforge::Error>(())
//! ```

use crate::coff::{characteristics as coff_flags, CoffHeader, MachineType};
use crate::data_dir::{DataDirectory, DataDirectoryType, NUMBER_OF_DIRECTORY_ENTRIES};
use crate::dos::DosHeader;
use crate::header::Header;
use crate::optional::{dll_characteristics, OptionalHeader, OptionalHeader32, OptionalHeader64, Subsystem};
use crate::pe::PeImage;
use crate::resource::ResourceTable;
use crate::section::{characteristics, Section};
use crate::Result;

/// Builder for creating new images from scratch.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    machine: MachineType,
    subsystem: Subsystem,
    pe32plus: bool,
    image_base: u64,
    entry_point: u32,
    file_alignment: u32,
    section_alignment: u32,
    dll_characteristics: u16,
    is_dll: bool,
    sections: Vec<(String, Vec<u8>, u32)>, // (name, data, characteristics)
    resources: Option<ResourceTable>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// A 64-bit console application with no sections.
    pub fn new() -> Self {
        Self {
            machine: MachineType::Amd64,
            subsystem: Subsystem::WindowsCui,
            pe32plus: true,
            image_base: 0x0000_0001_4000_0000,
            entry_point: 0,
            file_alignment: 0x200,
            section_alignment: 0x1000,
            dll_characteristics: dll_characteristics::DYNAMIC_BASE
                | dll_characteristics::NX_COMPAT
                | dll_characteristics::TERMINAL_SERVER_AWARE
                | dll_characteristics::HIGH_ENTROPY_VA,
            is_dll: false,
            sections: Vec::new(),
            resources: None,
        }
    }

    /// Set the target machine. PE32+ and the default image base follow it.
    pub fn machine(mut self, machine: MachineType) -> Self {
        self.machine = machine;
        self.pe32plus = matches!(
            machine,
            MachineType::Amd64 | MachineType::Arm64 | MachineType::Ia64 | MachineType::RiscV64
        );
        if !self.pe32plus {
            self.image_base = 0x0040_0000;
            self.dll_characteristics &= !dll_characteristics::HIGH_ENTROPY_VA;
        }
        self
    }

    pub fn subsystem(mut self, subsystem: Subsystem) -> Self {
        self.subsystem = subsystem;
        self
    }

    /// Force the optional header variant. Usually implied by the machine.
    pub fn pe32plus(mut self, pe32plus: bool) -> Self {
        self.pe32plus = pe32plus;
        self
    }

    pub fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    /// Set the entry point RVA.
    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    /// Set the file alignment (default: 0x200).
    pub fn file_alignment(mut self, alignment: u32) -> Self {
        self.file_alignment = alignment;
        self
    }

    /// Set the section alignment (default: 0x1000).
    pub fn section_alignment(mut self, alignment: u32) -> Self {
        self.section_alignment = alignment;
        self
    }

    pub fn dll_characteristics(mut self, flags: u16) -> Self {
        self.dll_characteristics = flags;
        self
    }

    /// Mark this as a DLL instead of an executable.
    pub fn is_dll(mut self, is_dll: bool) -> Self {
        self.is_dll = is_dll;
        self
    }

    /// Append a section with the given name, data, and characteristics.
    pub fn add_section(mut self, name: &str, data: Vec<u8>, characteristics: u32) -> Self {
        self.sections.push((name.to_string(), data, characteristics));
        self
    }

    /// Store `table` in a trailing `.rsrc` section.
    pub fn resources(mut self, table: ResourceTable) -> Self {
        self.resources = Some(table);
        self
    }

    /// Lay out the image.
    ///
    /// Fails if a section name is longer than 8 bytes or the layout does
    /// not fit the header fields.
    pub fn build(self) -> Result<PeImage> {
        let mut sections = Vec::with_capacity(self.sections.len() + 1);
        for (name, data, characteristics) in &self.sections {
            sections.push(Section::new(name, *characteristics, data.clone())?);
        }

        let mut image = PeImage::from_parts(DosHeader::default(), self.header(sections.len()), sections);

        if let Some(table) = self.resources {
            let index = image.add_section(
                ".rsrc",
                characteristics::INITIALIZED_DATA | characteristics::READ,
                Vec::new(),
            )?;
            image.recalculate_force()?;
            image.set_directory_location(DataDirectoryType::Resource.as_index(), index, 0, 0)?;
            image.set_resource_table(table)?;
        }

        image.recalculate_force()?;
        log::debug!(
            "built {} image with {} sections",
            if image.is_pe32plus() { "PE32+" } else { "PE32" },
            image.sections().len()
        );
        Ok(image)
    }

    fn header(&self, section_count: usize) -> Header {
        let mut flags = coff_flags::EXECUTABLE_IMAGE;
        if self.pe32plus {
            flags |= coff_flags::LARGE_ADDRESS_AWARE;
        } else {
            flags |= coff_flags::MACHINE_32BIT;
        }
        if self.is_dll {
            flags |= coff_flags::DLL;
        }

        let optional = self.optional_header();
        let coff = CoffHeader {
            machine: self.machine as u16,
            number_of_sections: section_count as u16,
            size_of_optional_header: optional.size() as u16,
            characteristics: flags,
            ..Default::default()
        };
        Header { coff, optional }
    }

    fn optional_header(&self) -> OptionalHeader {
        let data_directories = vec![DataDirectory::default(); NUMBER_OF_DIRECTORY_ENTRIES];

        if self.pe32plus {
            OptionalHeader::Pe32Plus(OptionalHeader64 {
                major_linker_version: 14,
                address_of_entry_point: self.entry_point,
                image_base: self.image_base,
                section_alignment: self.section_alignment,
                file_alignment: self.file_alignment,
                major_operating_system_version: 6,
                major_subsystem_version: 6,
                subsystem: self.subsystem as u16,
                dll_characteristics: self.dll_characteristics,
                size_of_stack_reserve: 0x100000,
                size_of_stack_commit: 0x1000,
                size_of_heap_reserve: 0x100000,
                size_of_heap_commit: 0x1000,
                data_directories,
                ..Default::default()
            })
        } else {
            OptionalHeader::Pe32(OptionalHeader32 {
                major_linker_version: 14,
                address_of_entry_point: self.entry_point,
                image_base: self.image_base as u32,
                section_alignment: self.section_alignment,
                file_alignment: self.file_alignment,
                major_operating_system_version: 6,
                major_subsystem_version: 6,
                subsystem: self.subsystem as u16,
                dll_characteristics: self.dll_characteristics,
                size_of_stack_reserve: 0x100000,
                size_of_stack_commit: 0x1000,
                size_of_heap_reserve: 0x100000,
                size_of_heap_commit: 0x1000,
                data_directories,
                ..Default::default()
            })
        }
    }
}
