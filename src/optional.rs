//! Optional header (PE32 and PE32+ variants) and its data directory array.

use crate::codec;
use crate::data_dir::DataDirectory;
use crate::reader::{checked_end, Reader};
use crate::{Error, Result};

/// PE32 magic number.
pub const PE32_MAGIC: u16 = 0x10B;
/// PE32+ (64-bit) magic number.
pub const PE32PLUS_MAGIC: u16 = 0x20B;

/// Windows subsystem values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Subsystem {
    Unknown = 0,
    Native = 1,
    WindowsGui = 2,
    WindowsCui = 3,
    Os2Cui = 5,
    PosixCui = 7,
    NativeWindows = 8,
    WindowsCeGui = 9,
    EfiApplication = 10,
    EfiBootServiceDriver = 11,
    EfiRuntimeDriver = 12,
    EfiRom = 13,
    Xbox = 14,
    WindowsBootApplication = 16,
}

impl Subsystem {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Native),
            2 => Some(Self::WindowsGui),
            3 => Some(Self::WindowsCui),
            5 => Some(Self::Os2Cui),
            7 => Some(Self::PosixCui),
            8 => Some(Self::NativeWindows),
            9 => Some(Self::WindowsCeGui),
            10 => Some(Self::EfiApplication),
            11 => Some(Self::EfiBootServiceDriver),
            12 => Some(Self::EfiRuntimeDriver),
            13 => Some(Self::EfiRom),
            14 => Some(Self::Xbox),
            16 => Some(Self::WindowsBootApplication),
            _ => None,
        }
    }
}

/// DLL characteristics flags.
pub mod dll_characteristics {
    pub const HIGH_ENTROPY_VA: u16 = 0x0020;
    pub const DYNAMIC_BASE: u16 = 0x0040;
    pub const FORCE_INTEGRITY: u16 = 0x0080;
    pub const NX_COMPAT: u16 = 0x0100;
    pub const NO_ISOLATION: u16 = 0x0200;
    pub const NO_SEH: u16 = 0x0400;
    pub const NO_BIND: u16 = 0x0800;
    pub const APPCONTAINER: u16 = 0x1000;
    pub const WDM_DRIVER: u16 = 0x2000;
    pub const GUARD_CF: u16 = 0x4000;
    pub const TERMINAL_SERVER_AWARE: u16 = 0x8000;
}

/// PE32 Optional Header (32-bit).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptionalHeader32 {
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    /// Data directory array; its length is `number_of_rva_and_sizes`.
    pub data_directories: Vec<DataDirectory>,
}

/// PE32+ Optional Header (64-bit).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptionalHeader64 {
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    /// Data directory array; its length is `number_of_rva_and_sizes`.
    pub data_directories: Vec<DataDirectory>,
}

/// Optional header, tagged by magic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionalHeader {
    Pe32(OptionalHeader32),
    Pe32Plus(OptionalHeader64),
}

/// Read the untrusted directory count and the directories that follow `base`.
fn parse_directories(data: &[u8], offset: usize, base: usize) -> Result<Vec<DataDirectory>> {
    let count = data.read_u32_at(offset + base - 4)? as usize;
    let bytes = count
        .checked_mul(DataDirectory::SIZE)
        .ok_or_else(|| Error::out_of_range(format!("directory count {count} overflows")))?;
    let start = offset + base;
    checked_end(start, bytes, data.len())?;

    let mut dirs = Vec::new();
    dirs.try_reserve_exact(count)
        .map_err(|_| Error::AllocationFailure(bytes))?;
    for i in 0..count {
        dirs.push(DataDirectory::parse(data, start + i * DataDirectory::SIZE)?);
    }
    Ok(dirs)
}

fn write_directories(dirs: &[DataDirectory], buf: &mut [u8], start: usize) -> Result<()> {
    for (i, dir) in dirs.iter().enumerate() {
        dir.write(buf, start + i * DataDirectory::SIZE)?;
    }
    Ok(())
}

impl OptionalHeader32 {
    pub const BASE_SIZE: usize = 96;

    /// Parse from `data` at `offset` (pointing at the magic).
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::BASE_SIZE)?;
        let data_directories = parse_directories(data, offset, Self::BASE_SIZE)?;

        Ok(Self {
            major_linker_version: d[2],
            minor_linker_version: d[3],
            size_of_code: codec::read_u32(d, 4),
            size_of_initialized_data: codec::read_u32(d, 8),
            size_of_uninitialized_data: codec::read_u32(d, 12),
            address_of_entry_point: codec::read_u32(d, 16),
            base_of_code: codec::read_u32(d, 20),
            base_of_data: codec::read_u32(d, 24),
            image_base: codec::read_u32(d, 28),
            section_alignment: codec::read_u32(d, 32),
            file_alignment: codec::read_u32(d, 36),
            major_operating_system_version: codec::read_u16(d, 40),
            minor_operating_system_version: codec::read_u16(d, 42),
            major_image_version: codec::read_u16(d, 44),
            minor_image_version: codec::read_u16(d, 46),
            major_subsystem_version: codec::read_u16(d, 48),
            minor_subsystem_version: codec::read_u16(d, 50),
            win32_version_value: codec::read_u32(d, 52),
            size_of_image: codec::read_u32(d, 56),
            size_of_headers: codec::read_u32(d, 60),
            check_sum: codec::read_u32(d, 64),
            subsystem: codec::read_u16(d, 68),
            dll_characteristics: codec::read_u16(d, 70),
            size_of_stack_reserve: codec::read_u32(d, 72),
            size_of_stack_commit: codec::read_u32(d, 76),
            size_of_heap_reserve: codec::read_u32(d, 80),
            size_of_heap_commit: codec::read_u32(d, 84),
            loader_flags: codec::read_u32(d, 88),
            data_directories,
        })
    }

    pub fn size(&self) -> usize {
        Self::BASE_SIZE + self.data_directories.len() * DataDirectory::SIZE
    }

    /// Write the PE32 optional header at `offset`.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        checked_end(offset, self.size(), buf.len())?;
        let b = &mut buf[offset..];

        codec::write_u16(b, 0, PE32_MAGIC);
        b[2] = self.major_linker_version;
        b[3] = self.minor_linker_version;
        codec::write_u32(b, 4, self.size_of_code);
        codec::write_u32(b, 8, self.size_of_initialized_data);
        codec::write_u32(b, 12, self.size_of_uninitialized_data);
        codec::write_u32(b, 16, self.address_of_entry_point);
        codec::write_u32(b, 20, self.base_of_code);
        codec::write_u32(b, 24, self.base_of_data);
        codec::write_u32(b, 28, self.image_base);
        codec::write_u32(b, 32, self.section_alignment);
        codec::write_u32(b, 36, self.file_alignment);
        codec::write_u16(b, 40, self.major_operating_system_version);
        codec::write_u16(b, 42, self.minor_operating_system_version);
        codec::write_u16(b, 44, self.major_image_version);
        codec::write_u16(b, 46, self.minor_image_version);
        codec::write_u16(b, 48, self.major_subsystem_version);
        codec::write_u16(b, 50, self.minor_subsystem_version);
        codec::write_u32(b, 52, self.win32_version_value);
        codec::write_u32(b, 56, self.size_of_image);
        codec::write_u32(b, 60, self.size_of_headers);
        codec::write_u32(b, 64, self.check_sum);
        codec::write_u16(b, 68, self.subsystem);
        codec::write_u16(b, 70, self.dll_characteristics);
        codec::write_u32(b, 72, self.size_of_stack_reserve);
        codec::write_u32(b, 76, self.size_of_stack_commit);
        codec::write_u32(b, 80, self.size_of_heap_reserve);
        codec::write_u32(b, 84, self.size_of_heap_commit);
        codec::write_u32(b, 88, self.loader_flags);
        codec::write_u32(b, 92, self.data_directories.len() as u32);

        write_directories(&self.data_directories, buf, offset + Self::BASE_SIZE)
    }
}

impl OptionalHeader64 {
    pub const BASE_SIZE: usize = 112;

    /// Parse from `data` at `offset` (pointing at the magic).
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::BASE_SIZE)?;
        let data_directories = parse_directories(data, offset, Self::BASE_SIZE)?;

        Ok(Self {
            major_linker_version: d[2],
            minor_linker_version: d[3],
            size_of_code: codec::read_u32(d, 4),
            size_of_initialized_data: codec::read_u32(d, 8),
            size_of_uninitialized_data: codec::read_u32(d, 12),
            address_of_entry_point: codec::read_u32(d, 16),
            base_of_code: codec::read_u32(d, 20),
            image_base: codec::read_u64(d, 24),
            section_alignment: codec::read_u32(d, 32),
            file_alignment: codec::read_u32(d, 36),
            major_operating_system_version: codec::read_u16(d, 40),
            minor_operating_system_version: codec::read_u16(d, 42),
            major_image_version: codec::read_u16(d, 44),
            minor_image_version: codec::read_u16(d, 46),
            major_subsystem_version: codec::read_u16(d, 48),
            minor_subsystem_version: codec::read_u16(d, 50),
            win32_version_value: codec::read_u32(d, 52),
            size_of_image: codec::read_u32(d, 56),
            size_of_headers: codec::read_u32(d, 60),
            check_sum: codec::read_u32(d, 64),
            subsystem: codec::read_u16(d, 68),
            dll_characteristics: codec::read_u16(d, 70),
            size_of_stack_reserve: codec::read_u64(d, 72),
            size_of_stack_commit: codec::read_u64(d, 80),
            size_of_heap_reserve: codec::read_u64(d, 88),
            size_of_heap_commit: codec::read_u64(d, 96),
            loader_flags: codec::read_u32(d, 104),
            data_directories,
        })
    }

    pub fn size(&self) -> usize {
        Self::BASE_SIZE + self.data_directories.len() * DataDirectory::SIZE
    }

    /// Write the PE32+ optional header at `offset`.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        checked_end(offset, self.size(), buf.len())?;
        let b = &mut buf[offset..];

        codec::write_u16(b, 0, PE32PLUS_MAGIC);
        b[2] = self.major_linker_version;
        b[3] = self.minor_linker_version;
        codec::write_u32(b, 4, self.size_of_code);
        codec::write_u32(b, 8, self.size_of_initialized_data);
        codec::write_u32(b, 12, self.size_of_uninitialized_data);
        codec::write_u32(b, 16, self.address_of_entry_point);
        codec::write_u32(b, 20, self.base_of_code);
        codec::write_u64(b, 24, self.image_base);
        codec::write_u32(b, 32, self.section_alignment);
        codec::write_u32(b, 36, self.file_alignment);
        codec::write_u16(b, 40, self.major_operating_system_version);
        codec::write_u16(b, 42, self.minor_operating_system_version);
        codec::write_u16(b, 44, self.major_image_version);
        codec::write_u16(b, 46, self.minor_image_version);
        codec::write_u16(b, 48, self.major_subsystem_version);
        codec::write_u16(b, 50, self.minor_subsystem_version);
        codec::write_u32(b, 52, self.win32_version_value);
        codec::write_u32(b, 56, self.size_of_image);
        codec::write_u32(b, 60, self.size_of_headers);
        codec::write_u32(b, 64, self.check_sum);
        codec::write_u16(b, 68, self.subsystem);
        codec::write_u16(b, 70, self.dll_characteristics);
        codec::write_u64(b, 72, self.size_of_stack_reserve);
        codec::write_u64(b, 80, self.size_of_stack_commit);
        codec::write_u64(b, 88, self.size_of_heap_reserve);
        codec::write_u64(b, 96, self.size_of_heap_commit);
        codec::write_u32(b, 104, self.loader_flags);
        codec::write_u32(b, 108, self.data_directories.len() as u32);

        write_directories(&self.data_directories, buf, offset + Self::BASE_SIZE)
    }
}

/// Generate a getter/setter pair for a field both variants share.
macro_rules! shared_field {
    ($get:ident, $set:ident, $ty:ty) => {
        pub fn $get(&self) -> $ty {
            match self {
                Self::Pe32(h) => h.$get,
                Self::Pe32Plus(h) => h.$get,
            }
        }

        pub fn $set(&mut self, value: $ty) {
            match self {
                Self::Pe32(h) => h.$get = value,
                Self::Pe32Plus(h) => h.$get = value,
            }
        }
    };
}

impl OptionalHeader {
    /// Parse the optional header at `offset`, dispatching on its magic.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let magic = data.read_u16_at(offset)?;
        match magic {
            PE32_MAGIC => Ok(Self::Pe32(OptionalHeader32::parse(data, offset)?)),
            PE32PLUS_MAGIC => Ok(Self::Pe32Plus(OptionalHeader64::parse(data, offset)?)),
            _ => Err(Error::UnknownMagic(magic)),
        }
    }

    /// The on-disk magic implied by the variant.
    pub fn magic(&self) -> u16 {
        match self {
            Self::Pe32(_) => PE32_MAGIC,
            Self::Pe32Plus(_) => PE32PLUS_MAGIC,
        }
    }

    pub fn is_pe32(&self) -> bool {
        matches!(self, Self::Pe32(_))
    }

    pub fn is_pe32plus(&self) -> bool {
        matches!(self, Self::Pe32Plus(_))
    }

    /// Serialized size: base layout plus the directory array.
    pub fn size(&self) -> usize {
        match self {
            Self::Pe32(h) => h.size(),
            Self::Pe32Plus(h) => h.size(),
        }
    }

    /// Write the optional header at `offset`.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        match self {
            Self::Pe32(h) => h.write(buf, offset),
            Self::Pe32Plus(h) => h.write(buf, offset),
        }
    }

    pub fn data_directories(&self) -> &[DataDirectory] {
        match self {
            Self::Pe32(h) => &h.data_directories,
            Self::Pe32Plus(h) => &h.data_directories,
        }
    }

    pub fn data_directories_mut(&mut self) -> &mut Vec<DataDirectory> {
        match self {
            Self::Pe32(h) => &mut h.data_directories,
            Self::Pe32Plus(h) => &mut h.data_directories,
        }
    }

    pub fn number_of_rva_and_sizes(&self) -> u32 {
        self.data_directories().len() as u32
    }

    /// Get the image base address.
    pub fn image_base(&self) -> u64 {
        match self {
            Self::Pe32(h) => h.image_base as u64,
            Self::Pe32Plus(h) => h.image_base,
        }
    }

    /// Base of data; PE32+ has no such field.
    pub fn base_of_data(&self) -> Option<u32> {
        match self {
            Self::Pe32(h) => Some(h.base_of_data),
            Self::Pe32Plus(_) => None,
        }
    }

    pub fn set_base_of_data(&mut self, value: u32) {
        if let Self::Pe32(h) = self {
            h.base_of_data = value;
        }
    }

    shared_field!(size_of_code, set_size_of_code, u32);
    shared_field!(size_of_initialized_data, set_size_of_initialized_data, u32);
    shared_field!(size_of_uninitialized_data, set_size_of_uninitialized_data, u32);
    shared_field!(address_of_entry_point, set_address_of_entry_point, u32);
    shared_field!(base_of_code, set_base_of_code, u32);
    shared_field!(section_alignment, set_section_alignment, u32);
    shared_field!(file_alignment, set_file_alignment, u32);
    shared_field!(size_of_image, set_size_of_image, u32);
    shared_field!(size_of_headers, set_size_of_headers, u32);
    shared_field!(check_sum, set_check_sum, u32);
    shared_field!(subsystem, set_subsystem, u16);
    shared_field!(dll_characteristics, set_dll_characteristics, u16);
}
