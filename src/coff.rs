//! COFF file header.

use crate::codec;
use crate::reader::{checked_end, Reader};
use crate::{Error, Result};

/// PE signature "PE\0\0".
pub const PE_SIGNATURE: u32 = 0x00004550;

/// Size of the PE signature.
pub const PE_SIGNATURE_SIZE: usize = 4;

/// Machine type constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[non_exhaustive]
pub enum MachineType {
    /// Unknown machine type.
    Unknown = 0x0000,
    /// Intel 386 or later.
    I386 = 0x014C,
    /// x64 (AMD64).
    Amd64 = 0x8664,
    /// ARM little endian.
    Arm = 0x01C0,
    /// ARM64 little endian.
    Arm64 = 0xAA64,
    /// ARM Thumb-2 little endian.
    ArmNt = 0x01C4,
    /// EFI byte code.
    Ebc = 0x0EBC,
    /// Intel Itanium.
    Ia64 = 0x0200,
    /// RISC-V 32-bit.
    RiscV32 = 0x5032,
    /// RISC-V 64-bit.
    RiscV64 = 0x5064,
}

impl MachineType {
    /// Convert from raw u16 value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Unknown),
            0x014C => Some(Self::I386),
            0x8664 => Some(Self::Amd64),
            0x01C0 => Some(Self::Arm),
            0xAA64 => Some(Self::Arm64),
            0x01C4 => Some(Self::ArmNt),
            0x0EBC => Some(Self::Ebc),
            0x0200 => Some(Self::Ia64),
            0x5032 => Some(Self::RiscV32),
            0x5064 => Some(Self::RiscV64),
            _ => None,
        }
    }
}

/// Native page size for a raw machine value.
///
/// Used as the default section alignment.
pub fn page_size(machine: u16) -> u32 {
    match MachineType::from_u16(machine) {
        Some(MachineType::Ia64) => 0x2000,
        _ => 0x1000,
    }
}

/// Characteristics flags for the COFF header.
pub mod characteristics {
    /// Relocation info stripped from file.
    pub const RELOCS_STRIPPED: u16 = 0x0001;
    /// File is executable.
    pub const EXECUTABLE_IMAGE: u16 = 0x0002;
    /// Line numbers stripped from file.
    pub const LINE_NUMS_STRIPPED: u16 = 0x0004;
    /// Local symbols stripped from file.
    pub const LOCAL_SYMS_STRIPPED: u16 = 0x0008;
    /// Aggressively trim working set.
    pub const AGGRESSIVE_WS_TRIM: u16 = 0x0010;
    /// App can handle >2GB addresses.
    pub const LARGE_ADDRESS_AWARE: u16 = 0x0020;
    /// Bytes of machine word are reversed (obsolete).
    pub const BYTES_REVERSED_LO: u16 = 0x0080;
    /// 32-bit word machine.
    pub const MACHINE_32BIT: u16 = 0x0100;
    /// Debugging info stripped from file.
    pub const DEBUG_STRIPPED: u16 = 0x0200;
    /// Copy to swap file if on removable media.
    pub const REMOVABLE_RUN_FROM_SWAP: u16 = 0x0400;
    /// Copy to swap file if on network media.
    pub const NET_RUN_FROM_SWAP: u16 = 0x0800;
    /// File is a system file.
    pub const SYSTEM: u16 = 0x1000;
    /// File is a DLL.
    pub const DLL: u16 = 0x2000;
    /// File should only be run on a uniprocessor machine.
    pub const UP_SYSTEM_ONLY: u16 = 0x4000;
    /// Bytes of machine word are reversed (obsolete).
    pub const BYTES_REVERSED_HI: u16 = 0x8000;
}

/// COFF File Header (IMAGE_FILE_HEADER).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoffHeader {
    /// Target machine type.
    pub machine: u16,
    /// Number of sections.
    pub number_of_sections: u16,
    /// Timestamp (seconds since epoch).
    pub time_date_stamp: u32,
    /// File offset of COFF symbol table.
    pub pointer_to_symbol_table: u32,
    /// Number of entries in symbol table.
    pub number_of_symbols: u32,
    /// Size of optional header.
    pub size_of_optional_header: u16,
    /// Characteristics flags.
    pub characteristics: u16,
}

impl CoffHeader {
    /// Size of the COFF header in bytes.
    pub const SIZE: usize = 20;

    /// Parse a COFF header at `offset` in `data`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let d = data.slice_at(offset, Self::SIZE)?;

        Ok(Self {
            machine: codec::read_u16(d, 0),
            number_of_sections: codec::read_u16(d, 2),
            time_date_stamp: codec::read_u32(d, 4),
            pointer_to_symbol_table: codec::read_u32(d, 8),
            number_of_symbols: codec::read_u32(d, 12),
            size_of_optional_header: codec::read_u16(d, 16),
            characteristics: codec::read_u16(d, 18),
        })
    }

    /// Write the COFF header at `offset` in `buf`.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        checked_end(offset, Self::SIZE, buf.len())?;

        codec::write_u16(buf, offset, self.machine);
        codec::write_u16(buf, offset + 2, self.number_of_sections);
        codec::write_u32(buf, offset + 4, self.time_date_stamp);
        codec::write_u32(buf, offset + 8, self.pointer_to_symbol_table);
        codec::write_u32(buf, offset + 12, self.number_of_symbols);
        codec::write_u16(buf, offset + 16, self.size_of_optional_header);
        codec::write_u16(buf, offset + 18, self.characteristics);

        Ok(())
    }

    /// Get the machine type as an enum.
    pub fn machine_type(&self) -> Option<MachineType> {
        MachineType::from_u16(self.machine)
    }

    /// Check if the file is a DLL.
    pub fn is_dll(&self) -> bool {
        self.characteristics & characteristics::DLL != 0
    }

    /// Check if the file is executable.
    pub fn is_executable(&self) -> bool {
        self.characteristics & characteristics::EXECUTABLE_IMAGE != 0
    }
}

/// Verify the PE signature at the given offset.
pub fn verify_pe_signature(data: &[u8], offset: usize) -> Result<()> {
    let sig = data.read_u32_at(offset)?;
    if sig != PE_SIGNATURE {
        return Err(Error::InvalidPeSignature);
    }
    Ok(())
}
