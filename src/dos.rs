//! DOS header, DOS stub and the metadata embedded in it.

use crate::codec;
use crate::error::try_copy;
use crate::layout::align_up_usize;
use crate::reader::{checked_end, Reader};
use crate::rich::RichTable;
use crate::vlv::VlvSignature;
use crate::{Error, Result};

/// DOS "MZ" signature.
pub const DOS_SIGNATURE: u16 = 0x5A4D;

/// Real-mode stub code that prints the message at DS:0x0E and exits.
pub const REALMODE_STUB: [u8; 14] = [
    0x0e, // push cs
    0x1f, // pop ds
    0xba, 0x0e, 0x00, // mov dx, 0x0e
    0xb4, 0x09, // mov ah, 0x09
    0xcd, 0x21, // int 0x21
    0xb8, 0x01, 0x4c, // mov ax, 0x4c01
    0xcd, 0x21, // int 0x21
];

/// CR CR LF '$' terminator appended to generated messages.
pub const MESSAGE_TERMINATOR: [u8; 4] = [0x0d, 0x0d, 0x0a, b'$'];

/// Message used when a stub is regenerated without one.
pub const DEFAULT_MESSAGE: &str = "This program cannot be run in DOS mode.";

/// Longest accepted DOS message.
pub const MAX_MESSAGE_LEN: usize = i16::MAX as usize;

/// Fixed MZ header fields (IMAGE_DOS_HEADER).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MzHeader {
    /// Magic number ("MZ" = 0x5A4D).
    pub e_magic: u16,
    /// Bytes on last page of file.
    pub e_cblp: u16,
    /// Pages in file.
    pub e_cp: u16,
    /// Relocations.
    pub e_crlc: u16,
    /// Size of header in paragraphs.
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    /// File address of relocation table.
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    /// File offset of the PE signature.
    pub e_lfanew: u32,
}

impl Default for MzHeader {
    fn default() -> Self {
        Self {
            e_magic: DOS_SIGNATURE,
            e_cblp: 0x90,
            e_cp: 0x03,
            e_crlc: 0,
            e_cparhdr: 0x04,
            e_minalloc: 0,
            e_maxalloc: 0xFFFF,
            e_ss: 0,
            e_sp: 0xB8,
            e_csum: 0,
            e_ip: 0,
            e_cs: 0,
            e_lfarlc: 0x40,
            e_ovno: 0,
            e_res: [0; 4],
            e_oemid: 0,
            e_oeminfo: 0,
            e_res2: [0; 10],
            e_lfanew: MzHeader::SIZE as u32,
        }
    }
}

impl MzHeader {
    /// Size of the MZ header in bytes.
    pub const SIZE: usize = 64;

    /// Offset of `e_lfanew`.
    pub const LFANEW_OFFSET: usize = 0x3C;

    /// Parse the MZ header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        checked_end(0, Self::SIZE, data.len())?;

        let e_magic = codec::read_u16(data, 0);
        if e_magic != DOS_SIGNATURE {
            return Err(Error::InvalidDosSignature);
        }

        let word = |i: usize| codec::read_u16(data, i);
        let mut e_res = [0u16; 4];
        for (i, v) in e_res.iter_mut().enumerate() {
            *v = word(28 + i * 2);
        }
        let mut e_res2 = [0u16; 10];
        for (i, v) in e_res2.iter_mut().enumerate() {
            *v = word(40 + i * 2);
        }

        Ok(Self {
            e_magic,
            e_cblp: word(2),
            e_cp: word(4),
            e_crlc: word(6),
            e_cparhdr: word(8),
            e_minalloc: word(10),
            e_maxalloc: word(12),
            e_ss: word(14),
            e_sp: word(16),
            e_csum: word(18),
            e_ip: word(20),
            e_cs: word(22),
            e_lfarlc: word(24),
            e_ovno: word(26),
            e_res,
            e_oemid: word(36),
            e_oeminfo: word(38),
            e_res2,
            e_lfanew: codec::read_u32(data, Self::LFANEW_OFFSET),
        })
    }

    /// Write the MZ header to the start of `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        checked_end(0, Self::SIZE, buf.len())?;

        codec::write_u16(buf, 0, self.e_magic);
        codec::write_u16(buf, 2, self.e_cblp);
        codec::write_u16(buf, 4, self.e_cp);
        codec::write_u16(buf, 6, self.e_crlc);
        codec::write_u16(buf, 8, self.e_cparhdr);
        codec::write_u16(buf, 10, self.e_minalloc);
        codec::write_u16(buf, 12, self.e_maxalloc);
        codec::write_u16(buf, 14, self.e_ss);
        codec::write_u16(buf, 16, self.e_sp);
        codec::write_u16(buf, 18, self.e_csum);
        codec::write_u16(buf, 20, self.e_ip);
        codec::write_u16(buf, 22, self.e_cs);
        codec::write_u16(buf, 24, self.e_lfarlc);
        codec::write_u16(buf, 26, self.e_ovno);
        for (i, val) in self.e_res.iter().enumerate() {
            codec::write_u16(buf, 28 + i * 2, *val);
        }
        codec::write_u16(buf, 36, self.e_oemid);
        codec::write_u16(buf, 38, self.e_oeminfo);
        for (i, val) in self.e_res2.iter().enumerate() {
            codec::write_u16(buf, 40 + i * 2, *val);
        }
        codec::write_u32(buf, Self::LFANEW_OFFSET, self.e_lfanew);

        Ok(())
    }
}

/// DOS header plus the stub that sits between it and the PE signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosHeader {
    /// Fixed MZ fields. `mz.e_lfanew` is the PE header offset.
    pub mz: MzHeader,
    stub: Vec<u8>,
    message: Option<String>,
    rich_table: Option<RichTable>,
    vlv_signature: Option<VlvSignature>,
    modified: bool,
}

impl Default for DosHeader {
    /// MZ header with the standard real-mode stub and default message.
    fn default() -> Self {
        let stub = build_message_stub(DEFAULT_MESSAGE);
        let mut dos = Self {
            mz: MzHeader::default(),
            stub,
            message: Some(DEFAULT_MESSAGE.to_string()),
            rich_table: None,
            vlv_signature: None,
            modified: true,
        };
        dos.align_pe_header_offset();
        dos
    }
}

fn build_message_stub(message: &str) -> Vec<u8> {
    let mut stub = Vec::with_capacity(REALMODE_STUB.len() + message.len() + MESSAGE_TERMINATOR.len());
    stub.extend_from_slice(&REALMODE_STUB);
    stub.extend_from_slice(message.as_bytes());
    stub.extend_from_slice(&MESSAGE_TERMINATOR);
    stub
}

/// Extract the '$'-terminated message following the real-mode stub code.
fn extract_message(stub: &[u8]) -> Option<String> {
    if stub.len() < REALMODE_STUB.len() || stub[..REALMODE_STUB.len()] != REALMODE_STUB {
        return None;
    }

    let text = &stub[REALMODE_STUB.len()..];
    let len = text.iter().position(|&b| b == b'$')?;
    if len == 0 {
        return None;
    }

    let message = text[..len]
        .iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| b as char)
        .collect();
    Some(message)
}

impl DosHeader {
    /// Parse the MZ header and stub from the start of a file buffer.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mz = MzHeader::parse(data)?;
        let pe_offset = mz.e_lfanew as usize;

        if pe_offset < MzHeader::SIZE {
            return Err(Error::malformed(format!(
                "PE header offset {pe_offset:#x} overlaps the DOS header"
            )));
        }

        let stub_len = pe_offset - MzHeader::SIZE;
        let stub = try_copy(data.slice_at(MzHeader::SIZE, stub_len)?)?;

        let mut dos = Self {
            mz,
            stub,
            message: None,
            rich_table: None,
            vlv_signature: None,
            modified: false,
        };
        dos.scan_stub();

        log::debug!(
            "DOS header: stub {} bytes, rich={}, vlv={}, message={:?}",
            dos.stub.len(),
            dos.rich_table.is_some(),
            dos.vlv_signature.is_some(),
            dos.message
        );

        Ok(dos)
    }

    fn scan_stub(&mut self) {
        if let Some(vlv) = VlvSignature::parse(&self.stub) {
            // A VLV signature replaces the message area.
            self.vlv_signature = Some(vlv);
            return;
        }

        self.rich_table = RichTable::parse(&self.stub);
        self.message = extract_message(&self.stub);
    }

    /// Number of bytes this header occupies in the file (MZ header + stub).
    pub fn size(&self) -> usize {
        MzHeader::SIZE + self.stub.len()
    }

    /// Offset of the PE signature.
    pub fn pe_header_offset(&self) -> u32 {
        self.mz.e_lfanew
    }

    /// Raw stub bytes.
    pub fn stub(&self) -> &[u8] {
        &self.stub
    }

    /// DOS message, if the stub is a standard real-mode stub.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn rich_table(&self) -> Option<&RichTable> {
        self.rich_table.as_ref()
    }

    pub fn vlv_signature(&self) -> Option<&VlvSignature> {
        self.vlv_signature.as_ref()
    }

    pub fn has_rich_table(&self) -> bool {
        self.rich_table.is_some()
    }

    pub fn has_vlv_signature(&self) -> bool {
        self.vlv_signature.is_some()
    }

    /// True if the stub changed since the last recalculation.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified = false;
    }

    /// Replace the stub with the real-mode stub printing `message`.
    ///
    /// Any Rich table or VLV signature is dropped.
    pub fn set_message(&mut self, message: &str) -> Result<()> {
        if message.len() > MAX_MESSAGE_LEN {
            return Err(Error::out_of_range(format!(
                "DOS message length {} exceeds {MAX_MESSAGE_LEN}",
                message.len()
            )));
        }

        let mut stub = Vec::new();
        let needed = REALMODE_STUB.len() + message.len() + MESSAGE_TERMINATOR.len();
        stub.try_reserve_exact(align_up_usize(needed, 8))
            .map_err(|_| Error::AllocationFailure(needed))?;
        stub.extend_from_slice(&REALMODE_STUB);
        stub.extend_from_slice(message.as_bytes());
        stub.extend_from_slice(&MESSAGE_TERMINATOR);

        self.stub = stub;
        self.message = Some(message.to_string());
        self.rich_table = None;
        self.vlv_signature = None;
        self.align_pe_header_offset();
        self.modified = true;
        Ok(())
    }

    /// Restore the standard real-mode stub and its default message.
    pub fn reset_message(&mut self) -> Result<()> {
        self.set_message(DEFAULT_MESSAGE)
    }

    /// Remove the Rich table bytes from the stub.
    pub fn delete_rich_table(&mut self) {
        if let Some(rich) = self.rich_table.take() {
            self.excise_stub(rich.start, rich.end);
        }
    }

    /// Remove the VLV signature bytes from the stub.
    pub fn delete_vlv_signature(&mut self) {
        if let Some(vlv) = self.vlv_signature.take() {
            self.excise_stub(vlv.start, vlv.end);
        }
    }

    fn excise_stub(&mut self, start: usize, end: usize) {
        let end = end.min(self.stub.len());
        let start = start.min(end);
        self.stub.drain(start..end);
        self.stub.shrink_to_fit();

        // Offsets of whatever is left may have moved.
        if let Some(rich) = self.rich_table.as_mut() {
            if rich.start >= end {
                rich.start -= end - start;
                rich.end -= end - start;
            }
        }
        if let Some(vlv) = self.vlv_signature.as_mut() {
            if vlv.start >= end {
                vlv.start -= end - start;
                vlv.end -= end - start;
            }
        }

        self.align_pe_header_offset();
        self.modified = true;
    }

    /// Zero-pad the stub to 8 bytes and point `e_lfanew` just past it.
    fn align_pe_header_offset(&mut self) {
        let padded = align_up_usize(self.stub.len(), 8);
        self.stub.resize(padded, 0);
        self.mz.e_lfanew = (MzHeader::SIZE + padded) as u32;
    }

    /// Write the MZ header and stub to the start of `buf`.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(0, self.size(), buf.len())?;
        self.mz.write(buf)?;
        buf[MzHeader::SIZE..end].copy_from_slice(&self.stub);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rich::RichEntry;
    use crate::vlv::{VLV_MARKER, VLV_SIGNATURE_SIZE};

    fn file_with_stub(stub: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; MzHeader::SIZE];
        let mz = MzHeader {
            e_lfanew: (MzHeader::SIZE + stub.len()) as u32,
            ..MzHeader::default()
        };
        mz.write(&mut data).unwrap();
        data.extend_from_slice(stub);
        data.extend_from_slice(b"PE\0\0");
        data
    }

    #[test]
    fn test_mz_header_size() {
        assert_eq!(MzHeader::SIZE, 64);
    }

    #[test]
    fn test_mz_header_parse_too_small() {
        let data = [0u8; 32];
        let result = MzHeader::parse(&data);
        assert!(matches!(result, Err(Error::TruncatedInput { .. })));
    }

    #[test]
    fn test_mz_header_invalid_signature() {
        let data = [0u8; 64];
        assert!(matches!(
            MzHeader::parse(&data),
            Err(Error::InvalidDosSignature)
        ));
    }

    #[test]
    fn test_mz_header_roundtrip() {
        let mut data = [0u8; 64];
        data[0] = 0x4D;
        data[1] = 0x5A;
        data[2] = 0x90;
        data[60..64].copy_from_slice(&0x80u32.to_le_bytes());

        let header = MzHeader::parse(&data).unwrap();
        assert_eq!(header.e_lfanew, 0x80);
        assert_eq!(header.e_cblp, 0x90);

        let mut output = [0u8; 64];
        header.write(&mut output).unwrap();
        assert_eq!(data, output);
    }

    #[test]
    fn test_parse_message_stub() {
        let mut stub = build_message_stub(DEFAULT_MESSAGE);
        stub.resize(align_up_usize(stub.len(), 8), 0);
        let data = file_with_stub(&stub);

        let dos = DosHeader::parse(&data).unwrap();
        assert_eq!(dos.message(), Some(DEFAULT_MESSAGE));
        assert!(!dos.has_rich_table());
        assert!(!dos.has_vlv_signature());
        assert_eq!(dos.stub(), &stub[..]);
    }

    #[test]
    fn test_message_filters_unprintable() {
        let mut stub = REALMODE_STUB.to_vec();
        stub.extend_from_slice(b"Hi\x01 there\r\n$");
        let data = file_with_stub(&stub);

        let dos = DosHeader::parse(&data).unwrap();
        assert_eq!(dos.message(), Some("Hi there"));
    }

    #[test]
    fn test_message_requires_terminator() {
        let mut stub = REALMODE_STUB.to_vec();
        stub.extend_from_slice(b"no terminator");
        let data = file_with_stub(&stub);
        assert_eq!(DosHeader::parse(&data).unwrap().message(), None);

        let mut empty = REALMODE_STUB.to_vec();
        empty.push(b'$');
        let data = file_with_stub(&empty);
        assert_eq!(DosHeader::parse(&data).unwrap().message(), None);
    }

    #[test]
    fn test_set_message_aligns_offset() {
        let mut dos = DosHeader::default();
        dos.set_message("X").unwrap();

        // 64 + align8(14 + 1 + 4)
        assert_eq!(dos.pe_header_offset(), 88);
        assert_eq!(dos.stub().len(), 24);
        assert_eq!(dos.message(), Some("X"));
        assert!(dos.is_modified());
    }

    #[test]
    fn test_reset_message() {
        let mut dos = DosHeader::default();
        dos.set_message("X").unwrap();
        dos.reset_message().unwrap();

        let default = DosHeader::default();
        assert_eq!(dos.message(), Some(DEFAULT_MESSAGE));
        assert_eq!(dos.stub(), default.stub());
        assert_eq!(dos.pe_header_offset(), default.pe_header_offset());
    }

    #[test]
    fn test_delete_vlv_signature() {
        let mut stub = build_message_stub(DEFAULT_MESSAGE);
        stub.resize(align_up_usize(stub.len(), 8), 0);
        let message_len = stub.len();
        stub.extend_from_slice(&VLV_MARKER.to_le_bytes());
        stub.extend_from_slice(&1u32.to_le_bytes());
        stub.extend_from_slice(&0x2000u32.to_le_bytes());
        stub.extend_from_slice(&0u32.to_le_bytes());
        stub.extend_from_slice(&[0x5A; VLV_SIGNATURE_SIZE]);
        stub.extend_from_slice(&[0u8; 8]);
        let data = file_with_stub(&stub);

        let mut dos = DosHeader::parse(&data).unwrap();
        let vlv = dos.vlv_signature().unwrap();
        assert_eq!(vlv.start, message_len);
        assert_eq!(vlv.file_size, 0x2000);

        dos.delete_vlv_signature();
        assert!(dos.vlv_signature().is_none());
        assert_eq!(dos.stub().len(), message_len);
        assert_eq!(dos.pe_header_offset() as usize, MzHeader::SIZE + message_len);
        assert_eq!(dos.pe_header_offset() % 8, 0);
        assert!(dos.is_modified());
    }

    #[test]
    fn test_set_message_too_long() {
        let mut dos = DosHeader::default();
        let before = dos.clone();
        let long = "a".repeat(MAX_MESSAGE_LEN + 1);

        assert!(matches!(dos.set_message(&long), Err(Error::OutOfRange(_))));
        assert_eq!(dos, before);
    }

    #[test]
    fn test_set_message_clears_rich() {
        let rich = RichTable {
            key: 0xCAFEBABE,
            entries: vec![RichEntry::from_comp_id(0x0104_0001, 3)],
            start: 0,
            end: 0,
        };
        let mut stub = build_message_stub(DEFAULT_MESSAGE);
        stub.resize(align_up_usize(stub.len(), 8), 0);
        stub.extend_from_slice(&rich.to_bytes());
        let data = file_with_stub(&stub);

        let mut dos = DosHeader::parse(&data).unwrap();
        assert!(dos.has_rich_table());

        dos.set_message("replaced").unwrap();
        assert!(!dos.has_rich_table());
    }

    #[test]
    fn test_delete_rich_table() {
        let rich = RichTable {
            key: 0x01020304,
            entries: vec![
                RichEntry::from_comp_id(0x0105_1000, 1),
                RichEntry::from_comp_id(0x0104_1000, 9),
            ],
            start: 0,
            end: 0,
        };
        let mut stub = build_message_stub(DEFAULT_MESSAGE);
        stub.resize(align_up_usize(stub.len(), 8), 0);
        let message_len = stub.len();
        stub.extend_from_slice(&rich.to_bytes());
        let data = file_with_stub(&stub);

        let mut dos = DosHeader::parse(&data).unwrap();
        let found = dos.rich_table().unwrap().clone();
        assert_eq!(found.entries, rich.entries);
        assert_eq!(found.start, message_len);

        dos.delete_rich_table();
        assert!(!dos.has_rich_table());
        assert_eq!(dos.stub().len(), message_len);
        assert_eq!(dos.pe_header_offset() as usize, MzHeader::SIZE + message_len);
        assert!(dos.is_modified());
    }

    #[test]
    fn test_pe_offset_inside_header() {
        let mut data = vec![0u8; 128];
        MzHeader {
            e_lfanew: 4,
            ..MzHeader::default()
        }
        .write(&mut data)
        .unwrap();
        assert!(matches!(
            DosHeader::parse(&data),
            Err(Error::MalformedStructure(_))
        ));
    }

    #[test]
    fn test_pe_offset_past_end() {
        let mut data = vec![0u8; 64];
        MzHeader {
            e_lfanew: 0x1000,
            ..MzHeader::default()
        }
        .write(&mut data)
        .unwrap();
        assert!(matches!(
            DosHeader::parse(&data),
            Err(Error::TruncatedInput { .. })
        ));
    }
}
