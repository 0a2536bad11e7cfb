//! VLV signature detection inside the DOS stub.
//!
//! Some vendors embed a 128-byte signature blob in the DOS stub, introduced
//! by a 16-byte header starting with "VLV\0".

/// "VLV\0" marker.
pub const VLV_MARKER: u32 = 0x00564C56;

/// Size of the header preceding the signature blob.
pub const VLV_HEADER_SIZE: usize = 16;

/// Size of the signature blob.
pub const VLV_SIGNATURE_SIZE: usize = 128;

/// VLV signature found in a DOS stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlvSignature {
    /// Header magic ("VLV\0").
    pub magic: u32,
    pub version: u32,
    pub file_size: u32,
    pub reserved: u32,
    /// The 128-byte signature.
    pub signature: Vec<u8>,
    /// Stub offset of the header.
    pub start: usize,
    /// Stub offset one past the region owned by the signature. Trailing
    /// zero padding up to the end of the stub is included.
    pub end: usize,
}

fn dword(stub: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        stub[offset],
        stub[offset + 1],
        stub[offset + 2],
        stub[offset + 3],
    ])
}

impl VlvSignature {
    /// Look for a VLV signature in `stub`.
    pub fn parse(stub: &[u8]) -> Option<Self> {
        let total = VLV_HEADER_SIZE + VLV_SIGNATURE_SIZE;
        if stub.len() < total {
            return None;
        }

        let start = stub
            .windows(4)
            .position(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) == VLV_MARKER)?;
        let blob_end = start.checked_add(total)?;
        if blob_end > stub.len() {
            return None;
        }

        let only_zeros_after = stub[blob_end..].iter().all(|&b| b == 0);
        let end = if only_zeros_after {
            stub.len()
        } else {
            blob_end
        };

        Some(Self {
            magic: dword(stub, start),
            version: dword(stub, start + 4),
            file_size: dword(stub, start + 8),
            reserved: dword(stub, start + 12),
            signature: stub[start + VLV_HEADER_SIZE..blob_end].to_vec(),
            start,
            end,
        })
    }

    /// Size of the signature blob.
    pub fn signature_size(&self) -> usize {
        self.signature.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlv_block(fill: u8) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&VLV_MARKER.to_le_bytes());
        block.extend_from_slice(&1u32.to_le_bytes());
        block.extend_from_slice(&0x4000u32.to_le_bytes());
        block.extend_from_slice(&0u32.to_le_bytes());
        block.extend_from_slice(&[fill; VLV_SIGNATURE_SIZE]);
        block
    }

    #[test]
    fn test_vlv_with_zero_tail() {
        let mut stub = vec![0x90u8; 0x20];
        stub.extend_from_slice(&vlv_block(0xAB));
        stub.extend_from_slice(&[0u8; 8]);

        let vlv = VlvSignature::parse(&stub).expect("vlv");
        assert_eq!(vlv.start, 0x20);
        assert_eq!(vlv.end, stub.len());
        assert_eq!(vlv.version, 1);
        assert_eq!(vlv.file_size, 0x4000);
        assert_eq!(vlv.signature_size(), 128);
        assert!(vlv.signature.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_vlv_with_data_after() {
        let mut stub = vlv_block(0x11);
        stub.extend_from_slice(&[0, 0, 7, 0]);

        let vlv = VlvSignature::parse(&stub).expect("vlv");
        assert_eq!(vlv.start, 0);
        assert_eq!(vlv.end, VLV_HEADER_SIZE + VLV_SIGNATURE_SIZE);
    }

    #[test]
    fn test_vlv_truncated() {
        let mut stub = vec![0u8; 0x100];
        let at = 0x100 - 64;
        stub[at..at + 4].copy_from_slice(&VLV_MARKER.to_le_bytes());
        assert!(VlvSignature::parse(&stub).is_none());
        assert!(VlvSignature::parse(&[0u8; 16]).is_none());
    }
}
