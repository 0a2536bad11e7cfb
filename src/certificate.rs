//! Certificate table (WIN_CERTIFICATE sequence).
//!
//! The certificate directory holds a **file offset**, not an RVA. The table
//! lives after all section data and is a run of variable-length entries,
//! each starting on an 8-byte boundary relative to the table start.

use crate::codec;
use crate::error::try_copy;
use crate::layout::align_up_usize;
use crate::reader::{checked_end, Reader};
use crate::{Error, Result};

/// WIN_CERTIFICATE revision values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CertificateRevision {
    /// WIN_CERT_REVISION_1_0
    Revision1 = 0x0100,
    /// WIN_CERT_REVISION_2_0
    Revision2 = 0x0200,
}

impl CertificateRevision {
    /// Convert from raw u16.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0100 => Some(Self::Revision1),
            0x0200 => Some(Self::Revision2),
            _ => None,
        }
    }
}

/// WIN_CERTIFICATE type values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CertificateType {
    /// WIN_CERT_TYPE_X509 - X.509 certificate
    X509 = 0x0001,
    /// WIN_CERT_TYPE_PKCS_SIGNED_DATA - PKCS#7 SignedData
    PkcsSignedData = 0x0002,
    /// WIN_CERT_TYPE_RESERVED_1
    Reserved1 = 0x0003,
    /// WIN_CERT_TYPE_TS_STACK_SIGNED - Terminal Server Protocol Stack
    TsStackSigned = 0x0004,
}

impl CertificateType {
    /// Convert from raw u16.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::X509),
            0x0002 => Some(Self::PkcsSignedData),
            0x0003 => Some(Self::Reserved1),
            0x0004 => Some(Self::TsStackSigned),
            _ => None,
        }
    }
}

/// One WIN_CERTIFICATE entry. Revision and type are kept raw so that
/// unknown values survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub revision: u16,
    pub certificate_type: u16,
    /// Certificate blob (without the 8-byte header).
    pub data: Vec<u8>,
}

impl Certificate {
    /// Header size (length + revision + type).
    pub const HEADER_SIZE: usize = 8;

    pub fn new(revision: CertificateRevision, certificate_type: CertificateType, data: Vec<u8>) -> Self {
        Self {
            revision: revision as u16,
            certificate_type: certificate_type as u16,
            data,
        }
    }

    /// Value of the on-disk length field: header plus blob, unpadded.
    pub fn length(&self) -> usize {
        Self::HEADER_SIZE + self.data.len()
    }

    /// Bytes this entry occupies in the table, including padding.
    pub fn padded_length(&self) -> usize {
        align_up_usize(self.length(), 8)
    }

    pub fn revision_kind(&self) -> Option<CertificateRevision> {
        CertificateRevision::from_u16(self.revision)
    }

    pub fn type_kind(&self) -> Option<CertificateType> {
        CertificateType::from_u16(self.certificate_type)
    }
}

/// The ordered certificate entries of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateTable {
    pub certificates: Vec<Certificate>,
}

impl CertificateTable {
    /// Parse the table occupying `size` bytes at file offset `offset`.
    ///
    /// The table is all-or-nothing: an invalid entry fails the whole parse.
    pub fn parse(data: &[u8], offset: usize, size: usize) -> Result<Self> {
        let table_end = match offset.checked_add(size) {
            Some(end) if end <= data.len() => end,
            _ => {
                return Err(Error::TruncatedCertificate {
                    offset,
                    length: size as u32,
                })
            }
        };

        let mut certificates = Vec::new();
        let mut cursor = offset;

        while table_end.saturating_sub(cursor) >= Certificate::HEADER_SIZE {
            let length = data.read_u32_at(cursor)?;
            if (length as usize) < Certificate::HEADER_SIZE {
                return Err(Error::MalformedCertificate {
                    offset: cursor,
                    length,
                });
            }
            let end = match cursor.checked_add(length as usize) {
                Some(end) if end <= table_end => end,
                _ => return Err(Error::TruncatedCertificate { offset: cursor, length }),
            };

            let revision = data.read_u16_at(cursor + 4)?;
            let certificate_type = data.read_u16_at(cursor + 6)?;
            let blob = try_copy(&data[cursor + Certificate::HEADER_SIZE..end])?;

            let next = offset + align_up_usize(end - offset, 8);
            if next <= cursor {
                return Err(Error::InvalidCertificateLength { offset: cursor });
            }

            log::debug!(
                "certificate at {:#x}: length {}, revision {:#06x}, type {:#06x}",
                cursor,
                length,
                revision,
                certificate_type
            );
            certificates
                .try_reserve(1)
                .map_err(|_| Error::AllocationFailure(std::mem::size_of::<Certificate>()))?;
            certificates.push(Certificate {
                revision,
                certificate_type,
                data: blob,
            });
            cursor = next;
        }

        Ok(Self { certificates })
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Serialized size, each entry padded to 8 bytes.
    pub fn size(&self) -> usize {
        self.certificates.iter().map(Certificate::padded_length).sum()
    }

    /// Write the table at `offset`, zero-filling alignment gaps.
    ///
    /// With no buffer this only reports the number of bytes it would write.
    pub fn write(&self, buf: Option<&mut [u8]>, offset: usize) -> Result<usize> {
        let size = self.size();
        let Some(buf) = buf else {
            return Ok(size);
        };
        checked_end(offset, size, buf.len())?;

        let mut cursor = offset;
        for cert in &self.certificates {
            let length = u32::try_from(cert.length())
                .map_err(|_| Error::out_of_range("certificate larger than 4 GiB"))?;
            codec::write_u32(buf, cursor, length);
            codec::write_u16(buf, cursor + 4, cert.revision);
            codec::write_u16(buf, cursor + 6, cert.certificate_type);

            let data_start = cursor + Certificate::HEADER_SIZE;
            buf[data_start..data_start + cert.data.len()].copy_from_slice(&cert.data);
            buf[data_start + cert.data.len()..cursor + cert.padded_length()].fill(0);
            cursor += cert.padded_length();
        }
        Ok(size)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size()];
        self.write(Some(&mut buf), 0)?;
        Ok(buf)
    }
}
