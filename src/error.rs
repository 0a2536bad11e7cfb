//! Error types for PE parsing, recalculation and writing.

use std::io;
use thiserror::Error;

/// Result type alias for peforge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TruncatedInput,
    UnknownMagic,
    MalformedStructure,
    OutOfRange,
    AllocationFailure,
    IndexOutOfRange,
    Io,
}

/// Errors that can occur while parsing, editing or writing an image.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error in the file wrappers.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid DOS signature (expected "MZ").
    #[error("invalid DOS signature (expected 'MZ')")]
    InvalidDosSignature,

    /// Invalid PE signature (expected "PE\0\0").
    #[error("invalid PE signature (expected 'PE\\0\\0')")]
    InvalidPeSignature,

    /// Buffer shorter than the structure requires.
    #[error("truncated input: need {needed} bytes at offset {offset:#x}, {available} available")]
    TruncatedInput {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Optional header magic is neither PE32 nor PE32+.
    #[error("unknown optional header magic: {0:#06x}")]
    UnknownMagic(u16),

    /// Internally inconsistent length or offset fields.
    #[error("malformed structure: {0}")]
    MalformedStructure(String),

    /// Field value violates a numeric constraint.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// An allocation sized by input data could not be satisfied.
    #[error("failed to allocate {0} bytes")]
    AllocationFailure(usize),

    /// Caller supplied an index past the end of a table.
    #[error("index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Certificate length field too small to hold its own header.
    #[error("malformed certificate at offset {offset:#x}: length {length} < 8")]
    MalformedCertificate { offset: usize, length: u32 },

    /// Certificate runs past the end of its table or the file.
    #[error("truncated certificate at offset {offset:#x}: length {length} exceeds table")]
    TruncatedCertificate { offset: usize, length: u32 },

    /// Certificate walk failed to make forward progress.
    #[error("invalid certificate length at offset {offset:#x}")]
    InvalidCertificateLength { offset: usize },

    /// Section raw data reaches past the end of the file.
    #[error("section {index} data ({start:#x}..{end:#x}) exceeds file size {file_size:#x}")]
    SectionOutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        file_size: usize,
    },
}

impl Error {
    pub fn truncated(offset: usize, needed: usize, available: usize) -> Self {
        Error::TruncatedInput {
            offset,
            needed,
            available,
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedStructure(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }

    pub fn index(index: usize, len: usize) -> Self {
        Error::IndexOutOfRange { index, len }
    }

    /// Map this error onto its taxonomy class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::InvalidDosSignature | Error::InvalidPeSignature => {
                ErrorKind::MalformedStructure
            }
            Error::TruncatedInput { .. } | Error::SectionOutOfBounds { .. } => {
                ErrorKind::TruncatedInput
            }
            Error::UnknownMagic(_) => ErrorKind::UnknownMagic,
            Error::MalformedStructure(_)
            | Error::MalformedCertificate { .. }
            | Error::TruncatedCertificate { .. }
            | Error::InvalidCertificateLength { .. } => ErrorKind::MalformedStructure,
            Error::OutOfRange(_) => ErrorKind::OutOfRange,
            Error::AllocationFailure(_) => ErrorKind::AllocationFailure,
            Error::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
        }
    }
}

/// Allocate a zeroed buffer whose length comes from untrusted input.
pub(crate) fn try_alloc(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::AllocationFailure(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Copy `src` into a freshly allocated vector, reporting allocation failure.
pub(crate) fn try_copy(src: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(src.len())
        .map_err(|_| Error::AllocationFailure(src.len()))?;
    buf.extend_from_slice(src);
    Ok(buf)
}
