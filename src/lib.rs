//! # peforge
//!
//! Parse, edit, recalculate and re-serialize PE/PE+ images.
//!
//! An image is loaded into a [`PeImage`] that owns its DOS header, PE
//! header, sections, data directories, certificate table, resource tree,
//! import table and overlay. Edits mark the parts they touch; recalculation
//! re-places sections and re-derives every header field and directory that
//! depends on them before the image is written back.
//!
//! ## Features
//!
//! - **Hardened parsing**: every offset and length read from the file is
//!   bounds-checked; allocations sized by the input are fallible.
//! - **Failure isolation**: a broken certificate, resource node or import
//!   entry is dropped and recorded in [`PeImage::diagnostics`] while the
//!   rest of the image still loads.
//! - **Byte-exact round trips**: an unmodified image writes back identical.
//!
//! ## Example
//!
//! ```no_run
//! use peforge::PeImage;
//!
//! let mut image = PeImage::create_from_file("example.exe")?;
//! println!("PE32+: {}", image.is_pe32plus());
//!
//! image.dos_header_mut().set_message("Hello from DOS")?;
//! image.remove_certificates();
//! image.write_to_file("patched.exe")?;
//! # Ok::<(), peforge::Error>(())
//! ```

pub mod builder;
pub mod certificate;
pub mod checksum;
pub mod codec;
pub mod coff;
pub mod data_dir;
pub mod dos;
pub mod error;
pub mod handle;
pub mod header;
pub mod import;
pub mod layout;
pub mod optional;
pub mod pe;
pub mod reader;
pub mod resource;
pub mod rich;
pub mod section;
pub mod vlv;

pub use builder::ImageBuilder;
pub use certificate::{Certificate, CertificateRevision, CertificateTable, CertificateType};
pub use coff::{CoffHeader, MachineType};
pub use data_dir::{DataDirectory, DataDirectoryType, DirectoryEntry, DirectoryLocation};
pub use dos::DosHeader;
pub use error::{Error, ErrorKind, Result};
pub use header::Header;
pub use import::{ImportDescriptor, ImportEntry, ImportTable, ImportThunk};
pub use layout::LayoutConfig;
pub use optional::{OptionalHeader, Subsystem};
pub use pe::PeImage;
pub use reader::Reader;
pub use resource::{ResourceData, ResourceDirectory, ResourceId, ResourceTable, ResourceType};
pub use section::{Section, SectionHeader};
