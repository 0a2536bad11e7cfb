#![no_main]

use libfuzzer_sys::fuzz_target;
use peforge::{DosHeader, Header};

fuzz_target!(|data: &[u8]| {
    // Headers only, without sections or directories
    if let Ok(dos) = DosHeader::parse(data) {
        let _ = dos.message();
        let _ = Header::parse_at(data, dos.pe_header_offset() as usize);
    }
});
