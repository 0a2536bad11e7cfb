#![no_main]

use libfuzzer_sys::fuzz_target;
use peforge::PeImage;

fuzz_target!(|data: &[u8]| {
    // Parsing must never panic, only return errors for invalid input
    let _ = PeImage::create_from_buffer(data);
});
