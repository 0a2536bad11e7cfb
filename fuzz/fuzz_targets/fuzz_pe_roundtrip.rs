#![no_main]

use libfuzzer_sys::fuzz_target;
use peforge::PeImage;

const MAX_OUTPUT: usize = 1 << 26;

fuzz_target!(|data: &[u8]| {
    let Ok(mut image) = PeImage::create_from_buffer(data) else {
        return;
    };
    if image.recalculate_force().is_err() {
        return;
    }
    if !matches!(image.write_to_buffer(None), Ok(size) if size <= MAX_OUTPUT) {
        return;
    }
    // Anything we write must load again
    if let Ok(bytes) = image.write_to_vec() {
        let reparsed = PeImage::create_from_buffer(&bytes);
        assert!(reparsed.is_ok(), "rewritten image failed to parse: {:?}", reparsed.err());
    }
});
