//! Flat call surface that reports failure through a per-thread error slot.
//!
//! Each function here wraps a [`PeImage`] method. The slot is cleared on
//! entry and set to the error text on failure, so after any call
//! [`last_error`] describes that call only. A zero return alone does not
//! signal failure: check the slot.
//!
//! ```
//! use peforge::handle;
//!
//! assert!(handle::create_from_buffer(&[0u8; 10]).is_none());
//! assert!(handle::last_error().unwrap().contains("truncated"));
//! ```

use std::cell::RefCell;
use std::path::Path;

use crate::pe::PeImage;
use crate::{Error, Result};

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn clear() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}

fn record(err: &Error) {
    log::debug!("recording error: {err}");
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.to_string()));
}

fn capture<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            record(&err);
            None
        }
    }
}

/// Text of the error raised by the last failing call on this thread, if
/// the most recent call failed.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

pub fn create_from_buffer(data: &[u8]) -> Option<PeImage> {
    clear();
    capture(PeImage::create_from_buffer(data))
}

pub fn create_from_file<P: AsRef<Path>>(path: P) -> Option<PeImage> {
    clear();
    capture(PeImage::create_from_file(path))
}

/// Bytes written, or needed when `buf` is `None`. Zero on failure.
pub fn write_to_buffer(image: &mut PeImage, buf: Option<&mut [u8]>) -> usize {
    clear();
    capture(image.write_to_buffer(buf)).unwrap_or(0)
}

/// Bytes written to `path`. Zero on failure.
pub fn write_to_file<P: AsRef<Path>>(image: &mut PeImage, path: P) -> usize {
    clear();
    capture(image.write_to_file(path)).unwrap_or(0)
}

pub fn recalculate(image: &mut PeImage) -> bool {
    clear();
    capture(image.recalculate()).is_some()
}

pub fn recalculate_force(image: &mut PeImage) -> bool {
    clear();
    capture(image.recalculate_force()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ImageBuilder;
    use crate::section::characteristics;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn image_bytes() -> Vec<u8> {
        ImageBuilder::new()
            .add_section(".text", vec![0xC3], characteristics::CODE)
            .build()
            .unwrap()
            .write_to_vec()
            .unwrap()
    }

    #[test]
    fn test_failure_sets_slot() {
        assert!(create_from_buffer(&[]).is_none());
        assert!(last_error().is_some());
    }

    #[test]
    fn test_success_clears_slot() {
        assert!(create_from_buffer(b"MZ").is_none());
        assert!(last_error().is_some());

        let mut image = create_from_buffer(&image_bytes()).unwrap();
        assert!(last_error().is_none());

        let size = write_to_buffer(&mut image, None);
        assert!(size > 0);
        let mut small = vec![0u8; size - 1];
        assert_eq!(write_to_buffer(&mut image, Some(&mut small)), 0);
        assert!(last_error().unwrap().contains("truncated"));

        assert!(recalculate_force(&mut image));
        assert!(last_error().is_none());
    }

    #[test]
    fn test_slot_is_per_thread() {
        let barrier = Arc::new(Barrier::new(2));

        let failing = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                assert!(create_from_buffer(&[0u8; 10]).is_none());
                barrier.wait();
                barrier.wait();
                last_error()
            })
        };
        let succeeding = {
            let barrier = Arc::clone(&barrier);
            let bytes = image_bytes();
            thread::spawn(move || {
                barrier.wait();
                let image = create_from_buffer(&bytes);
                barrier.wait();
                (image.is_some(), last_error())
            })
        };

        assert!(failing.join().unwrap().is_some());
        assert_eq!(succeeding.join().unwrap(), (true, None));
    }

    #[test]
    fn test_file_wrappers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.exe");

        let mut image = create_from_buffer(&image_bytes()).unwrap();
        let written = write_to_file(&mut image, &path);
        assert_eq!(written, std::fs::metadata(&path).unwrap().len() as usize);
        assert!(create_from_file(&path).is_some());

        assert!(create_from_file(dir.path().join("missing.exe")).is_none());
        assert!(last_error().unwrap().starts_with("I/O error"));
    }
}
