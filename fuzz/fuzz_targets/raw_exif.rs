#![no_main]

//! Raw TIFF orientation lookup and in-place reset on arbitrary EXIF blocks.

use lazy_viewer::engine::{raw_exif_orientation, reset_raw_exif_orientation};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Some(orientation) = raw_exif_orientation(data) {
        assert!((1..=8).contains(&orientation));
    }
    let mut buf = data.to_vec();
    reset_raw_exif_orientation(&mut buf);
    assert_eq!(buf.len(), data.len());
});
