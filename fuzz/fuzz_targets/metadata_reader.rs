#![no_main]

//! Feeds arbitrary bytes to the incremental metadata reader in arbitrary
//! chunk sizes. The reader must never panic and never read past its cap.

use arbitrary::Arbitrary;
use lazy_viewer::engine::{ContainerKind, MetadataReader};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    kind: u8,
    chunk: u16,
    data: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let reader = match input.kind % 5 {
        0 => MetadataReader::for_header(&input.data),
        1 => Some(MetadataReader::new(ContainerKind::Jpeg)),
        2 => Some(MetadataReader::new(ContainerKind::Png)),
        3 => Some(MetadataReader::new(ContainerKind::WebP)),
        _ => Some(MetadataReader::new(ContainerKind::Tiff)),
    };
    let Some(mut reader) = reader else {
        return;
    };
    let chunk = usize::from(input.chunk).max(1);
    for piece in input.data.chunks(chunk) {
        if reader.is_finished() {
            break;
        }
        reader.consume(piece);
    }
    reader.finish();
    let metadata = reader.into_metadata();
    let _ = metadata.orientation();
});
