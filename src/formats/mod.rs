//! Single-file image formats: TIFF stacks and DigitalMicrograph 3 images.

pub mod dm3;
pub mod tiff;
pub mod tiff_stack;

pub use dm3::{DM3_FORMAT, Dm3Document, extract_dm3_record};
pub use tiff::{TIFF_FORMAT, TiffSummary, decode_plane, extract_tiff_record};
pub use tiff_stack::{TiffPlane, TiffStackWriter, write_stack_file};

/// File extensions (lower-case) handled by the extractors in this module.
pub const TIFF_EXTENSIONS: [&str; 2] = ["tif", "tiff"];
pub const DM3_EXTENSIONS: [&str; 1] = ["dm3"];

pub fn has_extension(path: &camino::Utf8Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|ext| extensions.iter().any(|candidate| ext.eq_ignore_ascii_case(candidate)))
        .unwrap_or(false)
}
