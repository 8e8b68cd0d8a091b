//! Discovery and metadata extraction for chunked-array (Zarr v2) stores.
//!
//! A directory holding a `.zarray` file is an array node; any other directory
//! is treated as a group and searched for further arrays.

pub mod attributes;
pub mod descriptor;
pub mod walker;

pub use attributes::{
    ATTRIBUTE_PREFIX, AttributeHeuristics, FIELD_RESOLUTION_NM, RESOLUTION_KEYS,
    ResolutionOverride, ResolutionOverrides, UNIT_KEYS,
};
pub use descriptor::{
    ARRAY_DESCRIPTOR, ATTRIBUTES_FILE, ArrayDescriptor, ArrayNode, GROUP_DESCRIPTOR,
};
pub use walker::{
    NodeFailure, WalkOutcome, ZARR_FORMAT, ZarrWalker, discover_arrays, extract_zarr_metadata,
};

/// Whether `dir` looks like the root of a store: named `*.zarr` or carrying
/// group/array metadata at its top level.
pub fn is_store_root(dir: &camino::Utf8Path) -> bool {
    dir.extension() == Some("zarr")
        || dir.join(GROUP_DESCRIPTOR).as_std_path().is_file()
        || dir.join(ARRAY_DESCRIPTOR).as_std_path().is_file()
}
