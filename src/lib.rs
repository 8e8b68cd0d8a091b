//! Harvests 3D microscopy datasets from heterogeneous online sources and
//! builds one metadata table over the TIFF, DM3 and Zarr files they contain.

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod flatten;
pub mod formats;
pub mod output;
pub mod record;
pub mod sources;
pub mod store;
pub mod table;
pub mod zarr;
