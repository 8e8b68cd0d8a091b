use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid source url: {0}")]
    InvalidSourceUrl(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("missing config file harvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("root is not readable: {path}: {message}")]
    RootUnreadable { path: PathBuf, message: String },

    #[error("invalid array descriptor at {path}: {message}")]
    InvalidDescriptor { path: PathBuf, message: String },

    #[error("invalid attributes at {path}: {message}")]
    InvalidAttributes { path: PathBuf, message: String },

    #[error("failed to parse TIFF {path}: {message}")]
    Tiff { path: PathBuf, message: String },

    #[error("failed to parse DM3 {path}: {message}")]
    Dm3 { path: PathBuf, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("{url} returned status {status}: {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("no arrays found under {0}")]
    NoArraysFound(String),

    #[error("volume {volume:?} is smaller than crop region {crop:?}")]
    CropTooLarge { volume: [u64; 3], crop: [u64; 3] },

    #[error("remote key {0:?} does not name a path inside the dataset folder")]
    UnsafeRemoteKey(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to write metadata table: {0}")]
    Table(String),

    #[error("worker pool error: {0}")]
    WorkerPool(String),
}
