//! Downloaders, one per kind of remote source.

pub mod http;
pub mod listing;
pub mod neuroglancer;
pub mod omero;
pub mod s3_zarr;

use std::collections::HashMap;
use std::time::Duration;

use camino::Utf8Path;
use serde::Serialize;

use crate::app::ProgressSink;
use crate::domain::{SourceKind, SourceRequest};
use crate::error::HarvestError;

pub use http::HttpFetcher;
pub use listing::{RenderedGallerySource, StaticListingSource, extract_links};
pub use neuroglancer::{NeuroglancerOptions, NeuroglancerSource};
pub use omero::OmeroSource;
pub use s3_zarr::ZarrS3Source;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadFailure {
    pub url: String,
    pub cause: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    pub files: usize,
    pub bytes: u64,
    pub failures: Vec<DownloadFailure>,
}

impl DownloadSummary {
    pub fn record_file(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    pub fn record_failure(&mut self, url: impl Into<String>, err: &HarvestError) {
        let url = url.into();
        tracing::warn!(url = %url, error = %err, "download failed");
        self.failures.push(DownloadFailure {
            url,
            cause: err.to_string(),
        });
    }

    pub fn merge(&mut self, other: DownloadSummary) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.failures.extend(other.failures);
    }
}

pub trait DatasetSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetches the dataset named by `request` into `dataset_dir`, which
    /// already exists. Failures of individual files are collected in the
    /// summary; an error means the source as a whole could not be harvested.
    fn download(
        &self,
        request: &SourceRequest,
        dataset_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError>;
}

#[derive(Default)]
pub struct SourceRegistry {
    sources: HashMap<SourceKind, Box<dyn DatasetSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All five downloaders over one shared HTTP client.
    pub fn http(
        timeout: Duration,
        neuroglancer: NeuroglancerOptions,
    ) -> Result<Self, HarvestError> {
        let fetcher = HttpFetcher::new(timeout)?;
        let mut registry = Self::new();
        registry.register(Box::new(OmeroSource::new(fetcher.clone())));
        registry.register(Box::new(StaticListingSource::new(fetcher.clone())));
        registry.register(Box::new(RenderedGallerySource::new(fetcher.clone())));
        registry.register(Box::new(ZarrS3Source::new(fetcher.clone())));
        registry.register(Box::new(NeuroglancerSource::new(fetcher, neuroglancer)));
        Ok(registry)
    }

    /// Replaces any source already registered for the same kind.
    pub fn register(&mut self, source: Box<dyn DatasetSource>) {
        self.sources.insert(source.kind(), source);
    }

    pub fn get(&self, kind: SourceKind) -> Result<&dyn DatasetSource, HarvestError> {
        self.sources
            .get(&kind)
            .map(|source| source.as_ref())
            .ok_or_else(|| HarvestError::UnsupportedSource(format!("no downloader for {kind}")))
    }

    pub fn kinds(&self) -> Vec<SourceKind> {
        let mut kinds: Vec<_> = self.sources.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}
