use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Omero,
    StaticListing,
    RenderedGallery,
    ZarrS3,
    Neuroglancer,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Omero,
        SourceKind::StaticListing,
        SourceKind::RenderedGallery,
        SourceKind::ZarrS3,
        SourceKind::Neuroglancer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Omero => "omero",
            SourceKind::StaticListing => "static-listing",
            SourceKind::RenderedGallery => "rendered-gallery",
            SourceKind::ZarrS3 => "zarr-s3",
            SourceKind::Neuroglancer => "neuroglancer",
        }
    }

    /// Picks the source kind from the URL scheme, then from the known-host table.
    pub fn detect(url: &Url) -> Option<SourceKind> {
        match url.scheme() {
            "s3" => return Some(SourceKind::ZarrS3),
            "gs" => return Some(SourceKind::Neuroglancer),
            _ => {}
        }
        let host = url.host_str()?;
        KNOWN_HOSTS
            .iter()
            .find(|(known, _)| host == *known || host.ends_with(&format!(".{known}")))
            .map(|(_, kind)| *kind)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| HarvestError::UnsupportedSource(value.to_string()))
    }
}

const KNOWN_HOSTS: &[(&str, SourceKind)] = &[
    ("idr.openmicroscopy.org", SourceKind::Omero),
    ("ftp.ebi.ac.uk", SourceKind::StaticListing),
    ("cvlab.epfl.ch", SourceKind::RenderedGallery),
];

/// A source URL bound to the downloader that handles it and the local
/// folder its dataset is saved under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    kind: SourceKind,
    url: Url,
    dataset: String,
}

impl SourceRequest {
    pub fn new(kind: SourceKind, url: &str, name: Option<String>) -> Result<Self, HarvestError> {
        let url = parse_url(url)?;
        let dataset = match name.map(|name| name.trim().to_string()) {
            Some(name) if !name.is_empty() => name,
            _ => default_dataset_name(kind, &url)?,
        };
        if dataset.contains(['/', '\\']) || dataset.starts_with('.') {
            return Err(HarvestError::InvalidSourceUrl(format!(
                "dataset name {dataset:?} is not a plain folder name"
            )));
        }
        Ok(Self { kind, url, dataset })
    }

    pub fn detect(url: &str) -> Result<Self, HarvestError> {
        let parsed = parse_url(url)?;
        let kind = SourceKind::detect(&parsed)
            .ok_or_else(|| HarvestError::UnsupportedSource(url.to_string()))?;
        Self::new(kind, url, None)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// The `dataset=<id>` query value of an OMERO gallery link.
    pub fn omero_dataset_id(&self) -> Option<String> {
        omero_dataset_id(&self.url)
    }
}

impl fmt::Display for SourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.url)
    }
}

impl FromStr for SourceRequest {
    type Err = HarvestError;

    /// Accepts either a bare URL or `<kind>:<url>`, e.g. `zarr-s3:s3://bucket/store.zarr`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if let Some((prefix, rest)) = trimmed.split_once(':') {
            if let Ok(kind) = prefix.parse::<SourceKind>() {
                return Self::new(kind, rest, None);
            }
        }
        Self::detect(trimmed)
    }
}

fn parse_url(value: &str) -> Result<Url, HarvestError> {
    Url::parse(value.trim()).map_err(|err| HarvestError::InvalidSourceUrl(format!("{value}: {err}")))
}

fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
        .unwrap_or_default()
}

fn omero_dataset_id(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "dataset")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit()))
}

fn default_dataset_name(kind: SourceKind, url: &Url) -> Result<String, HarvestError> {
    let segments = path_segments(url);
    let invalid = || HarvestError::InvalidSourceUrl(format!("{kind} source {url}"));
    match kind {
        SourceKind::Omero => omero_dataset_id(url)
            .map(|id| format!("omero_{id}"))
            .ok_or_else(invalid),
        SourceKind::StaticListing => segments
            .len()
            .checked_sub(2)
            .map(|idx| format!("empiar_{}", segments[idx]))
            .ok_or_else(invalid),
        SourceKind::RenderedGallery => segments
            .last()
            .map(|last| format!("mitochondria-{last}"))
            .ok_or_else(invalid),
        SourceKind::ZarrS3 => segments
            .last()
            .map(|last| last.to_string())
            .ok_or_else(invalid),
        SourceKind::Neuroglancer => url
            .host_str()
            .filter(|host| !host.is_empty())
            .map(|host| host.to_string())
            .ok_or_else(invalid),
    }
}
