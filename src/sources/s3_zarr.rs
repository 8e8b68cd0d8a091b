//! Copies every array of a public S3-hosted array store, read anonymously
//! over HTTPS with ListObjectsV2.

use std::collections::BTreeSet;

use camino::Utf8Path;
use serde::Deserialize;
use url::Url;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{SourceKind, SourceRequest};
use crate::error::HarvestError;
use crate::sources::{DatasetSource, DownloadSummary, HttpFetcher};
use crate::store::{DatasetStore, relative_key_path};
use crate::zarr::{ARRAY_DESCRIPTOR, ATTRIBUTES_FILE, GROUP_DESCRIPTOR};

/// Bucket and key prefix of a store, from `s3://bucket/prefix` or a
/// virtual-hosted `https://bucket.s3.amazonaws.com/prefix` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub prefix: String,
}

impl S3Location {
    pub fn parse(url: &Url) -> Result<Self, HarvestError> {
        let host = url
            .host_str()
            .ok_or_else(|| HarvestError::InvalidSourceUrl(format!("{url}: missing bucket")))?;
        let bucket = match url.scheme() {
            "s3" => host.to_string(),
            "https" | "http" => host
                .split_once(".s3")
                .map(|(bucket, _)| bucket.to_string())
                .ok_or_else(|| {
                    HarvestError::InvalidSourceUrl(format!("{url}: not an S3 endpoint"))
                })?,
            other => {
                return Err(HarvestError::InvalidSourceUrl(format!(
                    "{url}: unsupported scheme {other}"
                )));
            }
        };
        Ok(Self {
            bucket,
            prefix: url.path().trim_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> Result<Url, HarvestError> {
        Url::parse(&format!("https://{}.s3.amazonaws.com/", self.bucket))
            .map_err(|err| HarvestError::InvalidSourceUrl(err.to_string()))
    }

    pub fn list_url(&self, continuation: Option<&str>) -> Result<Url, HarvestError> {
        let mut url = self.endpoint()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("list-type", "2");
            if !self.prefix.is_empty() {
                query.append_pair("prefix", &format!("{}/", self.prefix));
            }
            if let Some(token) = continuation {
                query.append_pair("continuation-token", token);
            }
        }
        Ok(url)
    }

    pub fn object_url(&self, key: &str) -> Result<Url, HarvestError> {
        let mut url = self.endpoint()?;
        url.path_segments_mut()
            .map_err(|_| HarvestError::InvalidSourceUrl(format!("bucket {}", self.bucket)))?
            .clear()
            .extend(key.split('/'));
        Ok(url)
    }

    /// `key` relative to the store prefix. Keys outside the prefix, and
    /// keys that would not map to a path inside the local copy, give `None`.
    pub fn relative<'a>(&self, key: &'a str) -> Option<&'a str> {
        let relative = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?
        };
        match relative_key_path(relative) {
            Ok(_) => Some(relative),
            Err(err) => {
                tracing::warn!(key, error = %err, "skipping listed key");
                None
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename = "ListBucketResult")]
pub struct ListBucketPage {
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ListedObject>,
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    #[serde(rename = "NextContinuationToken")]
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListedObject {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

pub fn parse_list_page(xml: &str) -> Result<ListBucketPage, HarvestError> {
    quick_xml::de::from_str(xml).map_err(|err| HarvestError::Http(format!("bad S3 listing: {err}")))
}

/// Store-relative directories that hold an array descriptor, sorted. The
/// store root itself is `""`. Keys that are not plain relative paths are
/// ignored.
pub fn array_dirs<'a>(relative_keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    relative_keys
        .into_iter()
        .filter(|key| relative_key_path(key).is_ok())
        .filter_map(|key| match key.rsplit_once('/') {
            Some((dir, name)) if name == ARRAY_DESCRIPTOR => Some(dir.to_string()),
            None if key == ARRAY_DESCRIPTOR => Some(String::new()),
            _ => None,
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Group metadata keys above `array_dir`, store root first.
pub fn ancestor_metadata(array_dir: &str) -> Vec<String> {
    let mut dirs = vec![String::new()];
    let mut current = String::new();
    let parts: Vec<&str> = array_dir.split('/').filter(|part| !part.is_empty()).collect();
    for part in parts.iter().take(parts.len().saturating_sub(1)) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        dirs.push(current.clone());
    }
    dirs.into_iter()
        .flat_map(|dir| {
            [GROUP_DESCRIPTOR, ATTRIBUTES_FILE].map(|name| {
                if dir.is_empty() {
                    name.to_string()
                } else {
                    format!("{dir}/{name}")
                }
            })
        })
        .collect()
}

fn under(dir: &str, key: &str) -> bool {
    dir.is_empty() || key.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

pub struct ZarrS3Source {
    fetcher: HttpFetcher,
}

impl ZarrS3Source {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    fn list_keys(&self, location: &S3Location) -> Result<Vec<String>, HarvestError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let url = location.list_url(continuation.as_deref())?;
            let page = parse_list_page(&self.fetcher.get_text(url.as_str())?)?;
            keys.extend(page.contents.into_iter().map(|object| object.key));
            match page.next_continuation_token {
                Some(token) if page.is_truncated => continuation = Some(token),
                _ => break,
            }
        }
        Ok(keys)
    }

    fn copy_key(
        &self,
        location: &S3Location,
        relative: &str,
        dataset_dir: &Utf8Path,
        summary: &mut DownloadSummary,
    ) {
        let key = if location.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", location.prefix)
        };
        let result = relative_key_path(relative).and_then(|local| {
            let url = location.object_url(&key)?;
            self.fetcher.download_to(url.as_str(), &dataset_dir.join(local))
        });
        match result {
            Ok(bytes) => summary.record_file(bytes),
            Err(err) => summary.record_failure(key, &err),
        }
    }
}

impl DatasetSource for ZarrS3Source {
    fn kind(&self) -> SourceKind {
        SourceKind::ZarrS3
    }

    fn download(
        &self,
        request: &SourceRequest,
        dataset_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        let location = S3Location::parse(request.url())?;
        let keys = self.list_keys(&location)?;
        let relative: Vec<&str> = keys.iter().filter_map(|key| location.relative(key)).collect();
        let arrays = array_dirs(relative.iter().copied());
        if arrays.is_empty() {
            return Err(HarvestError::NoArraysFound(request.url().to_string()));
        }
        tracing::info!(url = %request.url(), arrays = arrays.len(), "arrays listed");
        sink.event(ProgressEvent {
            message: format!("{}: {} arrays listed", request.dataset(), arrays.len()),
            elapsed: None,
        });

        let available: BTreeSet<&str> = relative.iter().copied().collect();
        let mut summary = DownloadSummary::default();
        let mut copied_metadata = BTreeSet::new();
        for array in &arrays {
            let local = if array.is_empty() {
                dataset_dir.to_path_buf()
            } else {
                dataset_dir.join(array)
            };
            if !array.is_empty() {
                if let Err(err) = DatasetStore::remove_dir_if_exists(&local) {
                    summary.record_failure(array.as_str(), &err);
                    continue;
                }
            }
            tracing::debug!(array = %array, "copying array");
            for meta in ancestor_metadata(array) {
                if available.contains(meta.as_str()) && copied_metadata.insert(meta.clone()) {
                    self.copy_key(&location, &meta, dataset_dir, &mut summary);
                }
            }
            for key in relative.iter().filter(|key| under(array, key)) {
                if copied_metadata.contains(*key) {
                    continue;
                }
                self.copy_key(&location, key, dataset_dir, &mut summary);
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>janelia-cosem-datasets</Name>
  <Prefix>jrc_mus-nacc-2/jrc_mus-nacc-2.zarr/</Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>1000</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>abc</NextContinuationToken>
  <Contents><Key>jrc_mus-nacc-2/jrc_mus-nacc-2.zarr/.zgroup</Key><Size>24</Size></Contents>
  <Contents><Key>jrc_mus-nacc-2/jrc_mus-nacc-2.zarr/recon-2/em/s0/.zarray</Key><Size>400</Size></Contents>
</ListBucketResult>"#;
        let page = parse_list_page(xml).unwrap();
        assert_eq!(page.contents.len(), 2);
        assert!(page.is_truncated);
        assert_eq!(page.next_continuation_token.as_deref(), Some("abc"));
        assert_eq!(page.contents[1].size, 400);
    }

    #[test]
    fn finds_array_dirs_and_ancestors() {
        let keys = [".zgroup", "recon-2/.zgroup", "recon-2/em/s0/.zarray", "recon-2/em/s0/0.0.0", "recon-2/em/s1/.zarray"];
        assert_eq!(array_dirs(keys), vec!["recon-2/em/s0", "recon-2/em/s1"]);
        assert_eq!(
            ancestor_metadata("recon-2/em/s0"),
            vec![".zgroup", ".zattrs", "recon-2/.zgroup", "recon-2/.zattrs", "recon-2/em/.zgroup", "recon-2/em/.zattrs"]
        );
    }

    #[test]
    fn location_from_s3_url() {
        let url = Url::parse("s3://janelia-cosem-datasets/jrc_mus-nacc-2/jrc_mus-nacc-2.zarr").unwrap();
        let location = S3Location::parse(&url).unwrap();
        assert_eq!(location.bucket, "janelia-cosem-datasets");
        assert_eq!(location.prefix, "jrc_mus-nacc-2/jrc_mus-nacc-2.zarr");
        assert_eq!(
            location.object_url("a b/.zarray").unwrap().as_str(),
            "https://janelia-cosem-datasets.s3.amazonaws.com/a%20b/.zarray"
        );
        assert_eq!(location.relative("jrc_mus-nacc-2/jrc_mus-nacc-2.zarr/s0/.zarray"), Some("s0/.zarray"));
    }

    #[test]
    fn keys_escaping_the_store_are_dropped() {
        let url = Url::parse("s3://bucket/group/store.zarr").unwrap();
        let location = S3Location::parse(&url).unwrap();
        assert_eq!(location.relative("group/store.zarr//tmp/evil/.zarray"), None);
        assert_eq!(location.relative("group/store.zarr/../../escape/.zarray"), None);
        assert_eq!(location.relative("group/store.zarr/s0/./.zarray"), None);
        assert_eq!(location.relative("group/store.zarr/s0/.zarray"), Some("s0/.zarray"));

        let keys = ["../../escape/.zarray", "/tmp/evil/.zarray", "s0/.zarray"];
        assert_eq!(array_dirs(keys), vec!["s0"]);
    }
}
