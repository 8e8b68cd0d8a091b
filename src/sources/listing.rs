//! Sources whose files are plain links on an HTML page.

use std::sync::{LazyLock, Mutex};

use camino::Utf8Path;
use rayon::prelude::*;
use regex::Regex;
use url::Url;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{SourceKind, SourceRequest};
use crate::error::HarvestError;
use crate::sources::{DatasetSource, DownloadSummary, HttpFetcher};

static HREF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .expect("href pattern compiles")
});

/// Absolute URLs of every anchor in `html` whose target ends with
/// `extension` (case-insensitive). Links are trimmed, spaces are encoded as
/// `%20`, relative links are resolved against `base`, and duplicates are
/// dropped keeping first-seen order.
pub fn extract_links(html: &str, base: &Url, extension: &str) -> Vec<Url> {
    let suffix = format!(".{}", extension.trim_start_matches('.').to_ascii_lowercase());
    let mut links: Vec<Url> = Vec::new();
    for captures in HREF_REGEX.captures_iter(html) {
        let Some(raw) = captures
            .get(1)
            .or_else(|| captures.get(2))
            .or_else(|| captures.get(3))
        else {
            continue;
        };
        let href = raw.as_str().trim().replace(' ', "%20");
        if !href.to_ascii_lowercase().ends_with(&suffix) {
            continue;
        }
        match base.join(&href) {
            Ok(url) if !links.contains(&url) => links.push(url),
            Ok(_) => {}
            Err(err) => tracing::debug!(href = %href, error = %err, "ignoring malformed link"),
        }
    }
    links
}

fn file_name(url: &Url) -> Option<&str> {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
}

/// Directory-style listings served as plain HTML (the EMPIAR FTP mirror).
/// Files are fetched one after another.
pub struct StaticListingSource {
    fetcher: HttpFetcher,
    extension: String,
}

impl StaticListingSource {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self {
            fetcher,
            extension: "dm3".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }
}

impl DatasetSource for StaticListingSource {
    fn kind(&self) -> SourceKind {
        SourceKind::StaticListing
    }

    fn download(
        &self,
        request: &SourceRequest,
        dataset_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        let base = listing_base(request.url());
        let html = self.fetcher.get_text(base.as_str())?;
        let links = extract_links(&html, &base, &self.extension);
        sink.event(ProgressEvent {
            message: format!("{}: {} .{} files listed", request.dataset(), links.len(), self.extension),
            elapsed: None,
        });

        let mut summary = DownloadSummary::default();
        for link in links {
            let Some(name) = file_name(&link) else {
                continue;
            };
            match self.fetcher.download_to(link.as_str(), &dataset_dir.join(name)) {
                Ok(bytes) => summary.record_file(bytes),
                Err(err) => summary.record_failure(link.as_str(), &err),
            }
        }
        Ok(summary)
    }
}

/// A listing URL without a trailing slash would resolve relative links
/// against its parent.
fn listing_base(url: &Url) -> Url {
    if url.path().ends_with('/') {
        return url.clone();
    }
    let mut base = url.clone();
    base.set_path(&format!("{}/", url.path()));
    base
}

/// Gallery pages whose `.tif` links are present in the served HTML (the
/// EPFL CVLab mitochondria page). Files are fetched in parallel.
pub struct RenderedGallerySource {
    fetcher: HttpFetcher,
}

impl RenderedGallerySource {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

impl DatasetSource for RenderedGallerySource {
    fn kind(&self) -> SourceKind {
        SourceKind::RenderedGallery
    }

    fn download(
        &self,
        request: &SourceRequest,
        dataset_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        let html = self.fetcher.get_text(request.url().as_str())?;
        let links = extract_links(&html, request.url(), "tif");
        if links.is_empty() {
            tracing::warn!(
                url = %request.url(),
                "no .tif links in page; links added by scripts are not visible"
            );
        }
        sink.event(ProgressEvent {
            message: format!("{}: {} .tif files listed", request.dataset(), links.len()),
            elapsed: None,
        });

        let summary = Mutex::new(DownloadSummary::default());
        links.par_iter().for_each(|link| {
            let Some(name) = file_name(link) else {
                return;
            };
            let result = self.fetcher.download_to(link.as_str(), &dataset_dir.join(name));
            if let Ok(mut summary) = summary.lock() {
                match result {
                    Ok(bytes) => summary.record_file(bytes),
                    Err(err) => summary.record_failure(link.as_str(), &err),
                }
            }
        });
        summary
            .into_inner()
            .map_err(|err| HarvestError::WorkerPool(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_filtered_resolved_and_deduplicated() {
        let base = Url::parse("https://ftp.ebi.ac.uk/empiar/world_availability/10310/data/").unwrap();
        let html = r#"
            <a href="a.dm3">a</a>
            <A HREF='sub/b.DM3'>b</A>
            <a class="x" href=" a.dm3 ">dup</a>
            <a href="readme.txt">skip</a>
        "#;
        let links = extract_links(html, &base, "dm3");
        let links: Vec<_> = links.iter().map(Url::as_str).collect();
        assert_eq!(
            links,
            vec![
                "https://ftp.ebi.ac.uk/empiar/world_availability/10310/data/a.dm3",
                "https://ftp.ebi.ac.uk/empiar/world_availability/10310/data/sub/b.DM3",
            ]
        );
    }

    #[test]
    fn href_pattern_matches_all_quoting_styles() {
        let html = r#"<a href="q.tif"> <a href='s.tif'> <a href=u.tif>"#;
        let targets: Vec<_> = HREF_REGEX
            .captures_iter(html)
            .filter_map(|captures| captures.iter().skip(1).flatten().next())
            .map(|found| found.as_str())
            .collect();
        assert_eq!(targets, vec!["q.tif", "s.tif", "u.tif"]);
    }

    #[test]
    fn spaces_are_encoded() {
        let base = Url::parse("https://www.epfl.ch/labs/cvlab/data/").unwrap();
        let html = r#"<a href="https://documents.epfl.ch/volume one.tif">v</a>"#;
        let links = extract_links(html, &base, ".tif");
        assert_eq!(links[0].as_str(), "https://documents.epfl.ch/volume%20one.tif");
    }

    #[test]
    fn listing_base_gains_trailing_slash() {
        let url = Url::parse("https://host/data").unwrap();
        assert_eq!(listing_base(&url).as_str(), "https://host/data/");
    }
}
