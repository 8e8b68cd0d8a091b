use camino::Utf8Path;
use serde::Deserialize;
use url::Url;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{SourceKind, SourceRequest};
use crate::error::HarvestError;
use crate::formats::{decode_plane, write_stack_file};
use crate::sources::{DatasetSource, DownloadSummary, HttpFetcher};

const PAGE_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ImagePage {
    #[serde(default)]
    pub data: Vec<OmeroImage>,
    #[serde(default)]
    pub meta: PageMeta,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageMeta {
    #[serde(rename = "totalCount", default)]
    pub total_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OmeroImage {
    #[serde(rename = "@id")]
    pub id: u64,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Pixels")]
    pub pixels: OmeroPixels,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OmeroPixels {
    #[serde(rename = "SizeZ")]
    pub size_z: u32,
    #[serde(rename = "SizeC")]
    pub size_c: u32,
    #[serde(rename = "SizeT")]
    pub size_t: u32,
}

impl OmeroImage {
    /// Every `(t, c)` pair of the image, t outermost. Each pair is saved as
    /// one z-stack.
    pub fn stacks(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let pixels = self.pixels;
        (0..pixels.size_t).flat_map(move |t| (0..pixels.size_c).map(move |c| (t, c)))
    }

    /// `<image name>_t000_c00.tiff`, with path separators in the name replaced
    /// and its own extension dropped.
    pub fn stack_file_name(&self, t: u32, c: u32) -> String {
        let stem = self.name.replace(['/', '\\'], "_");
        let stem = stem
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .filter(|stem| !stem.is_empty())
            .unwrap_or(stem);
        format!("{stem}_t{t:03}_c{c:02}.tiff")
    }
}

/// Images of an OMERO dataset (the IDR gallery). Each plane is rendered as a
/// greyscale TIFF by the web gateway; the planes of one `(t, c)` pair are
/// assembled into a multi-page stack, z ascending.
pub struct OmeroSource {
    fetcher: HttpFetcher,
}

impl OmeroSource {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }

    fn download_stack(
        &self,
        base: &Url,
        image: &OmeroImage,
        t: u32,
        c: u32,
        destination: &Utf8Path,
    ) -> Result<u64, HarvestError> {
        let planes = (0..image.pixels.size_z).map(|z| {
            let url = plane_url(base, image.id, t, c, z)?;
            let bytes = self.fetcher.get_bytes(url.as_str())?;
            decode_plane(&bytes).map_err(|message| HarvestError::Tiff {
                path: url.as_str().into(),
                message,
            })
        });
        write_stack_file(destination, planes)
    }

    fn list_images(&self, base: &Url, dataset_id: &str) -> Result<Vec<OmeroImage>, HarvestError> {
        let mut images = Vec::new();
        loop {
            let url = images_url(base, dataset_id, images.len())?;
            let page: ImagePage = self.fetcher.get_json(url.as_str())?;
            let received = page.data.len();
            images.extend(page.data);
            if received == 0 || images.len() >= page.meta.total_count {
                break;
            }
        }
        Ok(images)
    }
}

pub fn images_url(base: &Url, dataset_id: &str, offset: usize) -> Result<Url, HarvestError> {
    let mut url = base
        .join(&format!("/api/v0/m/datasets/{dataset_id}/images/"))
        .map_err(|err| HarvestError::InvalidSourceUrl(err.to_string()))?;
    url.query_pairs_mut()
        .append_pair("limit", &PAGE_LIMIT.to_string())
        .append_pair("offset", &offset.to_string());
    Ok(url)
}

pub fn plane_url(base: &Url, image_id: u64, t: u32, c: u32, z: u32) -> Result<Url, HarvestError> {
    let mut url = base
        .join(&format!("/webgateway/render_image/{image_id}/{z}/{t}/"))
        .map_err(|err| HarvestError::InvalidSourceUrl(err.to_string()))?;
    url.query_pairs_mut()
        .append_pair("c", &(c + 1).to_string())
        .append_pair("m", "g")
        .append_pair("format", "tif");
    Ok(url)
}

impl DatasetSource for OmeroSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Omero
    }

    fn download(
        &self,
        request: &SourceRequest,
        dataset_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        let dataset_id = request.omero_dataset_id().ok_or_else(|| {
            HarvestError::InvalidSourceUrl(format!("{}: missing dataset id", request.url()))
        })?;
        let base = request.url().clone();
        let images = self.list_images(&base, &dataset_id)?;
        sink.event(ProgressEvent {
            message: format!("{}: {} images listed", request.dataset(), images.len()),
            elapsed: None,
        });

        let mut summary = DownloadSummary::default();
        for image in &images {
            tracing::info!(
                image = %image.name,
                z = image.pixels.size_z,
                c = image.pixels.size_c,
                t = image.pixels.size_t,
                "downloading image stacks"
            );
            for (t, c) in image.stacks() {
                let destination = dataset_dir.join(image.stack_file_name(t, c));
                match self.download_stack(&base, image, t, c, &destination) {
                    Ok(bytes) => summary.record_file(bytes),
                    Err(err) => summary.record_failure(destination.as_str(), &err),
                }
            }
        }
        Ok(summary)
    }
}
