//! Random crops of Neuroglancer precomputed volumes.
//!
//! Only unsharded scales are supported: every chunk is a separate object
//! named `x0-x1_y0-y1_z0-z1` under the scale key. The crop is saved as a
//! Zarr v2 array `<dataset>_crop.zarr` whose chunk grid is the volume's own,
//! so each downloaded object lands, bytes unchanged, under its array chunk
//! key. The volume `info` and a `crop.json` describing the region sit next
//! to the store.

use camino::Utf8Path;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use url::Url;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{SourceKind, SourceRequest};
use crate::error::HarvestError;
use crate::sources::{DatasetSource, DownloadSummary, HttpFetcher};
use crate::store::{DatasetStore, relative_key_path};
use crate::zarr::{ARRAY_DESCRIPTOR, ATTRIBUTES_FILE, ArrayDescriptor};

const GCS_ENDPOINT: &str = "https://storage.googleapis.com";
pub const DEFAULT_CROP: [u64; 3] = [1000, 1000, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeuroglancerOptions {
    /// Crop size in voxels, `[x, y, z]`.
    pub crop: [u64; 3],
    pub mip: usize,
    pub seed: Option<u64>,
}

impl Default for NeuroglancerOptions {
    fn default() -> Self {
        Self {
            crop: DEFAULT_CROP,
            mip: 0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeInfo {
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub num_channels: Option<u64>,
    pub scales: Vec<ScaleInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScaleInfo {
    pub key: String,
    pub size: [u64; 3],
    pub chunk_sizes: Vec<[u64; 3]>,
    #[serde(default)]
    pub voxel_offset: [i64; 3],
    #[serde(default)]
    pub resolution: Option<[f64; 3]>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub sharding: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CropRegion {
    pub scale_key: String,
    pub mip: usize,
    /// Absolute voxel coordinates of the crop's first corner.
    pub origin: [i64; 3],
    pub size: [u64; 3],
    pub chunk_size: [u64; 3],
    pub resolution: Option<[f64; 3]>,
    pub encoding: Option<String>,
}

/// One volume chunk overlapping the crop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropChunk {
    /// Object name under the scale key.
    pub name: String,
    /// Chunk key inside the crop store, `z.y.x` (prefixed by the channel
    /// index for multi-channel volumes).
    pub store_key: String,
}

impl CropRegion {
    /// Every chunk covering the crop, x fastest, with its key in the crop
    /// store.
    pub fn chunks(&self, scale: &ScaleInfo, num_channels: u64) -> Vec<CropChunk> {
        let axis = |dim: usize| -> Vec<(i64, i64)> {
            let offset = scale.voxel_offset[dim];
            let end = offset + scale.size[dim] as i64;
            let step = self.chunk_size[dim] as i64;
            let crop_end = self.origin[dim] + self.size[dim] as i64;
            let mut ranges = Vec::new();
            let mut start = self.origin[dim];
            while start < crop_end && start < end {
                ranges.push((start, (start + step).min(end)));
                start += step;
            }
            ranges
        };
        let (xs, ys, zs) = (axis(0), axis(1), axis(2));
        let channel_prefix = if num_channels > 1 { "0." } else { "" };
        let mut chunks = Vec::with_capacity(xs.len() * ys.len() * zs.len());
        for (iz, (z0, z1)) in zs.iter().enumerate() {
            for (iy, (y0, y1)) in ys.iter().enumerate() {
                for (ix, (x0, x1)) in xs.iter().enumerate() {
                    chunks.push(CropChunk {
                        name: format!("{x0}-{x1}_{y0}-{y1}_{z0}-{z1}"),
                        store_key: format!("{channel_prefix}{iz}.{iy}.{ix}"),
                    });
                }
            }
        }
        chunks
    }
}

/// Zarr dtype of a precomputed `data_type`; precomputed chunks are
/// little-endian.
pub fn zarr_dtype(data_type: &str) -> Option<&'static str> {
    let dtype = match data_type {
        "uint8" => "|u1",
        "int8" => "|i1",
        "uint16" => "<u2",
        "int16" => "<i2",
        "uint32" => "<u4",
        "int32" => "<i4",
        "uint64" => "<u8",
        "int64" => "<i8",
        "float32" => "<f4",
        "float64" => "<f8",
        _ => return None,
    };
    Some(dtype)
}

/// Compressor entry for chunks stored in a precomputed `encoding`. Raw
/// chunks are plain little-endian arrays; image-encoded chunks name the
/// numcodecs id of the matching imagecodecs codec.
pub fn zarr_compressor(encoding: Option<&str>) -> Value {
    match encoding.unwrap_or("raw") {
        "raw" => Value::Null,
        "jpeg" => json!({"id": "imagecodecs_jpeg"}),
        "png" => json!({"id": "imagecodecs_png"}),
        other => json!({"id": format!("neuroglancer_{other}")}),
    }
}

pub fn crop_store_name(dataset: &str) -> String {
    format!("{dataset}_crop.zarr")
}

/// Writes the `.zarray` and `.zattrs` of the crop store at `store_dir`.
/// Shapes are `[z, y, x]`, or `[c, z, y, x]` for multi-channel volumes.
pub fn write_crop_store(
    store_dir: &Utf8Path,
    info: &VolumeInfo,
    crop: &CropRegion,
    source: &Url,
) -> Result<(), HarvestError> {
    let data_type = info.data_type.as_deref().unwrap_or("uint8");
    let dtype = zarr_dtype(data_type).ok_or_else(|| {
        HarvestError::UnsupportedSource(format!("precomputed data type {data_type}"))
    })?;
    let channels = info.num_channels.unwrap_or(1).max(1);
    let mut shape = vec![crop.size[2], crop.size[1], crop.size[0]];
    let mut chunks = vec![crop.chunk_size[2], crop.chunk_size[1], crop.chunk_size[0]];
    if channels > 1 {
        shape.insert(0, channels);
        chunks.insert(0, channels);
    }
    let descriptor = json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": dtype,
        "compressor": zarr_compressor(crop.encoding.as_deref()),
        "fill_value": 0,
        "order": "C",
        "filters": null,
        "dimension_separator": ".",
    });
    let descriptor_text = serde_json::to_string_pretty(&descriptor)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    ArrayDescriptor::parse(&descriptor_text).map_err(|message| {
        HarvestError::InvalidDescriptor {
            path: store_dir.join(ARRAY_DESCRIPTOR).into(),
            message,
        }
    })?;

    let mut attributes = Map::new();
    if let Some([x, y, z]) = crop.resolution {
        attributes.insert(
            "pixelResolution".to_string(),
            json!({"dimensions": [z, y, x], "unit": "nm"}),
        );
    }
    attributes.insert(
        "crop_origin".to_string(),
        json!([crop.origin[2], crop.origin[1], crop.origin[0]]),
    );
    attributes.insert("scale_key".to_string(), json!(crop.scale_key));
    attributes.insert("source".to_string(), json!(source.as_str()));
    let attributes_text = serde_json::to_string_pretty(&Value::Object(attributes))
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;

    DatasetStore::write_bytes_atomic(
        &store_dir.join(ARRAY_DESCRIPTOR),
        descriptor_text.as_bytes(),
    )?;
    DatasetStore::write_bytes_atomic(
        &store_dir.join(ATTRIBUTES_FILE),
        attributes_text.as_bytes(),
    )?;
    Ok(())
}

/// Picks a chunk-aligned crop origin, relative to the volume's voxel
/// offset, such that the whole crop fits in the volume.
pub fn choose_crop_origin<R: Rng>(
    volume: [u64; 3],
    chunk: [u64; 3],
    crop: [u64; 3],
    rng: &mut R,
) -> Result<[u64; 3], HarvestError> {
    if (0..3).any(|dim| volume[dim] < crop[dim]) {
        return Err(HarvestError::CropTooLarge { volume, crop });
    }
    let mut origin = [0u64; 3];
    for dim in 0..3 {
        let step = chunk[dim].max(1);
        let positions = (volume[dim] - crop[dim]) / step + 1;
        origin[dim] = rng.gen_range(0..positions) * step;
    }
    Ok(origin)
}

pub fn select_crop<R: Rng>(
    info: &VolumeInfo,
    options: &NeuroglancerOptions,
    rng: &mut R,
) -> Result<CropRegion, HarvestError> {
    let scale = info.scales.get(options.mip).ok_or_else(|| {
        HarvestError::InvalidConfig(format!(
            "mip {} requested but volume has {} scales",
            options.mip,
            info.scales.len()
        ))
    })?;
    relative_key_path(&scale.key)?;
    if scale.sharding.is_some() {
        return Err(HarvestError::UnsupportedSource(format!(
            "sharded precomputed scale {}",
            scale.key
        )));
    }
    let chunk = scale.chunk_sizes.first().copied().ok_or_else(|| {
        HarvestError::UnsupportedSource(format!("scale {} lists no chunk size", scale.key))
    })?;
    let relative = choose_crop_origin(scale.size, chunk, options.crop, rng)?;
    let mut origin = [0i64; 3];
    for dim in 0..3 {
        origin[dim] = scale.voxel_offset[dim] + relative[dim] as i64;
    }
    Ok(CropRegion {
        scale_key: scale.key.clone(),
        mip: options.mip,
        origin,
        size: options.crop,
        chunk_size: chunk,
        resolution: scale.resolution,
        encoding: scale.encoding.clone(),
    })
}

/// `gs://bucket/path` becomes the public HTTPS object URL; HTTPS URLs are
/// used as given. The result always ends in `/`.
pub fn volume_base_url(url: &Url) -> Result<Url, HarvestError> {
    let text = match url.scheme() {
        "gs" => {
            let bucket = url.host_str().ok_or_else(|| {
                HarvestError::InvalidSourceUrl(format!("{url}: missing bucket"))
            })?;
            format!("{GCS_ENDPOINT}/{bucket}{}", url.path())
        }
        "https" | "http" => url.to_string(),
        other => {
            return Err(HarvestError::InvalidSourceUrl(format!(
                "{url}: unsupported scheme {other}"
            )));
        }
    };
    let text = if text.ends_with('/') {
        text
    } else {
        format!("{text}/")
    };
    Url::parse(&text).map_err(|err| HarvestError::InvalidSourceUrl(err.to_string()))
}

pub struct NeuroglancerSource {
    fetcher: HttpFetcher,
    options: NeuroglancerOptions,
}

impl NeuroglancerSource {
    pub fn new(fetcher: HttpFetcher, options: NeuroglancerOptions) -> Self {
        Self { fetcher, options }
    }
}

impl DatasetSource for NeuroglancerSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Neuroglancer
    }

    fn download(
        &self,
        request: &SourceRequest,
        dataset_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        let base = volume_base_url(request.url())?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|err| HarvestError::InvalidSourceUrl(err.to_string()))
        };

        let info_text = self.fetcher.get_text(join("info")?.as_str())?;
        let info: VolumeInfo = serde_json::from_str(&info_text)
            .map_err(|err| HarvestError::UnsupportedSource(format!("{base}info: {err}")))?;

        let mut rng = match self.options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let crop = select_crop(&info, &self.options, &mut rng)?;
        let scale = &info.scales[self.options.mip];
        let chunks = crop.chunks(scale, info.num_channels.unwrap_or(1));
        tracing::info!(
            url = %request.url(),
            scale = %crop.scale_key,
            origin = ?crop.origin,
            chunks = chunks.len(),
            "crop selected"
        );
        sink.event(ProgressEvent {
            message: format!("{}: {} chunks to fetch", request.dataset(), chunks.len()),
            elapsed: None,
        });

        let mut summary = DownloadSummary::default();
        DatasetStore::write_bytes_atomic(&dataset_dir.join("info"), info_text.as_bytes())?;
        summary.record_file(info_text.len() as u64);
        let crop_json = serde_json::to_vec_pretty(&crop)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        DatasetStore::write_bytes_atomic(&dataset_dir.join("crop.json"), &crop_json)?;

        let store_dir = dataset_dir.join(crop_store_name(request.dataset()));
        DatasetStore::remove_dir_if_exists(&store_dir)?;
        write_crop_store(&store_dir, &info, &crop, request.url())?;

        for chunk in chunks {
            let key = format!("{}/{}", crop.scale_key, chunk.name);
            let result = join(&key).and_then(|url| {
                self.fetcher
                    .download_to(url.as_str(), &store_dir.join(&chunk.store_key))
            });
            match result {
                Ok(bytes) => summary.record_file(bytes),
                Err(err) => summary.record_failure(key, &err),
            }
        }
        Ok(summary)
    }
}
