use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{SourceKind, SourceRequest};
use crate::error::HarvestError;
use crate::sources::neuroglancer::NeuroglancerOptions;
use crate::zarr::{ResolutionOverride, ResolutionOverrides};

pub const DEFAULT_CONFIG_FILE: &str = "harvest.json";
pub const DEFAULT_SAVE_DIRECTORY: &str = "saved_datasets";
pub const DEFAULT_OUTPUT: &str = "metadata_table.csv";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub save_directory: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub resolution_overrides: Option<Vec<ResolutionOverride>>,
    #[serde(default)]
    pub neuroglancer: Option<NeuroglancerEntry>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub url: String,
    #[serde(default)]
    pub kind: Option<SourceKind>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NeuroglancerEntry {
    #[serde(default)]
    pub crop: Option<[u64; 3]>,
    #[serde(default)]
    pub mip: Option<usize>,
    /// Fixes the crop position; a fresh random crop is chosen when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub save_directory: Utf8PathBuf,
    pub output: Utf8PathBuf,
    pub workers: usize,
    pub sources: Vec<SourceRequest>,
    pub overrides: ResolutionOverrides,
    pub neuroglancer: NeuroglancerOptions,
    pub http_timeout_secs: u64,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            save_directory: Utf8PathBuf::from(DEFAULT_SAVE_DIRECTORY),
            output: Utf8PathBuf::from(DEFAULT_OUTPUT),
            workers: default_workers(),
            sources: Vec::new(),
            overrides: ResolutionOverrides::builtin(),
            neuroglancer: NeuroglancerOptions::default(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(HarvestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but falls back to defaults when no
    /// `harvest.json` exists and no explicit path was given.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        match Self::resolve(path) {
            Err(HarvestError::MissingConfig) => Ok(ResolvedConfig::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let defaults = ResolvedConfig::default();

        let workers = match config.workers {
            Some(0) => {
                return Err(HarvestError::InvalidConfig(
                    "workers must be at least 1".to_string(),
                ));
            }
            Some(workers) => workers,
            None => defaults.workers,
        };

        let sources = config
            .sources
            .into_iter()
            .map(|entry| match entry {
                SourceEntry::Shorthand(value) => value.parse(),
                SourceEntry::Detailed(obj) => match obj.kind {
                    Some(kind) => SourceRequest::new(kind, &obj.url, obj.name),
                    None => {
                        let detected = obj.url.parse::<SourceRequest>()?;
                        SourceRequest::new(detected.kind(), &obj.url, obj.name)
                    }
                },
            })
            .collect::<Result<Vec<_>, HarvestError>>()?;

        let overrides = config
            .resolution_overrides
            .map(ResolutionOverrides::new)
            .unwrap_or(defaults.overrides);

        let neuroglancer = match config.neuroglancer {
            Some(entry) => {
                let crop = entry.crop.unwrap_or(defaults.neuroglancer.crop);
                if crop.contains(&0) {
                    return Err(HarvestError::InvalidConfig(
                        "neuroglancer crop dimensions must be positive".to_string(),
                    ));
                }
                NeuroglancerOptions {
                    crop,
                    mip: entry.mip.unwrap_or(defaults.neuroglancer.mip),
                    seed: entry.seed,
                }
            }
            None => defaults.neuroglancer,
        };

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            save_directory: config
                .save_directory
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.save_directory),
            output: config.output.map(Utf8PathBuf::from).unwrap_or(defaults.output),
            workers,
            sources,
            overrides,
            neuroglancer,
            http_timeout_secs: config
                .http_timeout_secs
                .unwrap_or(defaults.http_timeout_secs),
        })
    }
}

/// One worker per logical CPU, leaving one for the rest of the system.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

pub fn default_sources() -> Vec<String> {
    vec![
        "https://idr.openmicroscopy.org/webclient/img_detail/9846137/?dataset=10740".to_string(),
        "https://ftp.ebi.ac.uk/empiar/world_availability/11759/data/".to_string(),
        "https://cvlab.epfl.ch/data/data-em/".to_string(),
        "s3://janelia-cosem-datasets/jrc_mus-nacc-2/jrc_mus-nacc-2.zarr".to_string(),
        "gs://neuroglancer-janelia-flyem-hemibrain/emdata/raw/jpeg".to_string(),
    ]
}

/// The config written by `imgharvest init`.
pub fn default_config() -> Config {
    Config {
        schema_version: Some(1),
        save_directory: Some(DEFAULT_SAVE_DIRECTORY.to_string()),
        output: Some(DEFAULT_OUTPUT.to_string()),
        workers: None,
        sources: default_sources()
            .into_iter()
            .map(SourceEntry::Shorthand)
            .collect(),
        resolution_overrides: Some(ResolutionOverrides::builtin().entries().to_vec()),
        neuroglancer: Some(NeuroglancerEntry {
            crop: Some(NeuroglancerOptions::default().crop),
            mip: Some(0),
            seed: None,
        }),
        http_timeout_secs: None,
    }
}
