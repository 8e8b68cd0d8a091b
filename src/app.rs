use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::domain::{SourceKind, SourceRequest};
use crate::error::HarvestError;
use crate::extract::Extractor;
use crate::sources::{DownloadFailure, SourceRegistry};
use crate::store::DatasetStore;
use crate::table::MetadataTable;
use crate::zarr::{NodeFailure, WalkOutcome, ZarrWalker};

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub save_dir: Utf8PathBuf,
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStatus {
    Complete,
    /// The source was reached but some files failed.
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestResult {
    pub started_at: String,
    pub finished_at: String,
    pub save_directory: String,
    pub items: Vec<HarvestItemResult>,
}

impl HarvestResult {
    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == HarvestStatus::Failed)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestItemResult {
    pub url: String,
    pub kind: SourceKind,
    pub dataset: String,
    pub status: HarvestStatus,
    pub files: usize,
    pub bytes: u64,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<DownloadFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractResult {
    pub save_directory: String,
    pub output: String,
    pub records: usize,
    pub columns: usize,
    pub failures: Vec<NodeFailure>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct App {
    registry: SourceRegistry,
    extractor: Extractor,
}

impl App {
    pub fn new(registry: SourceRegistry, extractor: Extractor) -> Self {
        Self {
            registry,
            extractor,
        }
    }

    /// HTTP downloaders plus an extractor using the configured override table.
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, HarvestError> {
        let registry = SourceRegistry::http(
            Duration::from_secs(config.http_timeout_secs),
            config.neuroglancer,
        )?;
        let extractor = Extractor::new(ZarrWalker::new(config.overrides.clone()));
        Ok(Self::new(registry, extractor))
    }

    /// Downloads every source into its own dataset folder, `workers` sources
    /// at a time. A failing source is reported in its item and never stops
    /// the others.
    pub fn harvest(
        &self,
        requests: &[SourceRequest],
        options: &HarvestOptions,
        sink: &dyn ProgressSink,
    ) -> Result<HarvestResult, HarvestError> {
        let started_at = iso_timestamp();
        let store = DatasetStore::new(options.save_dir.clone());
        store.ensure_root()?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Harvest; {} sources, {} workers",
                requests.len(),
                options.workers
            ),
            elapsed: None,
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .build()
            .map_err(|err| HarvestError::WorkerPool(err.to_string()))?;
        let items = pool.install(|| {
            requests
                .par_iter()
                .map(|request| self.harvest_one(request, &store, sink))
                .collect::<Vec<_>>()
        });

        Ok(HarvestResult {
            started_at,
            finished_at: iso_timestamp(),
            save_directory: options.save_dir.to_string(),
            items,
        })
    }

    fn harvest_one(
        &self,
        request: &SourceRequest,
        store: &DatasetStore,
        sink: &dyn ProgressSink,
    ) -> HarvestItemResult {
        let start = Instant::now();
        tracing::info!(url = %request.url(), kind = %request.kind(), dataset = request.dataset(), "harvest started");

        let outcome = self.registry.get(request.kind()).and_then(|source| {
            let dataset_dir = store.ensure_dataset_dir(request.dataset())?;
            source.download(request, &dataset_dir, sink)
        });
        let elapsed = start.elapsed();

        let mut item = HarvestItemResult {
            url: request.url().to_string(),
            kind: request.kind(),
            dataset: request.dataset().to_string(),
            status: HarvestStatus::Complete,
            files: 0,
            bytes: 0,
            elapsed_secs: elapsed.as_secs_f64(),
            failures: Vec::new(),
            error: None,
        };
        match outcome {
            Ok(summary) => {
                if !summary.failures.is_empty() {
                    item.status = HarvestStatus::Partial;
                }
                item.files = summary.files;
                item.bytes = summary.bytes;
                item.failures = summary.failures;
                tracing::info!(
                    dataset = request.dataset(),
                    files = item.files,
                    failed = item.failures.len(),
                    elapsed_secs = item.elapsed_secs,
                    "harvest finished"
                );
            }
            Err(err) => {
                tracing::error!(url = %request.url(), error = %err, "harvest failed");
                item.status = HarvestStatus::Failed;
                item.error = Some(err.to_string());
            }
        }
        sink.event(ProgressEvent {
            message: format!("{}: {:?}", request.dataset(), item.status),
            elapsed: Some(elapsed),
        });
        item
    }

    /// Builds the metadata table for everything under `save_dir` and writes
    /// it to `output`, replacing any previous table.
    pub fn extract(
        &self,
        save_dir: &Utf8Path,
        output: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<ExtractResult, HarvestError> {
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Extract; scanning {save_dir}"),
            elapsed: None,
        });
        let outcome = self.extractor.extract(save_dir)?;
        let table = MetadataTable::from_records(&outcome.records);
        table.write_to_path(output)?;
        sink.event(ProgressEvent {
            message: format!("phase=Write; {} rows to {output}", table.len()),
            elapsed: Some(start.elapsed()),
        });

        Ok(ExtractResult {
            save_directory: save_dir.to_string(),
            output: output.to_string(),
            records: table.len(),
            columns: table.columns().len(),
            failures: outcome.failures,
        })
    }

    pub fn walk(&self, root: &Utf8Path, sink: &dyn ProgressSink) -> Result<WalkOutcome, HarvestError> {
        sink.event(ProgressEvent {
            message: format!("phase=Walk; {root}"),
            elapsed: None,
        });
        self.extractor.walker().walk(root)
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
