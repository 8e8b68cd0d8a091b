use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::HarvestError;
use crate::record::{
    FIELD_DATASET_ID, FIELD_DTYPE, FIELD_FILE_PATH, FIELD_FORMAT, FIELD_NDIMS, FIELD_SHAPE,
    MetadataRecord,
};
use crate::zarr::attributes::{AttributeHeuristics, ResolutionOverrides};
use crate::zarr::descriptor::ArrayNode;

pub const ZARR_FORMAT: &str = "ZARR";

/// An array node that was found but could not be opened or read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeFailure {
    pub path: Utf8PathBuf,
    pub cause: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WalkOutcome {
    pub records: Vec<MetadataRecord>,
    pub failures: Vec<NodeFailure>,
}

/// Walks an array store and emits one record per array node.
#[derive(Debug, Clone)]
pub struct ZarrWalker {
    heuristics: AttributeHeuristics,
    overrides: ResolutionOverrides,
}

impl Default for ZarrWalker {
    fn default() -> Self {
        Self::new(ResolutionOverrides::builtin())
    }
}

impl ZarrWalker {
    pub fn new(overrides: ResolutionOverrides) -> Self {
        Self {
            heuristics: AttributeHeuristics::default(),
            overrides,
        }
    }

    pub fn with_heuristics(mut self, heuristics: AttributeHeuristics) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn overrides(&self) -> &ResolutionOverrides {
        &self.overrides
    }

    /// Records come back in discovery order: depth-first, siblings sorted by
    /// file name. Nodes that fail to open are logged, listed in
    /// [`WalkOutcome::failures`] and left out of the records.
    pub fn walk(&self, root: &Utf8Path) -> Result<WalkOutcome, HarvestError> {
        check_root(root)?;

        let mut outcome = WalkOutcome::default();
        let (array_dirs, discovery_failures) = discover_arrays(root);
        outcome.failures.extend(discovery_failures);

        for dir in array_dirs {
            match self.extract(root, &dir) {
                Ok(record) => outcome.records.push(record),
                Err(err) => {
                    tracing::warn!(path = %dir, error = %err, "skipping unreadable array node");
                    outcome.failures.push(NodeFailure {
                        path: dir,
                        cause: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            root = %root,
            arrays = outcome.records.len(),
            failures = outcome.failures.len(),
            "array store walked"
        );
        Ok(outcome)
    }

    fn extract(&self, root: &Utf8Path, dir: &Utf8Path) -> Result<MetadataRecord, HarvestError> {
        let node = ArrayNode::open(root, dir)?;
        let descriptor = &node.descriptor;

        let dataset_id = if node.relative_path.is_empty() {
            root.file_name().unwrap_or(root.as_str()).to_string()
        } else {
            node.relative_path.clone()
        };

        let mut record = MetadataRecord::new();
        record.insert(FIELD_DATASET_ID, dataset_id);
        record.insert(FIELD_FORMAT, ZARR_FORMAT);
        record.insert(FIELD_SHAPE, descriptor.shape().to_vec());
        record.insert(FIELD_NDIMS, descriptor.rank());
        record.insert(FIELD_DTYPE, descriptor.dtype_name());
        record.insert("chunks", descriptor.chunks());
        record.insert("compressor", descriptor.compressor_id());
        let filters = descriptor.filter_ids();
        if !filters.is_empty() {
            record.insert("filters", filters);
        }
        record.insert(
            "size",
            descriptor.num_elements().map(Value::from).unwrap_or(Value::Null),
        );
        record.insert("fill_value", descriptor.fill_value());

        self.heuristics.apply(&node.attributes, &mut record);
        if self.overrides.apply(node.backing_path.as_str(), &mut record) {
            tracing::debug!(path = %node.backing_path, "resolution override applied");
        }

        record.insert(FIELD_FILE_PATH, node.backing_path.to_string());
        Ok(record)
    }
}

/// Convenience entry point with the built-in override table.
pub fn extract_zarr_metadata(root: &Utf8Path) -> Result<Vec<MetadataRecord>, HarvestError> {
    ZarrWalker::default().walk(root).map(|outcome| outcome.records)
}

fn check_root(root: &Utf8Path) -> Result<(), HarvestError> {
    let root_path = root.as_std_path().to_path_buf();
    let metadata = fs::metadata(&root_path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => HarvestError::RootNotFound(root_path.clone()),
        _ => HarvestError::RootUnreadable {
            path: root_path.clone(),
            message: err.to_string(),
        },
    })?;
    if !metadata.is_dir() {
        return Err(HarvestError::RootUnreadable {
            path: root.as_std_path().to_path_buf(),
            message: "not a directory".to_string(),
        });
    }
    fs::read_dir(root.as_std_path()).map_err(|err| HarvestError::RootUnreadable {
        path: root.as_std_path().to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(())
}

/// Every directory under `root` (root included) holding an array descriptor.
/// Array directories are not descended into; unreadable directories below the
/// root are reported as failures.
pub fn discover_arrays(root: &Utf8Path) -> (Vec<Utf8PathBuf>, Vec<NodeFailure>) {
    let mut arrays = Vec::new();
    let mut failures = Vec::new();

    let mut entries = WalkDir::new(root.as_std_path())
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .and_then(|path| Utf8Path::from_path(path))
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                tracing::warn!(path = %path, error = %err, "skipping unreadable directory");
                failures.push(NodeFailure {
                    path,
                    cause: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(dir) = Utf8Path::from_path(entry.path()) else {
            let cause = "non-utf8 path".to_string();
            tracing::warn!(path = %entry.path().display(), "skipping non-utf8 directory");
            failures.push(NodeFailure {
                path: Utf8PathBuf::from(entry.path().to_string_lossy().into_owned()),
                cause,
            });
            entries.skip_current_dir();
            continue;
        };
        if ArrayNode::is_array_dir(dir) {
            tracing::debug!(path = %dir, "array node found");
            arrays.push(dir.to_path_buf());
            entries.skip_current_dir();
        }
    }

    (arrays, failures)
}
