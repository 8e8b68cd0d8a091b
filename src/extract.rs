//! Turns the local dataset tree into metadata records.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::HarvestError;
use crate::formats::{
    DM3_EXTENSIONS, TIFF_EXTENSIONS, extract_dm3_record, extract_tiff_record, has_extension,
};
use crate::record::MetadataRecord;
use crate::store::DatasetStore;
use crate::zarr::{NodeFailure, ZarrWalker, is_store_root};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionOutcome {
    pub records: Vec<MetadataRecord>,
    pub failures: Vec<NodeFailure>,
}

impl ExtractionOutcome {
    fn absorb(&mut self, path: &Utf8Path, result: Result<MetadataRecord, HarvestError>) {
        match result {
            Ok(record) => self.records.push(record),
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "skipping unreadable file");
                self.failures.push(NodeFailure {
                    path: path.to_path_buf(),
                    cause: err.to_string(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Extractor {
    walker: ZarrWalker,
}

impl Extractor {
    pub fn new(walker: ZarrWalker) -> Self {
        Self { walker }
    }

    pub fn walker(&self) -> &ZarrWalker {
        &self.walker
    }

    /// Dataset folders are visited in name order. Within a folder TIFF files
    /// come first, then DM3 files, then array stores.
    pub fn extract(&self, save_dir: &Utf8Path) -> Result<ExtractionOutcome, HarvestError> {
        let store = DatasetStore::new(save_dir);
        let mut outcome = ExtractionOutcome::default();
        for folder in store.dataset_dirs()? {
            self.extract_folder(&folder, &mut outcome)?;
        }
        tracing::info!(
            save_dir = %save_dir,
            records = outcome.records.len(),
            failures = outcome.failures.len(),
            "extraction finished"
        );
        Ok(outcome)
    }

    pub fn extract_folder(
        &self,
        folder: &Utf8Path,
        outcome: &mut ExtractionOutcome,
    ) -> Result<(), HarvestError> {
        let (files, dirs) = list_children(folder)?;

        for path in files.iter().filter(|path| has_extension(path, &TIFF_EXTENSIONS)) {
            outcome.absorb(path, extract_tiff_record(path));
        }
        for path in files.iter().filter(|path| has_extension(path, &DM3_EXTENSIONS)) {
            outcome.absorb(path, extract_dm3_record(path));
        }

        let stores = if is_store_root(folder) {
            vec![folder.to_path_buf()]
        } else {
            dirs.into_iter()
                .filter(|dir| dir.extension() == Some("zarr"))
                .collect()
        };
        for store_root in stores {
            match self.walker.walk(&store_root) {
                Ok(walked) => {
                    outcome.records.extend(walked.records);
                    outcome.failures.extend(walked.failures);
                }
                Err(err) => {
                    tracing::warn!(path = %store_root, error = %err, "skipping unreadable store");
                    outcome.failures.push(NodeFailure {
                        path: store_root,
                        cause: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Sorted (files, directories) directly inside `folder`.
fn list_children(folder: &Utf8Path) -> Result<(Vec<Utf8PathBuf>, Vec<Utf8PathBuf>), HarvestError> {
    let entries =
        fs::read_dir(folder.as_std_path()).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if path.as_std_path().is_dir() {
            dirs.push(path);
        } else {
            files.push(path);
        }
    }
    files.sort();
    dirs.sort();
    Ok((files, dirs))
}
