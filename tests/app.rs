mod common;

use std::fs;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8Path;

use common::{TiffSpec, tiff_bytes, utf8_tempdir, write_array};
use img_dataset_harvester::app::{App, HarvestOptions, HarvestStatus, ProgressEvent, ProgressSink};
use img_dataset_harvester::domain::{SourceKind, SourceRequest};
use img_dataset_harvester::error::HarvestError;
use img_dataset_harvester::extract::Extractor;
use img_dataset_harvester::output::JsonOutput;
use img_dataset_harvester::sources::{DatasetSource, DownloadSummary, SourceRegistry};

/// Writes one TIFF into the dataset folder.
struct MockGallery;

impl DatasetSource for MockGallery {
    fn kind(&self) -> SourceKind {
        SourceKind::RenderedGallery
    }

    fn download(
        &self,
        _request: &SourceRequest,
        dataset_dir: &Utf8Path,
        _sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        let bytes = tiff_bytes(&TiffSpec::default());
        fs::write(dataset_dir.join("slice.tif").as_std_path(), &bytes).unwrap();
        let mut summary = DownloadSummary::default();
        summary.record_file(bytes.len() as u64);
        Ok(summary)
    }
}

/// Gets one file and fails on the next.
struct MockListing;

impl DatasetSource for MockListing {
    fn kind(&self) -> SourceKind {
        SourceKind::StaticListing
    }

    fn download(
        &self,
        request: &SourceRequest,
        _dataset_dir: &Utf8Path,
        _sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        let mut summary = DownloadSummary::default();
        summary.record_file(10);
        summary.record_failure(
            format!("{}missing.dm3", request.url()),
            &HarvestError::HttpStatus {
                url: "missing.dm3".to_string(),
                status: 404,
                message: "not found".to_string(),
            },
        );
        Ok(summary)
    }
}

struct MockBucket;

impl DatasetSource for MockBucket {
    fn kind(&self) -> SourceKind {
        SourceKind::ZarrS3
    }

    fn download(
        &self,
        request: &SourceRequest,
        _dataset_dir: &Utf8Path,
        _sink: &dyn ProgressSink,
    ) -> Result<DownloadSummary, HarvestError> {
        Err(HarvestError::NoArraysFound(request.url().to_string()))
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.messages.lock().unwrap().push(event.message);
    }
}

fn mock_app() -> App {
    let mut registry = SourceRegistry::new();
    registry.register(Box::new(MockGallery));
    registry.register(Box::new(MockListing));
    registry.register(Box::new(MockBucket));
    App::new(registry, Extractor::default())
}

fn requests() -> Vec<SourceRequest> {
    [
        "https://cvlab.epfl.ch/data/data-em/",
        "https://ftp.ebi.ac.uk/empiar/world_availability/11759/data/",
        "s3://janelia-cosem-datasets/jrc_mus-nacc-2/jrc_mus-nacc-2.zarr",
        "gs://neuroglancer-janelia-flyem-hemibrain/emdata/raw/jpeg",
    ]
    .into_iter()
    .map(|url| url.parse().unwrap())
    .collect()
}

#[test]
fn harvest_reports_every_source_in_order() {
    let (_temp, root) = utf8_tempdir();
    let save_dir = root.join("saved_datasets");
    let options = HarvestOptions {
        save_dir: save_dir.clone(),
        workers: 2,
    };

    let result = mock_app()
        .harvest(&requests(), &options, &RecordingSink::default())
        .unwrap();
    let statuses: Vec<_> = result.items.iter().map(|item| item.status).collect();
    assert_eq!(
        statuses,
        vec![
            HarvestStatus::Complete,
            HarvestStatus::Partial,
            HarvestStatus::Failed,
            HarvestStatus::Failed,
        ]
    );
    assert_eq!(result.failed(), 2);

    let gallery = &result.items[0];
    assert_eq!(gallery.dataset, "mitochondria-data-em");
    assert_eq!(gallery.files, 1);
    assert!(save_dir.join("mitochondria-data-em/slice.tif").exists());

    let listing = &result.items[1];
    assert_eq!(listing.files, 1);
    assert_eq!(listing.bytes, 10);
    assert_eq!(listing.failures.len(), 1);
    assert!(listing.failures[0].cause.contains("404"));

    assert!(result.items[2].error.as_deref().unwrap().contains("no arrays found"));
    // Nothing registered for neuroglancer volumes.
    assert!(result.items[3].error.as_deref().unwrap().contains("no downloader"));
}

#[test]
fn harvest_with_one_worker_still_runs_everything() {
    let (_temp, root) = utf8_tempdir();
    let options = HarvestOptions {
        save_dir: root.join("out"),
        workers: 1,
    };
    let sink = RecordingSink::default();
    let result = mock_app().harvest(&requests(), &options, &sink).unwrap();
    assert_eq!(result.items.len(), 4);
    // One phase event plus one per source.
    assert_eq!(sink.messages.lock().unwrap().len(), 5);
}

#[test]
fn harvest_then_extract_builds_table() {
    let (_temp, root) = utf8_tempdir();
    let save_dir = root.join("saved_datasets");
    let output = root.join("metadata_table.csv");
    let app = mock_app();
    app.harvest(
        &requests()[..1],
        &HarvestOptions {
            save_dir: save_dir.clone(),
            workers: 1,
        },
        &JsonOutput,
    )
    .unwrap();
    write_array(&save_dir.join("jrc_mus-nacc-2.zarr/recon-2/em/s0"), &[8, 8, 8], None);

    let result = app.extract(&save_dir, &output, &JsonOutput).unwrap();
    assert_eq!(result.records, 2);
    assert!(result.failures.is_empty());

    let csv = fs::read_to_string(output.as_std_path()).unwrap();
    let mut lines = csv.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("dataset_id,format,"));
    assert!(header.ends_with(",file_path"));
    assert_eq!(lines.count(), 2);
}

#[test]
fn extract_of_missing_directory_fails() {
    let (_temp, root) = utf8_tempdir();
    let err = mock_app()
        .extract(&root.join("nothing"), &root.join("t.csv"), &JsonOutput)
        .unwrap_err();
    assert_matches!(err, HarvestError::RootNotFound(_));
    assert!(!root.join("t.csv").exists());
}
