use std::fs;

use assert_matches::assert_matches;
use tempfile::TempDir;

use img_dataset_harvester::config::{
    Config, ConfigLoader, NeuroglancerEntry, SourceEntry, SourceEntryObject, default_config,
};
use img_dataset_harvester::domain::SourceKind;
use img_dataset_harvester::error::HarvestError;

#[test]
fn parse_config_shorthand_and_detailed() {
    let config = Config {
        sources: vec![
            SourceEntry::Shorthand("https://cvlab.epfl.ch/data/data-em/".to_string()),
            SourceEntry::Detailed(SourceEntryObject {
                url: "https://example.org/archive/7/data/".to_string(),
                kind: Some(SourceKind::StaticListing),
                name: Some("lab-archive".to_string()),
            }),
            SourceEntry::Detailed(SourceEntryObject {
                url: "s3://bucket/group/store.zarr".to_string(),
                kind: None,
                name: None,
            }),
        ],
        workers: Some(3),
        ..Config::default()
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.workers, 3);
    assert_eq!(resolved.sources.len(), 3);
    assert_eq!(resolved.sources[0].kind(), SourceKind::RenderedGallery);
    assert_eq!(resolved.sources[1].kind(), SourceKind::StaticListing);
    assert_eq!(resolved.sources[1].dataset(), "lab-archive");
    assert_eq!(resolved.sources[2].kind(), SourceKind::ZarrS3);
    assert_eq!(resolved.sources[2].dataset(), "store.zarr");
    assert_eq!(resolved.save_directory, "saved_datasets");
    assert_eq!(resolved.output, "metadata_table.csv");
}

#[test]
fn zero_workers_is_rejected() {
    let config = Config {
        workers: Some(0),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(HarvestError::InvalidConfig(_))
    );
}

#[test]
fn empty_crop_dimension_is_rejected() {
    let config = Config {
        neuroglancer: Some(NeuroglancerEntry {
            crop: Some([1000, 0, 1000]),
            ..NeuroglancerEntry::default()
        }),
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(HarvestError::InvalidConfig(_))
    );
}

#[test]
fn neuroglancer_defaults_fill_missing_fields() {
    let config = Config {
        neuroglancer: Some(NeuroglancerEntry {
            mip: Some(2),
            seed: Some(7),
            ..NeuroglancerEntry::default()
        }),
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.neuroglancer.crop, [1000, 1000, 1000]);
    assert_eq!(resolved.neuroglancer.mip, 2);
    assert_eq!(resolved.neuroglancer.seed, Some(7));
}

#[test]
fn empty_override_list_disables_builtin_table() {
    let builtin = ConfigLoader::resolve_config(Config::default()).unwrap();
    assert!(!builtin.overrides.entries().is_empty());

    let config: Config = serde_json::from_str(r#"{"resolution_overrides": []}"#).unwrap();
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert!(resolved.overrides.entries().is_empty());
}

#[test]
fn bad_source_fails_the_config() {
    let config = Config {
        sources: vec![SourceEntry::Shorthand("https://example.org/x".to_string())],
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(HarvestError::UnsupportedSource(_))
    );
}

#[test]
fn resolve_reads_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("harvest.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "save_directory": "downloads",
            "output": "table.csv",
            "sources": ["gs://bucket/volume"],
            "neuroglancer": {"crop": [64, 64, 32], "mip": 1},
            "http_timeout_secs": 30
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.save_directory, "downloads");
    assert_eq!(resolved.output, "table.csv");
    assert_eq!(resolved.sources[0].kind(), SourceKind::Neuroglancer);
    assert_eq!(resolved.neuroglancer.crop, [64, 64, 32]);
    assert_eq!(resolved.http_timeout_secs, 30);
}

#[test]
fn explicit_missing_file_is_a_read_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(HarvestError::ConfigRead(_))
    );
}

#[test]
fn malformed_file_is_a_parse_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("harvest.json");
    fs::write(&path, "{\"sources\": [").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(HarvestError::ConfigParse(_))
    );
}

#[test]
fn generated_config_round_trips() {
    let json = serde_json::to_string_pretty(&default_config()).unwrap();
    let parsed: Config = serde_json::from_str(&json).unwrap();
    let resolved = ConfigLoader::resolve_config(parsed).unwrap();
    assert_eq!(resolved.sources.len(), SourceKind::ALL.len());
    assert_eq!(resolved.neuroglancer.seed, None);
}
