use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde_json::{Map, Value};
use zarrs_metadata::v2::ArrayMetadataV2;
use zarrs_metadata::v2::array::DataTypeMetadataV2;

use crate::error::HarvestError;

/// Sentinel file marking a directory as an array node.
pub const ARRAY_DESCRIPTOR: &str = ".zarray";
/// Optional user attributes of an array or group.
pub const ATTRIBUTES_FILE: &str = ".zattrs";
pub const GROUP_DESCRIPTOR: &str = ".zgroup";

/// Array metadata as stored in `.zarray` (storage format v2), parsed by
/// `zarrs_metadata`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDescriptor {
    metadata: ArrayMetadataV2,
}

impl ArrayDescriptor {
    pub fn parse(content: &str) -> Result<Self, String> {
        let metadata: ArrayMetadataV2 =
            serde_json::from_str(content).map_err(|err| err.to_string())?;
        if metadata.shape.len() != metadata.chunks.len() {
            return Err(format!(
                "chunk rank {} does not match shape rank {}",
                metadata.chunks.len(),
                metadata.shape.len()
            ));
        }
        Ok(Self { metadata })
    }

    pub fn metadata(&self) -> &ArrayMetadataV2 {
        &self.metadata
    }

    pub fn shape(&self) -> &[u64] {
        &self.metadata.shape
    }

    pub fn chunks(&self) -> Vec<u64> {
        self.metadata.chunks.iter().map(|dim| dim.get()).collect()
    }

    pub fn rank(&self) -> usize {
        self.metadata.shape.len()
    }

    /// Total number of elements; `None` if the product overflows.
    pub fn num_elements(&self) -> Option<u64> {
        self.metadata
            .shape
            .iter()
            .try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
    }

    /// The dtype string, or the JSON of a structured dtype.
    pub fn dtype_name(&self) -> String {
        match &self.metadata.dtype {
            DataTypeMetadataV2::Simple(name) => name.clone(),
            structured => serde_json::to_string(structured).unwrap_or_default(),
        }
    }

    pub fn compressor_id(&self) -> &str {
        self.metadata
            .compressor
            .as_ref()
            .map(|codec| codec.id())
            .unwrap_or("none")
    }

    pub fn filter_ids(&self) -> Vec<&str> {
        self.metadata
            .filters
            .iter()
            .flatten()
            .map(|codec| codec.id())
            .collect()
    }

    /// The fill value as JSON: `"NaN"`, `"Infinity"` and `"-Infinity"` stay
    /// strings, a missing fill value is null.
    pub fn fill_value(&self) -> Value {
        serde_json::to_value(&self.metadata.fill_value).unwrap_or(Value::Null)
    }
}

/// A read-only view of one array node: its descriptor, its attributes and
/// where it lives.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayNode {
    pub relative_path: String,
    pub backing_path: Utf8PathBuf,
    pub descriptor: ArrayDescriptor,
    pub attributes: Map<String, Value>,
}

impl ArrayNode {
    pub fn is_array_dir(dir: &Utf8Path) -> bool {
        dir.join(ARRAY_DESCRIPTOR).as_std_path().is_file()
    }

    pub fn open(root: &Utf8Path, dir: &Utf8Path) -> Result<Self, HarvestError> {
        let descriptor_path = dir.join(ARRAY_DESCRIPTOR);
        let content = fs::read_to_string(descriptor_path.as_std_path()).map_err(|err| {
            HarvestError::InvalidDescriptor {
                path: descriptor_path.clone().into(),
                message: err.to_string(),
            }
        })?;
        let descriptor =
            ArrayDescriptor::parse(&content).map_err(|message| HarvestError::InvalidDescriptor {
                path: descriptor_path.clone().into(),
                message,
            })?;
        let attributes = read_attributes(dir)?;

        let relative_path = dir
            .strip_prefix(root)
            .map(|relative| {
                relative
                    .components()
                    .map(|component| component.as_str())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();

        let backing_path = if relative_path.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&relative_path)
        };

        Ok(Self {
            backing_path,
            relative_path,
            descriptor,
            attributes,
        })
    }
}

/// Reads `.zattrs`; a missing file means no attributes.
pub fn read_attributes(dir: &Utf8Path) -> Result<Map<String, Value>, HarvestError> {
    let path = dir.join(ATTRIBUTES_FILE);
    if !path.as_std_path().exists() {
        return Ok(Map::new());
    }
    let invalid = |message: String| HarvestError::InvalidAttributes {
        path: path.clone().into(),
        message,
    };
    let content = fs::read_to_string(path.as_std_path()).map_err(|err| invalid(err.to_string()))?;
    match serde_json::from_str::<Value>(&content).map_err(|err| invalid(err.to_string()))? {
        Value::Object(map) => Ok(map),
        other => Err(invalid(format!("expected a JSON object, found {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blosc_descriptor() {
        let descriptor = ArrayDescriptor::parse(
            r#"{
                "chunks": [64, 64, 64],
                "compressor": {"id": "blosc", "cname": "lz4", "clevel": 5, "shuffle": 1},
                "dtype": "|u1",
                "fill_value": 0,
                "filters": null,
                "order": "C",
                "shape": [1000, 2000, 3000],
                "zarr_format": 2
            }"#,
        )
        .unwrap();
        assert_eq!(descriptor.rank(), 3);
        assert_eq!(descriptor.num_elements(), Some(6_000_000_000));
        assert_eq!(descriptor.compressor_id(), "blosc");
        assert_eq!(descriptor.dtype_name(), "|u1");
        assert!(descriptor.filter_ids().is_empty());
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let err = ArrayDescriptor::parse(
            r#"{"zarr_format": 2, "shape": [4, 4], "chunks": [4], "dtype": "<f4",
                "compressor": null, "fill_value": null, "order": "C"}"#,
        )
        .unwrap_err();
        assert!(err.contains("rank"));
    }

    #[test]
    fn null_compressor_is_none() {
        let descriptor = ArrayDescriptor::parse(
            r#"{"zarr_format": 2, "shape": [4], "chunks": [2], "dtype": "<f8",
                "compressor": null, "fill_value": "NaN", "order": "C"}"#,
        )
        .unwrap();
        assert_eq!(descriptor.compressor_id(), "none");
        assert_eq!(descriptor.fill_value(), Value::String("NaN".to_string()));
        assert_eq!(descriptor.chunks(), vec![2]);
    }

    #[test]
    fn wrong_format_version_and_zero_chunks_are_rejected() {
        assert!(ArrayDescriptor::parse(
            r#"{"zarr_format": 3, "shape": [4], "chunks": [2], "dtype": "<f8",
                "compressor": null, "fill_value": 0, "order": "C"}"#,
        )
        .is_err());
        assert!(ArrayDescriptor::parse(
            r#"{"zarr_format": 2, "shape": [4], "chunks": [0], "dtype": "<f8",
                "compressor": null, "fill_value": 0, "order": "C"}"#,
        )
        .is_err());
    }

    #[test]
    fn filters_and_structured_dtype() {
        let descriptor = ArrayDescriptor::parse(
            r#"{"zarr_format": 2, "shape": [8], "chunks": [8],
                "dtype": [["a", "<i4"], ["b", "<f8"]],
                "compressor": {"id": "zlib", "level": 1},
                "filters": [{"id": "delta", "dtype": "<i4"}],
                "fill_value": null, "order": "C"}"#,
        )
        .unwrap();
        assert_eq!(descriptor.compressor_id(), "zlib");
        assert_eq!(descriptor.filter_ids(), vec!["delta"]);
        assert_eq!(descriptor.dtype_name(), r#"[["a","<i4"],["b","<f8"]]"#);
        assert_eq!(descriptor.fill_value(), Value::Null);
    }
}
