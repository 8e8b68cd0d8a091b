use camino::Utf8Path;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

pub const FIELD_DATASET_ID: &str = "dataset_id";
pub const FIELD_FORMAT: &str = "format";
pub const FIELD_SHAPE: &str = "shape";
pub const FIELD_DTYPE: &str = "dtype";
pub const FIELD_NDIMS: &str = "ndims";
pub const FIELD_RESOLUTION: &str = "resolution";
pub const FIELD_RESOLUTION_UNIT: &str = "resolution_unit";
pub const FIELD_FILE_SIZE_MB: &str = "file_size_MB";
pub const FIELD_FILE_PATH: &str = "file_path";

/// One output row: an ordered field map for a single TIFF file, DM3 file or
/// array node. Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataRecord {
    fields: Vec<(String, Value)>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn dataset_id(&self) -> Option<&str> {
        self.get(FIELD_DATASET_ID).and_then(Value::as_str)
    }

    pub fn format(&self) -> Option<&str> {
        self.get(FIELD_FORMAT).and_then(Value::as_str)
    }
}

impl Serialize for MetadataRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// File size in megabytes (10^6 bytes), two decimals.
pub fn file_size_mb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / 1e6)
}

/// Dataset id of a single-file image: the second-to-last dot-separated part
/// of its file name, so `cell.b.tif` gives `b` and `slice.tif` gives
/// `slice`. Names without a dot, or with an empty such part, fall back to
/// the file stem.
pub fn file_dataset_id(path: &Utf8Path) -> String {
    let name = path.file_name().unwrap_or(path.as_str());
    let parts: Vec<&str> = name.split('.').collect();
    match parts.len().checked_sub(2).map(|index| parts[index]) {
        Some(part) if !part.is_empty() => part.to_string(),
        _ => path.file_stem().unwrap_or(name).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn insert_replaces_in_place() {
        let mut record = MetadataRecord::new();
        record.insert(FIELD_DATASET_ID, "a");
        record.insert(FIELD_FORMAT, "ZARR");
        record.insert(FIELD_DATASET_ID, "b");
        assert_eq!(record.keys().collect::<Vec<_>>(), ["dataset_id", "format"]);
        assert_eq!(record.dataset_id(), Some("b"));
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"dataset_id": "b", "format": "ZARR"})
        );
    }

    #[test]
    fn size_in_megabytes() {
        assert_eq!(file_size_mb(2_345_678), "2.35");
        assert_eq!(file_size_mb(0), "0.00");
    }

    #[test]
    fn file_dataset_id_takes_second_to_last_part() {
        assert_eq!(file_dataset_id(Utf8Path::new("data/slice.tif")), "slice");
        assert_eq!(file_dataset_id(Utf8Path::new("data/cell.b.tif")), "b");
        assert_eq!(file_dataset_id(Utf8Path::new("data/README")), "README");
        assert_eq!(file_dataset_id(Utf8Path::new("data/x..dm3")), "x.");
    }
}
