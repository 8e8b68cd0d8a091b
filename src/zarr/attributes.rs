use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::record::{FIELD_RESOLUTION, FIELD_RESOLUTION_UNIT, MetadataRecord};

/// Attribute names checked, in order, for a resolution value.
pub const RESOLUTION_KEYS: [&str; 3] = ["pixelResolution", "scale", "spacing"];
/// Attribute names checked, in order, for a resolution unit.
pub const UNIT_KEYS: [&str; 3] = ["units", "unit", "resolution_unit"];
/// Prefix for attributes copied verbatim into a record.
pub const ATTRIBUTE_PREFIX: &str = "Attr_";
pub const FIELD_RESOLUTION_NM: &str = "resolution_nm";

/// Resolution/unit guessing over free-form array attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeHeuristics {
    resolution_keys: Vec<String>,
    unit_keys: Vec<String>,
    prefix: String,
}

impl Default for AttributeHeuristics {
    fn default() -> Self {
        Self {
            resolution_keys: RESOLUTION_KEYS.iter().map(|key| key.to_string()).collect(),
            unit_keys: UNIT_KEYS.iter().map(|key| key.to_string()).collect(),
            prefix: ATTRIBUTE_PREFIX.to_string(),
        }
    }
}

impl AttributeHeuristics {
    pub fn new(resolution_keys: Vec<String>, unit_keys: Vec<String>, prefix: String) -> Self {
        Self {
            resolution_keys,
            unit_keys,
            prefix,
        }
    }

    /// Sets `resolution` from the first resolution key present and
    /// `resolution_unit` from the first unit key present, then copies every
    /// attribute not consumed by those two lookups under the attribute prefix.
    ///
    /// An N5-style `{"dimensions": [...], "unit": "nm"}` resolution value is
    /// split into its dimensions and, when no unit key exists, its unit.
    pub fn apply(&self, attributes: &Map<String, Value>, record: &mut MetadataRecord) {
        let resolution_key = first_present(&self.resolution_keys, attributes);
        let unit_key = first_present(&self.unit_keys, attributes);

        if let Some(key) = resolution_key {
            let (resolution, embedded_unit) = split_resolution(&attributes[key]);
            record.insert(FIELD_RESOLUTION, resolution);
            if let (None, Some(unit)) = (unit_key, embedded_unit) {
                record.insert(FIELD_RESOLUTION_UNIT, unit);
            }
        }
        if let Some(key) = unit_key {
            record.insert(FIELD_RESOLUTION_UNIT, attributes[key].clone());
        }

        for (key, value) in attributes {
            if Some(key.as_str()) == resolution_key || Some(key.as_str()) == unit_key {
                continue;
            }
            record.insert(format!("{}{key}", self.prefix), value.clone());
        }
    }
}

fn first_present<'a>(candidates: &'a [String], attributes: &Map<String, Value>) -> Option<&'a str> {
    candidates
        .iter()
        .map(String::as_str)
        .find(|key| attributes.contains_key(*key))
}

fn split_resolution(value: &Value) -> (Value, Option<Value>) {
    match value {
        Value::Object(map) if map.contains_key("dimensions") => {
            (map["dimensions"].clone(), map.get("unit").cloned())
        }
        other => (other.clone(), None),
    }
}

/// A known dataset whose arrays get a fixed resolution whenever their backing
/// path contains `marker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOverride {
    pub marker: String,
    pub resolution_nm: Vec<f64>,
}

/// Ordered override table; the first matching entry wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionOverrides {
    entries: Vec<ResolutionOverride>,
}

impl ResolutionOverrides {
    pub fn new(entries: Vec<ResolutionOverride>) -> Self {
        Self { entries }
    }

    /// An empty table.
    pub fn none() -> Self {
        Self::default()
    }

    /// The COSEM `recon-2` reconstructions are 4 x 4 x 2.96 nm regardless of
    /// what their attributes say.
    pub fn builtin() -> Self {
        Self::new(vec![ResolutionOverride {
            marker: "recon-2".to_string(),
            resolution_nm: vec![4.0, 4.0, 2.96],
        }])
    }

    pub fn entries(&self) -> &[ResolutionOverride] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, backing_path: &str) -> Option<&ResolutionOverride> {
        self.entries
            .iter()
            .find(|entry| !entry.marker.is_empty() && backing_path.contains(&entry.marker))
    }

    /// Writes `resolution_nm` when an entry matches; returns whether one did.
    pub fn apply(&self, backing_path: &str, record: &mut MetadataRecord) -> bool {
        match self.lookup(backing_path) {
            Some(entry) => {
                record.insert(FIELD_RESOLUTION_NM, entry.resolution_nm.clone());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn first_resolution_key_wins() {
        let mut record = MetadataRecord::new();
        AttributeHeuristics::default().apply(
            &attrs(json!({"spacing": [1, 1, 1], "scale": [2, 2, 2]})),
            &mut record,
        );
        assert_eq!(record.get("resolution"), Some(&json!([2, 2, 2])));
        assert_eq!(record.get("Attr_spacing"), Some(&json!([1, 1, 1])));
        assert!(!record.contains("Attr_scale"));
    }

    #[test]
    fn n5_pixel_resolution_is_split() {
        let mut record = MetadataRecord::new();
        AttributeHeuristics::default().apply(
            &attrs(json!({"pixelResolution": {"dimensions": [4.0, 4.0, 3.0], "unit": "nm"}})),
            &mut record,
        );
        assert_eq!(record.get("resolution"), Some(&json!([4.0, 4.0, 3.0])));
        assert_eq!(record.get("resolution_unit"), Some(&json!("nm")));
    }

    #[test]
    fn empty_marker_never_matches() {
        let overrides = ResolutionOverrides::new(vec![ResolutionOverride {
            marker: String::new(),
            resolution_nm: vec![1.0],
        }]);
        assert!(overrides.lookup("/data/store.zarr/s0").is_none());
    }
}
