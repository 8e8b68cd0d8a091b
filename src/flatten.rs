//! Flattening of nested tag trees (DM3 tag groups and similar) into a map
//! keyed by the last segment of each leaf's dotted path.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

/// A value inside a [`TagNode`]: a scalar leaf or a nested group.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Leaf(Value),
    Group(TagNode),
}

/// An ordered mapping from tag names to leaves or nested groups.
///
/// Entries keep their insertion order, which is the order the flattener
/// visits them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagNode {
    entries: Vec<(String, TagValue)>,
}

impl TagNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: TagValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn insert_leaf(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.insert(key, TagValue::Leaf(value.into()));
    }

    pub fn insert_group(&mut self, key: impl Into<String>, group: TagNode) {
        self.insert(key, TagValue::Group(group));
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn group(&self, key: &str) -> Option<&TagNode> {
        match self.get(key) {
            Some(TagValue::Group(group)) => Some(group),
            _ => None,
        }
    }

    pub fn leaf(&self, key: &str) -> Option<&Value> {
        match self.get(key) {
            Some(TagValue::Leaf(value)) => Some(value),
            _ => None,
        }
    }

    /// Follows a dotted path of group names, e.g. `ImageData.Calibrations`.
    pub fn group_at(&self, path: &str) -> Option<&TagNode> {
        path.split('.')
            .try_fold(self, |node, segment| node.group(segment))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Value> for TagValue {
    /// JSON objects become groups (in the map's iteration order), anything else a leaf.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                let mut node = TagNode::new();
                for (key, value) in map {
                    node.insert(key, TagValue::from(value));
                }
                TagValue::Group(node)
            }
            other => TagValue::Leaf(other),
        }
    }
}

pub type FlatMetadata = BTreeMap<String, Value>;

pub fn flatten(node: &TagNode) -> FlatMetadata {
    flatten_with_prefix(node, "")
}

/// Depth-first flattening. Each leaf is stored under the last `.` segment of
/// its full path; when two paths collapse to the same short key the one
/// visited later wins.
pub fn flatten_with_prefix(node: &TagNode, prefix: &str) -> FlatMetadata {
    let mut flat = FlatMetadata::new();
    for (key, value) in node.entries() {
        let path = join_key(prefix, key);
        match value {
            TagValue::Group(child) => flat.extend(flatten_with_prefix(child, &path)),
            TagValue::Leaf(leaf) => {
                flat.insert(short_key(&path).to_string(), leaf.clone());
            }
        }
    }
    flat
}

/// Short keys reached by more than one leaf path, i.e. the keys whose value in
/// [`flatten`] output hides at least one other leaf.
pub fn colliding_keys(node: &TagNode) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut collisions = BTreeSet::new();
    collect_short_keys(node, "", &mut seen, &mut collisions);
    collisions
}

fn collect_short_keys(
    node: &TagNode,
    prefix: &str,
    seen: &mut BTreeSet<String>,
    collisions: &mut BTreeSet<String>,
) {
    for (key, value) in node.entries() {
        let path = join_key(prefix, key);
        match value {
            TagValue::Group(child) => collect_short_keys(child, &path, seen, collisions),
            TagValue::Leaf(_) => {
                let short = short_key(&path).to_string();
                if !seen.insert(short.clone()) {
                    collisions.insert(short);
                }
            }
        }
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn short_key(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn prefix_does_not_leak_into_keys() {
        let mut node = TagNode::new();
        node.insert_leaf("Exposure", 0.5);
        let flat = flatten_with_prefix(&node, "Root.Microscope");
        assert_eq!(flat.get("Exposure"), Some(&json!(0.5)));
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn dotted_tag_names_keep_last_segment() {
        let mut node = TagNode::new();
        node.insert_leaf("Zoom.ratio", 2);
        let flat = flatten(&node);
        assert_eq!(flat.get("ratio"), Some(&json!(2)));
    }
}
