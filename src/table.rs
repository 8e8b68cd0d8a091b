use std::io::Write;

use camino::Utf8Path;
use serde_json::Value;
use tempfile::Builder;

use crate::error::HarvestError;
use crate::record::{FIELD_FILE_PATH, MetadataRecord};

/// Records laid out as rows over the union of their fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl MetadataTable {
    /// Columns appear in first-seen order, except `file_path` which is always
    /// last. Missing fields become empty cells.
    pub fn from_records(records: &[MetadataRecord]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if key != FIELD_FILE_PATH && !columns.iter().any(|column| column == key) {
                    columns.push(key.to_string());
                }
            }
        }
        if records.iter().any(|record| record.contains(FIELD_FILE_PATH)) {
            columns.push(FIELD_FILE_PATH.to_string());
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| record.get(column).map(render_cell).unwrap_or_default())
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), HarvestError> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(&self.columns)
            .map_err(|err| HarvestError::Table(err.to_string()))?;
        for row in &self.rows {
            csv.write_record(row)
                .map_err(|err| HarvestError::Table(err.to_string()))?;
        }
        csv.flush().map_err(|err| HarvestError::Table(err.to_string()))
    }

    /// Replaces `path` atomically; a previous table is overwritten.
    pub fn write_to_path(&self, path: &Utf8Path) -> Result<(), HarvestError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        std::fs::create_dir_all(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".metadata-table")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        self.write_csv(&mut temp)?;
        temp.persist(path.as_std_path())
            .map_err(|err| HarvestError::Table(err.to_string()))?;
        tracing::info!(path = %path, rows = self.len(), "metadata table written");
        Ok(())
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
