use crate::spreadsheet::ColumnMapping;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Describes where a batch came from. Stored verbatim in the version history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Opaque origin label, e.g. `"income_2024.xlsx#Sheet1"`.
    pub source_descriptor: String,
    pub column_mapping: Option<ColumnMapping>,
}

impl ImportRequest {
    pub fn new(source_descriptor: impl Into<String>) -> Self {
        Self {
            source_descriptor: source_descriptor.into(),
            column_mapping: None,
        }
    }

    pub fn with_column_mapping(mut self, mapping: ColumnMapping) -> Self {
        self.column_mapping = Some(mapping);
        self
    }
}

/// One entry of the append-only version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub version: u32,
    pub import_timestamp: DateTime<Utc>,
    pub source_descriptor: String,
    pub column_mapping: Option<ColumnMapping>,
    /// Number of candidate rows submitted, including rejected ones.
    pub record_count: usize,
    #[serde(default)]
    pub skipped_rows: usize,
    pub new_contract_ids: BTreeSet<String>,
    pub changed_contract_ids: BTreeSet<String>,
}

impl ImportBatch {
    pub fn imported_count(&self) -> usize {
        self.record_count.saturating_sub(self.skipped_rows)
    }
}

/// A rejected row. `row` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRowError {
    pub row: usize,
    pub reason: String,
}

impl fmt::Display for ImportRowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.row, self.reason)
    }
}

/// What the caller learns from a successful (possibly partial) import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub version: u32,
    pub persisted_count: usize,
    pub new_contract_ids: BTreeSet<String>,
    pub changed_contract_ids: BTreeSet<String>,
    pub import_errors: Vec<ImportRowError>,
}

impl ImportSummary {
    pub fn is_partial(&self) -> bool {
        !self.import_errors.is_empty()
    }
}
