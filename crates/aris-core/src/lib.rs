//! Core domain model and pure import stages for ARIS.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod normalize;
pub mod prepare;
pub mod schema;

pub use normalize::{build_key, normalize, normalize_cell, EMPTY_KEY, KEY_DELIMITER};
pub use prepare::{prepare, PreparedRecords, RejectionReason, RejectionSummary, RowRejection};
pub use schema::{
    detect, ColumnOverrides, DetectionReport, FieldMapping, FieldResolution, MatchSource,
    SchemaDetectionError, SchemaDetector, SchemaRules, RULES_VERSION,
};

pub const CRATE_NAME: &str = "aris-core";

/// One raw spreadsheet cell as handed over by a tabular reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl CellValue {
    /// Text rendering of the cell, `None` for empty cells.
    ///
    /// Integral floats drop their fractional part so that a civic number typed
    /// as `123.0` by a workbook reader renders as `123`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Text(s) => Some(s.clone()),
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::Float(f) if !f.is_finite() => None,
            CellValue::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => {
                Some(format!("{}", *f as i64))
            }
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Bool(b) => Some(b.to_string()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

/// One input record keyed by source column header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawRow {
    /// 1-based row number in the source file (the header occupies row 1).
    pub row_number: usize,
    pub cells: BTreeMap<String, CellValue>,
}

impl RawRow {
    pub fn new(row_number: usize) -> Self {
        Self {
            row_number,
            cells: BTreeMap::new(),
        }
    }

    pub fn with_cell(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.cells.insert(column.into(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.get(column)
    }

    pub fn is_blank(&self) -> bool {
        self.cells
            .values()
            .all(|cell| normalize_cell(cell).is_empty())
    }
}

/// Reader output: ordered headers plus the data rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

/// Logical address fields a spreadsheet column can supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalField {
    Street,
    Number,
    Postal,
    Sector,
}

impl LogicalField {
    /// Resolution order used by the schema detector.
    pub const ALL: [LogicalField; 4] = [
        LogicalField::Street,
        LogicalField::Number,
        LogicalField::Postal,
        LogicalField::Sector,
    ];

    pub fn is_mandatory(self) -> bool {
        matches!(self, LogicalField::Street | LogicalField::Number)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogicalField::Street => "street",
            LogicalField::Number => "number",
            LogicalField::Postal => "postal",
            LogicalField::Sector => "sector",
        }
    }
}

impl fmt::Display for LogicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical address unit produced by the record preparer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub street_name: String,
    pub house_number: String,
    pub postal_code: Option<String>,
    pub sector: Option<String>,
    pub addr_key: String,
}

/// Persisted address row, owned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAddress {
    pub street_name: String,
    pub house_number: String,
    pub postal_code: Option<String>,
    pub sector: Option<String>,
    pub addr_key: String,
    pub assigned_to: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters reported after a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImportStats {
    pub total_imported: usize,
    pub preserved_assignments: usize,
    pub new_unassigned: usize,
}

impl ImportStats {
    pub fn new(total_imported: usize, preserved_assignments: usize) -> Self {
        Self {
            total_imported,
            preserved_assignments,
            new_unassigned: total_imported.saturating_sub(preserved_assignments),
        }
    }
}

/// Audit record of one committed import, written alongside the table swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRun {
    pub run_id: Uuid,
    pub city: String,
    pub source_file: String,
    pub source_sha256: String,
    pub stats: ImportStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
