//! Column-header schema detection driven by an ordered rule table.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::normalize::normalize;
use crate::LogicalField;

const DEFAULT_STREET_PATTERNS: &[&str] = &[
    "nomrue",
    "nom_rue",
    "nom rue",
    "nom de rue",
    "odonyme",
    "street_name",
    "streetname",
    "street name",
    "street",
    "rue",
    "voie",
    "adresse",
    "address",
];

const DEFAULT_NUMBER_PATTERNS: &[&str] = &[
    "nociv",
    "no_civ",
    "no civ",
    "no. civ",
    "civique",
    "civic",
    "numero",
    "house",
    "number",
    "num",
];

const DEFAULT_POSTAL_PATTERNS: &[&str] = &[
    "code_postal",
    "codepostal",
    "code postal",
    "postal",
    "zip",
    "cp",
];

const DEFAULT_SECTOR_PATTERNS: &[&str] = &["secteur", "sector", "district", "quartier", "zone"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaDetectionError {
    #[error("input has no column headers")]
    NoColumns,
    #[error("could not resolve a column for mandatory field `{field}`; observed headers: {headers:?}")]
    Unresolved {
        field: LogicalField,
        headers: Vec<String>,
    },
    #[error("column `{column}` requested for field `{field}` is not present; observed headers: {headers:?}")]
    UnknownColumn {
        field: LogicalField,
        column: String,
        headers: Vec<String>,
    },
    #[error("invalid schema rule table: {0}")]
    InvalidRules(String),
}

/// Ordered header patterns per logical field. Earlier patterns win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaRules {
    patterns: BTreeMap<LogicalField, Vec<String>>,
}

impl Default for SchemaRules {
    fn default() -> Self {
        let mut patterns = BTreeMap::new();
        patterns.insert(LogicalField::Street, to_patterns(DEFAULT_STREET_PATTERNS));
        patterns.insert(LogicalField::Number, to_patterns(DEFAULT_NUMBER_PATTERNS));
        patterns.insert(LogicalField::Postal, to_patterns(DEFAULT_POSTAL_PATTERNS));
        patterns.insert(LogicalField::Sector, to_patterns(DEFAULT_SECTOR_PATTERNS));
        Self { patterns }
    }
}

/// Rule table format understood by [`SchemaRules::from_yaml_str`].
pub const RULES_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct SchemaRulesFile {
    version: u32,
    #[serde(default)]
    fields: BTreeMap<LogicalField, Vec<String>>,
}

impl SchemaRules {
    /// Parse a YAML rule table. Fields the file omits keep the built-in list.
    pub fn from_yaml_str(text: &str) -> Result<Self, SchemaDetectionError> {
        let file: SchemaRulesFile = serde_yaml::from_str(text)
            .map_err(|err| SchemaDetectionError::InvalidRules(err.to_string()))?;
        if file.version != RULES_VERSION {
            return Err(SchemaDetectionError::InvalidRules(format!(
                "unsupported rule table version {} (expected {RULES_VERSION})",
                file.version
            )));
        }
        let mut rules = Self::default();
        for (field, patterns) in file.fields {
            let patterns = patterns
                .iter()
                .map(|p| header_form(p))
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>();
            if patterns.is_empty() {
                return Err(SchemaDetectionError::InvalidRules(format!(
                    "pattern list for `{field}` is empty"
                )));
            }
            rules.patterns.insert(field, patterns);
        }
        Ok(rules)
    }

    pub fn patterns(&self, field: LogicalField) -> &[String] {
        self.patterns
            .get(&field)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Explicit operator-chosen columns that bypass detection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnOverrides {
    pub street: Option<String>,
    pub number: Option<String>,
    pub postal: Option<String>,
    pub sector: Option<String>,
}

impl ColumnOverrides {
    pub fn get(&self, field: LogicalField) -> Option<&str> {
        match field {
            LogicalField::Street => self.street.as_deref(),
            LogicalField::Number => self.number.as_deref(),
            LogicalField::Postal => self.postal.as_deref(),
            LogicalField::Sector => self.sector.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchSource {
    Pattern { pattern: String },
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FieldResolution {
    Resolved { column: String, matched_by: MatchSource },
    Unresolved,
}

impl FieldResolution {
    pub fn column(&self) -> Option<&str> {
        match self {
            FieldResolution::Resolved { column, .. } => Some(column),
            FieldResolution::Unresolved => None,
        }
    }
}

/// Per-field outcome of one detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub headers: Vec<String>,
    pub resolutions: BTreeMap<LogicalField, FieldResolution>,
}

impl DetectionReport {
    pub fn resolution(&self, field: LogicalField) -> &FieldResolution {
        self.resolutions
            .get(&field)
            .unwrap_or(&FieldResolution::Unresolved)
    }

    pub fn into_mapping(self) -> Result<FieldMapping, SchemaDetectionError> {
        let column = |field: LogicalField| self.resolution(field).column().map(str::to_string);
        let required = |field: LogicalField| {
            column(field).ok_or_else(|| SchemaDetectionError::Unresolved {
                field,
                headers: self.headers.clone(),
            })
        };
        Ok(FieldMapping {
            street: required(LogicalField::Street)?,
            number: required(LogicalField::Number)?,
            postal: column(LogicalField::Postal),
            sector: column(LogicalField::Sector),
        })
    }
}

/// Logical field to source column mapping for one import run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub street: String,
    pub number: String,
    pub postal: Option<String>,
    pub sector: Option<String>,
}

impl FieldMapping {
    pub fn column(&self, field: LogicalField) -> Option<&str> {
        match field {
            LogicalField::Street => Some(&self.street),
            LogicalField::Number => Some(&self.number),
            LogicalField::Postal => self.postal.as_deref(),
            LogicalField::Sector => self.sector.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaDetector {
    rules: SchemaRules,
    overrides: ColumnOverrides,
}

impl SchemaDetector {
    pub fn new(rules: SchemaRules) -> Self {
        Self {
            rules,
            overrides: ColumnOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ColumnOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Resolve every logical field against `columns`.
    ///
    /// Overrides are claimed first. Remaining fields resolve in
    /// street, number, postal, sector order: for each pattern in priority
    /// order the leftmost unclaimed column containing it wins.
    pub fn scan(&self, columns: &[String]) -> Result<DetectionReport, SchemaDetectionError> {
        if columns.is_empty() {
            return Err(SchemaDetectionError::NoColumns);
        }

        let forms = columns.iter().map(|c| header_form(c)).collect::<Vec<_>>();
        let mut claimed: HashSet<usize> = HashSet::new();
        let mut resolutions = BTreeMap::new();

        for field in LogicalField::ALL {
            let Some(requested) = self.overrides.get(field) else {
                continue;
            };
            let index = columns
                .iter()
                .position(|c| c == requested)
                .or_else(|| {
                    let wanted = header_form(requested);
                    forms.iter().position(|f| *f == wanted)
                })
                .ok_or_else(|| SchemaDetectionError::UnknownColumn {
                    field,
                    column: requested.to_string(),
                    headers: columns.to_vec(),
                })?;
            claimed.insert(index);
            resolutions.insert(
                field,
                FieldResolution::Resolved {
                    column: columns[index].clone(),
                    matched_by: MatchSource::Override,
                },
            );
        }

        for field in LogicalField::ALL {
            if resolutions.contains_key(&field) {
                continue;
            }
            let resolution = self
                .rules
                .patterns(field)
                .iter()
                .find_map(|pattern| {
                    forms
                        .iter()
                        .enumerate()
                        .find(|(index, form)| !claimed.contains(index) && form.contains(pattern.as_str()))
                        .map(|(index, _)| (index, pattern))
                })
                .map(|(index, pattern)| {
                    claimed.insert(index);
                    FieldResolution::Resolved {
                        column: columns[index].clone(),
                        matched_by: MatchSource::Pattern {
                            pattern: pattern.clone(),
                        },
                    }
                })
                .unwrap_or(FieldResolution::Unresolved);
            debug!(%field, column = ?resolution.column(), "schema field resolution");
            resolutions.insert(field, resolution);
        }

        Ok(DetectionReport {
            headers: columns.to_vec(),
            resolutions,
        })
    }

    pub fn detect(&self, columns: &[String]) -> Result<FieldMapping, SchemaDetectionError> {
        self.scan(columns)?.into_mapping()
    }
}

/// Detect a mapping with the built-in rule table and no overrides.
pub fn detect(columns: &[String]) -> Result<FieldMapping, SchemaDetectionError> {
    SchemaDetector::default().detect(columns)
}

fn header_form(header: &str) -> String {
    normalize(header).to_lowercase()
}

fn to_patterns(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|p| p.to_string()).collect()
}
