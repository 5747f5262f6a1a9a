//! Record preparation: normalize, key, filter and deduplicate raw rows.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::normalize::{build_key, normalize_cell, EMPTY_KEY};
use crate::{FieldMapping, NormalizedAddress, RawRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MissingStreet,
    MissingNumber,
    EmptyKey,
    DuplicateKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    pub row_number: usize,
    pub reason: RejectionReason,
    pub addr_key: Option<String>,
}

/// Non-fatal validation outcome of one preparation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RejectionSummary {
    pub input_rows: usize,
    pub filtered_empty: usize,
    pub duplicates_removed: usize,
    pub rejections: Vec<RowRejection>,
}

impl RejectionSummary {
    pub fn total_rejected(&self) -> usize {
        self.filtered_empty + self.duplicates_removed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PreparedRecords {
    pub records: Vec<NormalizedAddress>,
    pub summary: RejectionSummary,
}

/// Turn raw rows into a deduplicated record set.
///
/// Rows whose street or number is empty are filtered. Among rows sharing an
/// `addr_key` the first in input order is kept.
pub fn prepare(rows: &[RawRow], mapping: &FieldMapping) -> PreparedRecords {
    let mut summary = RejectionSummary {
        input_rows: rows.len(),
        ..Default::default()
    };
    let mut seen: HashSet<String> = HashSet::with_capacity(rows.len());
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let street = extract(row, Some(&mapping.street));
        let number = extract(row, Some(&mapping.number));
        let postal = extract(row, mapping.postal.as_deref());
        let sector = extract(row, mapping.sector.as_deref());

        let addr_key = build_key(&street, &number, non_empty(&postal));

        let reason = if addr_key == EMPTY_KEY {
            Some(RejectionReason::EmptyKey)
        } else if street.is_empty() {
            Some(RejectionReason::MissingStreet)
        } else if number.is_empty() {
            Some(RejectionReason::MissingNumber)
        } else {
            None
        };
        if let Some(reason) = reason {
            debug!(row = row.row_number, ?reason, "dropping row");
            summary.filtered_empty += 1;
            summary.rejections.push(RowRejection {
                row_number: row.row_number,
                reason,
                addr_key: None,
            });
            continue;
        }

        if !seen.insert(addr_key.clone()) {
            debug!(row = row.row_number, %addr_key, "dropping duplicate key");
            summary.duplicates_removed += 1;
            summary.rejections.push(RowRejection {
                row_number: row.row_number,
                reason: RejectionReason::DuplicateKey,
                addr_key: Some(addr_key),
            });
            continue;
        }

        records.push(NormalizedAddress {
            street_name: street.to_lowercase(),
            house_number: number.to_lowercase(),
            postal_code: non_empty(&postal).map(str::to_lowercase),
            sector: non_empty(&sector).map(str::to_lowercase),
            addr_key,
        });
    }

    PreparedRecords { records, summary }
}

fn extract(row: &RawRow, column: Option<&str>) -> String {
    column
        .and_then(|c| row.get(c))
        .map(normalize_cell)
        .unwrap_or_default()
}

fn non_empty(text: &str) -> Option<&str> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CellValue;

    fn mapping() -> FieldMapping {
        FieldMapping {
            street: "nomrue".into(),
            number: "nociv".into(),
            postal: Some("cp".into()),
            sector: Some("secteur".into()),
        }
    }

    fn row(n: usize, street: &str, number: &str) -> RawRow {
        RawRow::new(n)
            .with_cell("nomrue", street)
            .with_cell("nociv", number)
    }

    #[test]
    fn rejection_accounting_counts_empties_and_duplicates() {
        let rows = vec![
            row(2, "Rue A", "1"),
            row(3, "", "2"),
            row(4, "Rue B", "3"),
            row(5, "nan", "4"),
            row(6, "Rue C", "5"),
            row(7, "Rue D", "6"),
            row(8, "RUE A", "1"),
            row(9, "Rue E", "7"),
            row(10, "Rue F", "8"),
            row(11, "Rue G", "9"),
        ];
        let prepared = prepare(&rows, &mapping());
        assert_eq!(prepared.records.len(), 7);
        assert_eq!(prepared.summary.input_rows, 10);
        assert_eq!(prepared.summary.filtered_empty, 2);
        assert_eq!(prepared.summary.duplicates_removed, 1);
        assert_eq!(prepared.summary.total_rejected(), 3);
        assert_eq!(
            prepared.summary.rejections.last(),
            Some(&RowRejection {
                row_number: 8,
                reason: RejectionReason::DuplicateKey,
                addr_key: Some("rue a|1|".into()),
            })
        );
    }

    #[test]
    fn first_occurrence_wins_on_duplicate_keys() {
        let rows = vec![
            row(2, "Rue Émile", "10").with_cell("secteur", "Nord"),
            row(3, "rue emile", "10").with_cell("secteur", "Sud"),
        ];
        let prepared = prepare(&rows, &mapping());
        assert_eq!(prepared.records.len(), 1);
        assert_eq!(prepared.records[0].sector.as_deref(), Some("nord"));
    }

    #[test]
    fn records_carry_normalized_fields() {
        let rows = vec![RawRow::new(2)
            .with_cell("nomrue", "  Rue de l'Église ")
            .with_cell("nociv", CellValue::Float(42.0))
            .with_cell("cp", "h2x 1y4")
            .with_cell("secteur", CellValue::Empty)];
        let prepared = prepare(&rows, &mapping());
        assert_eq!(
            prepared.records,
            vec![NormalizedAddress {
                street_name: "rue de l eglise".into(),
                house_number: "42".into(),
                postal_code: Some("h2x 1y4".into()),
                sector: None,
                addr_key: "rue de l eglise|42|h2x1y4".into(),
            }]
        );
    }

    #[test]
    fn missing_number_and_empty_rows_have_distinct_reasons() {
        let rows = vec![row(2, "Rue A", " "), row(3, "", "")];
        let prepared = prepare(&rows, &mapping());
        assert!(prepared.records.is_empty());
        let reasons = prepared
            .summary
            .rejections
            .iter()
            .map(|r| r.reason)
            .collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![RejectionReason::MissingNumber, RejectionReason::EmptyKey]
        );
    }

    #[test]
    fn unmapped_optional_columns_are_ignored() {
        let mapping = FieldMapping {
            street: "nomrue".into(),
            number: "nociv".into(),
            postal: None,
            sector: None,
        };
        let rows = vec![row(2, "Rue A", "1").with_cell("cp", "H1A 1A1")];
        let prepared = prepare(&rows, &mapping);
        assert_eq!(prepared.records[0].addr_key, "rue a|1|");
        assert_eq!(prepared.records[0].postal_code, None);
    }
}
