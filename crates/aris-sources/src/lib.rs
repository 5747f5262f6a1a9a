//! Tabular readers turning municipal address exports into raw rows.

use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use aris_core::{CellValue, RawRow, Table};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "aris-sources";

const DELIMITER_CANDIDATES: [u8; 3] = [b',', b';', b'\t'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabularFormat {
    Delimited,
    Workbook,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported file type `{extension}` for {path}")]
    UnsupportedExtension { path: PathBuf, extension: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing delimited text {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("reading workbook {path}: {message}")]
    Workbook { path: PathBuf, message: String },
    #[error("worksheet `{sheet}` not found in {path}; available: {available:?}")]
    MissingSheet {
        path: PathBuf,
        sheet: String,
        available: Vec<String>,
    },
    #[error("{0} has no header row")]
    Empty(PathBuf),
}

/// Caller choices that readers may honour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub sheet: Option<String>,
    pub delimiter: Option<u8>,
}

pub trait TabularReader: Send + Sync {
    fn format(&self) -> TabularFormat;

    /// Parse file contents already in memory. `path` is only used in errors.
    fn parse(&self, path: &Path, bytes: Vec<u8>) -> Result<Table, SourceError>;

    fn read(&self, path: &Path) -> Result<Table, SourceError> {
        let bytes = fs::read(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(path, bytes)
    }
}

/// Pick a reader from the file extension.
pub fn reader_for_path(
    path: &Path,
    options: &ReadOptions,
) -> Result<Box<dyn TabularReader>, SourceError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "csv" | "tsv" | "txt" => Ok(Box::new(DelimitedReader {
            delimiter: options
                .delimiter
                .or_else(|| (extension == "tsv").then_some(b'\t')),
        })),
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(Box::new(WorkbookReader {
            sheet: options.sheet.clone(),
        })),
        _ => Err(SourceError::UnsupportedExtension {
            path: path.to_path_buf(),
            extension,
        }),
    }
}

pub fn read_table(path: &Path, options: &ReadOptions) -> Result<Table, SourceError> {
    let bytes = fs::read(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_table(path, bytes, options)
}

/// Parse `bytes` with the reader `path`'s extension selects. The file is not reopened.
pub fn parse_table(
    path: &Path,
    bytes: Vec<u8>,
    options: &ReadOptions,
) -> Result<Table, SourceError> {
    let reader = reader_for_path(path, options)?;
    let table = reader.parse(path, bytes)?;
    info!(
        path = %path.display(),
        format = ?reader.format(),
        columns = table.columns.len(),
        rows = table.rows.len(),
        "read tabular input"
    );
    Ok(table)
}

/// CSV-like text with a sniffed or fixed delimiter.
#[derive(Debug, Clone, Default)]
pub struct DelimitedReader {
    pub delimiter: Option<u8>,
}

impl TabularReader for DelimitedReader {
    fn format(&self) -> TabularFormat {
        TabularFormat::Delimited
    }

    fn parse(&self, path: &Path, bytes: Vec<u8>) -> Result<Table, SourceError> {
        let text = decode_text(bytes);
        self.parse_str(&text)
            .map_err(|source| SourceError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| SourceError::Empty(path.to_path_buf()))
    }
}

impl DelimitedReader {
    /// Parse already-decoded text. `Ok(None)` means there was no header line.
    pub fn parse_str(&self, text: &str) -> Result<Option<Table>, csv::Error> {
        let delimiter = self.delimiter.unwrap_or_else(|| sniff_delimiter(text));
        debug!(delimiter = %(delimiter as char).escape_default(), "parsing delimited text");

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut records = reader.records();
        let header = loop {
            match records.next() {
                Some(record) => {
                    let record = record?;
                    if record.iter().any(|field| !field.trim().is_empty()) {
                        break record;
                    }
                }
                None => return Ok(None),
            }
        };
        let columns = unique_headers(header.iter().map(str::to_string));

        let mut rows = Vec::new();
        for record in records {
            let record = record?;
            let row_number = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(rows.len() + 2);
            let mut row = RawRow::new(row_number);
            for (column, field) in columns.iter().zip(record.iter()) {
                let cell = if field.trim().is_empty() {
                    CellValue::Empty
                } else {
                    CellValue::Text(field.to_string())
                };
                row.cells.insert(column.clone(), cell);
            }
            if !row.is_blank() {
                rows.push(row);
            }
        }

        Ok(Some(Table { columns, rows }))
    }
}

/// Spreadsheet workbooks (xlsx, xls, xlsb, ods) via calamine.
#[derive(Debug, Clone, Default)]
pub struct WorkbookReader {
    pub sheet: Option<String>,
}

impl TabularReader for WorkbookReader {
    fn format(&self) -> TabularFormat {
        TabularFormat::Workbook
    }

    fn parse(&self, path: &Path, bytes: Vec<u8>) -> Result<Table, SourceError> {
        let workbook_error = |message: String| SourceError::Workbook {
            path: path.to_path_buf(),
            message,
        };

        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
            .map_err(|e| workbook_error(e.to_string()))?;
        let sheet_names = workbook.sheet_names().to_vec();
        let sheet = match &self.sheet {
            Some(wanted) => sheet_names
                .iter()
                .find(|name| *name == wanted)
                .cloned()
                .ok_or_else(|| SourceError::MissingSheet {
                    path: path.to_path_buf(),
                    sheet: wanted.clone(),
                    available: sheet_names.clone(),
                })?,
            None => sheet_names
                .first()
                .cloned()
                .ok_or_else(|| SourceError::Empty(path.to_path_buf()))?,
        };

        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| workbook_error(format!("sheet `{sheet}`: {e}")))?;
        let (start_row, _) = range.start().unwrap_or((0, 0));

        let mut lines = range
            .rows()
            .enumerate()
            .map(|(idx, cells)| (start_row as usize + idx + 1, cells));
        let header = lines
            .by_ref()
            .find(|(_, cells)| cells.iter().any(|c| cell_value(c).to_text().is_some()))
            .map(|(_, cells)| cells)
            .ok_or_else(|| SourceError::Empty(path.to_path_buf()))?;
        let columns = unique_headers(
            header
                .iter()
                .map(|c| cell_value(c).to_text().unwrap_or_default()),
        );

        let mut rows = Vec::new();
        for (row_number, cells) in lines {
            let mut row = RawRow::new(row_number);
            for (column, cell) in columns.iter().zip(cells.iter()) {
                row.cells.insert(column.clone(), cell_value(cell));
            }
            if !row.is_blank() {
                rows.push(row);
            }
        }

        debug!(sheet = %sheet, rows = rows.len(), "read worksheet");
        Ok(Table { columns, rows })
    }
}

fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::String(s) if s.trim().is_empty() => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(i) => CellValue::Int(*i),
        Data::Float(f) => CellValue::Float(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::Float(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
    }
}

/// Decode file bytes as UTF-8 (dropping a BOM), falling back to Windows-1252.
pub fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => match text.strip_prefix('\u{feff}') {
            Some(stripped) => stripped.to_string(),
            None => text,
        },
        Err(err) => {
            let bytes = err.into_bytes();
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
            decoded.into_owned()
        }
    }
}

/// Most frequent of `,` `;` tab on the first non-empty line; comma on ties.
pub fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default();

    let mut best = b',';
    let mut best_count = 0usize;
    for candidate in DELIMITER_CANDIDATES {
        let count = first_line.bytes().filter(|b| *b == candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Trim headers, name blanks `Unnamed: <index>` and suffix repeats `.1`, `.2`, ...
pub fn unique_headers(raw: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for (index, header) in raw.into_iter().enumerate() {
        let base = match header.trim() {
            "" => format!("Unnamed: {index}"),
            trimmed => trimmed.to_string(),
        };
        let mut candidate = base.clone();
        let mut suffix = 1;
        while seen.contains(&candidate) {
            candidate = format!("{base}.{suffix}");
            suffix += 1;
        }
        seen.insert(candidate.clone());
        out.push(candidate);
    }

    out
}
