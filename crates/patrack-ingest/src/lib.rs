//! Turns catalog files into canonical records and catalog pages into listings.

use std::io::Cursor;
use std::path::Path;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use patrack_core::{
    Cell, TabularRecord, CANONICAL_HEADER, FILE_NAME_COLUMN, PLATFORM_COLUMN, TITLE_COLUMN,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod listing;

pub use listing::{extract_listing, parse_file_name, CatalogFetcher};

pub const CRATE_NAME: &str = "patrack-ingest";

/// Worksheet that carries the rights table in xlsx catalog files.
pub const RIGHTS_SHEET: &str = "PA-Rights";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("no platform listed in the top-left cell")]
    NoPlatform,
    #[error("worksheet {sheet:?} is missing")]
    MissingSheet { sheet: String },
    #[error("unreadable file: {reason}")]
    UnreadableFile { reason: String },
    #[error("unsupported file type {extension:?}")]
    UnsupportedFormat { extension: String },
    /// `position` is zero-based; the message counts columns from A=1.
    #[error("Missing or incorrect header column '{expected}' in column {} (A=1).", .position + 1)]
    HeaderMismatch { position: usize, expected: String },
    #[error("header has {found} columns, at least {required} are required")]
    TooFewColumns { found: usize, required: usize },
    #[error("column {column} has missing values")]
    MissingRequiredData { column: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Xlsx,
    Csv,
    Tsv,
}

impl FileFormat {
    pub fn from_extension(extension: &str) -> Result<Self, FormatError> {
        match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "xlsx" => Ok(FileFormat::Xlsx),
            "csv" => Ok(FileFormat::Csv),
            "tsv" => Ok(FileFormat::Tsv),
            _ => Err(FormatError::UnsupportedFormat {
                extension: extension.to_string(),
            }),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        Self::from_extension(extension)
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Xlsx => "xlsx",
            FileFormat::Csv => "csv",
            FileFormat::Tsv => "tsv",
        }
    }
}

/// Reads xlsx/csv/tsv catalog files into `TabularRecord`s and checks them
/// against the canonical header.
#[derive(Debug, Clone)]
pub struct FileIngestor {
    sheet: String,
}

impl Default for FileIngestor {
    fn default() -> Self {
        Self {
            sheet: RIGHTS_SHEET.to_string(),
        }
    }
}

impl FileIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
        }
    }

    /// Parses raw file content. `file_name` is recorded in the `File_Name`
    /// column of every row.
    pub fn parse(
        &self,
        bytes: &[u8],
        format: FileFormat,
        file_name: &str,
    ) -> Result<TabularRecord, FormatError> {
        let grid = match format {
            FileFormat::Xlsx => self.read_xlsx(bytes)?,
            FileFormat::Csv => read_delimited(bytes, b',')?,
            FileFormat::Tsv => read_delimited(bytes, b'\t')?,
        };
        build_record(grid, file_name)
    }

    pub fn validate(&self, record: &TabularRecord) -> Result<(), FormatError> {
        for (position, (found, expected)) in record.header.iter().zip(CANONICAL_HEADER).enumerate() {
            if found != expected {
                return Err(FormatError::HeaderMismatch {
                    position,
                    expected: expected.to_string(),
                });
            }
        }
        if record.header.len() < CANONICAL_HEADER.len() {
            return Err(FormatError::TooFewColumns {
                found: record.header.len(),
                required: CANONICAL_HEADER.len(),
            });
        }

        let mut required = vec![TITLE_COLUMN.to_string()];
        required.extend(record.institution_columns().iter().cloned());
        for column in required {
            let Some(index) = record.column_index(&column) else {
                continue;
            };
            if record.rows.iter().any(|row| is_blank(row.get(index))) {
                return Err(FormatError::MissingRequiredData { column });
            }
        }
        Ok(())
    }

    fn read_xlsx(&self, bytes: &[u8]) -> Result<Vec<Vec<Cell>>, FormatError> {
        let mut workbook = open_workbook_from_rs::<Xlsx<_>, _>(Cursor::new(bytes)).map_err(|err| {
            FormatError::UnreadableFile {
                reason: err.to_string(),
            }
        })?;

        if !workbook.sheet_names().iter().any(|name| name == &self.sheet) {
            return Err(FormatError::MissingSheet {
                sheet: self.sheet.clone(),
            });
        }
        let range = workbook
            .worksheet_range(&self.sheet)
            .map_err(|err| FormatError::UnreadableFile {
                reason: err.to_string(),
            })?;

        // Keep absolute positions: the label cell is always A1.
        let (row_offset, col_offset) = range
            .start()
            .map(|(row, col)| (row as usize, col as usize))
            .unwrap_or_default();
        let mut grid: Vec<Vec<Cell>> = vec![Vec::new(); row_offset];
        for row in range.rows() {
            let mut cells: Vec<Cell> = vec![None; col_offset];
            cells.extend(row.iter().map(render_xlsx_cell));
            grid.push(cells);
        }
        Ok(grid)
    }
}

fn render_xlsx_cell(cell: &Data) -> Cell {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(value) => non_blank(value),
        Data::Int(value) => Some(value.to_string()),
        Data::Float(value) => Some(render_float(*value)),
        Data::Bool(value) => Some(value.to_string()),
        Data::DateTime(value) => Some(
            value
                .as_datetime()
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| render_float(value.as_f64())),
        ),
        Data::DateTimeIso(value) | Data::DurationIso(value) => non_blank(value),
    }
}

fn render_float(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn read_delimited(bytes: &[u8], delimiter: u8) -> Result<Vec<Vec<Cell>>, FormatError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(bytes);

    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| FormatError::UnreadableFile {
            reason: err.to_string(),
        })?;
        grid.push(record.iter().map(non_blank).collect());
    }
    Ok(grid)
}

fn non_blank(value: &str) -> Cell {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn is_blank(cell: Option<&Cell>) -> bool {
    cell.and_then(|cell| cell.as_deref())
        .map_or(true, |value| value.trim().is_empty())
}

/// Line 0 carries the platform label, line 1 is a banner, line 2 is the
/// header and data follows.
fn build_record(grid: Vec<Vec<Cell>>, file_name: &str) -> Result<TabularRecord, FormatError> {
    let mut lines = grid.into_iter();
    let label_row = lines.next().ok_or_else(|| FormatError::UnreadableFile {
        reason: "file is empty".to_string(),
    })?;
    let platform = label_row
        .into_iter()
        .next()
        .flatten()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .ok_or(FormatError::NoPlatform)?;

    let _banner = lines.next();
    let header_row = lines.next().ok_or_else(|| FormatError::UnreadableFile {
        reason: "missing header row".to_string(),
    })?;

    let mut header: Vec<String> = header_row
        .into_iter()
        .map(|cell| cell.map(|value| value.trim().to_string()).unwrap_or_default())
        .collect();
    while header.last().is_some_and(|column| column.is_empty()) {
        header.pop();
    }
    let width = header.len();

    let rows: Vec<Vec<Cell>> = lines
        .filter(|row| row.iter().any(|cell| cell.is_some()))
        .map(|mut row| {
            row.resize(width, None);
            row.push(Some(platform.clone()));
            row.push(Some(file_name.to_string()));
            row
        })
        .collect();

    header.push(PLATFORM_COLUMN.to_string());
    header.push(FILE_NAME_COLUMN.to_string());
    debug!(platform = %platform, file_name, rows = rows.len(), "parsed catalog file");
    Ok(TabularRecord { header, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_LINE: &str = "Title,Publisher,Platform_YOP,Platform_eISBN,OCN,agreement_code,collection_name,title_metadata_last_modified,UPEI,Acadia";

    fn csv_file(label: &str, rows: &[&str]) -> Vec<u8> {
        let mut text = format!("{label},,\nPerpetual access rights,,\n{HEADER_LINE}\n");
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text.into_bytes()
    }

    #[test]
    fn extensions_map_to_formats_case_insensitively() {
        assert_eq!(FileFormat::from_path("a/b/List.XLSX").unwrap(), FileFormat::Xlsx);
        assert_eq!(FileFormat::from_extension(".tsv").unwrap(), FileFormat::Tsv);
        assert!(matches!(
            FileFormat::from_path("notes.txt"),
            Err(FormatError::UnsupportedFormat { .. })
        ));
        assert!(FileFormat::from_path("no_extension").is_err());
    }

    #[test]
    fn csv_parse_appends_platform_and_file_name() {
        let bytes = csv_file(
            "ACS",
            &[
                "Organic Chemistry,ACS,2019,978,1,C,L,2022-01-01,Y,N",
                ",,,,,,,,,",
                "Short Row,ACS",
            ],
        );
        let record = FileIngestor::new()
            .parse(&bytes, FileFormat::Csv, "acs_list.csv")
            .expect("parse");

        assert_eq!(record.header.len(), 12);
        assert_eq!(record.header[10], "Platform");
        assert_eq!(record.header[11], "File_Name");
        assert_eq!(record.rows.len(), 2);
        assert_eq!(record.rows[0][10].as_deref(), Some("ACS"));
        assert_eq!(record.rows[0][11].as_deref(), Some("acs_list.csv"));
        assert_eq!(record.rows[1].len(), 12);
        assert_eq!(record.rows[1][2], None);
        assert_eq!(record.institution_columns(), ["UPEI", "Acadia"]);
    }

    #[test]
    fn blank_label_cell_means_no_platform() {
        let bytes = csv_file("", &["T,P,Y,I,O,A,C,D,Y,N"]);
        assert_eq!(
            FileIngestor::new().parse(&bytes, FileFormat::Csv, "f.csv"),
            Err(FormatError::NoPlatform)
        );
    }

    #[test]
    fn tsv_uses_tab_delimiter() {
        let text = format!(
            "Wiley\nbanner\n{}\nA Title\tWiley\t2020\t978\t2\tC\tL\t2021-05-05\tY\tY\n",
            HEADER_LINE.replace(',', "\t")
        );
        let record = FileIngestor::new()
            .parse(text.as_bytes(), FileFormat::Tsv, "w.tsv")
            .expect("parse");
        assert_eq!(record.rows.len(), 1);
        assert_eq!(record.rows[0][1].as_deref(), Some("Wiley"));
        FileIngestor::new().validate(&record).expect("valid");
    }

    #[test]
    fn header_mismatch_reports_first_bad_column() {
        let mut record = TabularRecord {
            header: CANONICAL_HEADER.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        };
        record.header[2] = "Year".into();
        let err = FileIngestor::new().validate(&record).unwrap_err();
        assert_eq!(
            err,
            FormatError::HeaderMismatch {
                position: 2,
                expected: "Platform_YOP".into()
            }
        );
        assert_eq!(
            err.to_string(),
            "Missing or incorrect header column 'Platform_YOP' in column 3 (A=1)."
        );
    }

    #[test]
    fn header_positions_are_zero_based() {
        let mut record = TabularRecord {
            header: CANONICAL_HEADER.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        };
        record.header[0] = "Publisher".into();
        assert_eq!(
            FileIngestor::new().validate(&record),
            Err(FormatError::HeaderMismatch {
                position: 0,
                expected: "Title".into()
            })
        );
    }

    #[test]
    fn short_header_reports_a_wrong_column_first() {
        let record = TabularRecord {
            header: vec!["Publisher".into()],
            rows: Vec::new(),
        };
        assert_eq!(
            FileIngestor::new().validate(&record),
            Err(FormatError::HeaderMismatch {
                position: 0,
                expected: "Title".into()
            })
        );
    }

    #[test]
    fn short_header_is_rejected() {
        let record = TabularRecord {
            header: vec!["Title".into(), "Publisher".into()],
            rows: Vec::new(),
        };
        assert!(matches!(
            FileIngestor::new().validate(&record),
            Err(FormatError::TooFewColumns { found: 2, .. })
        ));
    }

    #[test]
    fn missing_titles_and_access_values_are_rejected() {
        let ingestor = FileIngestor::new();
        let no_title = ingestor
            .parse(
                &csv_file("ACS", &[",ACS,2019,978,1,C,L,2022-01-01,Y,N"]),
                FileFormat::Csv,
                "f.csv",
            )
            .expect("parse");
        assert_eq!(
            ingestor.validate(&no_title),
            Err(FormatError::MissingRequiredData {
                column: "Title".into()
            })
        );

        let no_access = ingestor
            .parse(
                &csv_file("ACS", &["Book,ACS,2019,978,1,C,L,2022-01-01,Y,"]),
                FileFormat::Csv,
                "f.csv",
            )
            .expect("parse");
        assert_eq!(
            ingestor.validate(&no_access),
            Err(FormatError::MissingRequiredData {
                column: "Acadia".into()
            })
        );
    }

    #[test]
    fn garbage_xlsx_is_unreadable() {
        assert!(matches!(
            FileIngestor::new().parse(b"not a zip archive", FileFormat::Xlsx, "x.xlsx"),
            Err(FormatError::UnreadableFile { .. })
        ));
    }

    #[test]
    fn floats_render_like_spreadsheet_values() {
        assert_eq!(render_float(2019.0), "2019");
        assert_eq!(render_float(9780841234567.0), "9780841234567");
        assert_eq!(render_float(1.5), "1.5");
    }

    #[test]
    fn label_row_only_file_lacks_header() {
        assert!(matches!(
            FileIngestor::new().parse(b"ACS\n", FileFormat::Csv, "f.csv"),
            Err(FormatError::UnreadableFile { .. })
        ));
    }
}
