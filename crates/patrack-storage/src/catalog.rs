use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use patrack_core::{
    CatalogEntry, Cell, InstitutionColumn, Origin, TabularRecord, CANONICAL_HEADER,
    FILE_NAME_COLUMN, LAST_MODIFIED_COLUMN, PLATFORM_COLUMN,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, error, info};

/// Literal token replaced by a quoted data table name in cross-entry queries.
pub const TABLE_PLACEHOLDER: &str = "{table}";

const METADATA_TABLE: &str = "entry_columns";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS remote_file_names (
    file_name TEXT PRIMARY KEY NOT NULL,
    file_date TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS local_file_names (
    file_name TEXT PRIMARY KEY NOT NULL,
    file_date TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS entry_columns (
    table_name TEXT NOT NULL,
    institution TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (table_name, position)
);
"#;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open catalog database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("changes for {entry} were rolled back: {source}")]
    TransactionFailure {
        entry: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid table identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("{origin} entry {name} is not in the index")]
    EntryNotFound { name: String, origin: Origin },
    #[error("catalog query failed: {0}")]
    Query(#[from] sqlx::Error),
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A data table name that is safe to splice into SQL once quoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableIdent(String);

impl TableIdent {
    pub fn for_entry(entry: &CatalogEntry) -> Result<Self, StoreError> {
        if entry.name.trim().is_empty() {
            return Err(StoreError::InvalidIdentifier(entry.name.clone()));
        }
        Self::new(entry.table_name())
    }

    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        let reserved = [
            Origin::Remote.index_table(),
            Origin::Local.index_table(),
            METADATA_TABLE,
        ]
        .iter()
        .any(|table| table.eq_ignore_ascii_case(&name));

        if name.trim().is_empty()
            || name.contains('\0')
            || reserved
            || name.to_ascii_lowercase().starts_with("sqlite_")
        {
            return Err(StoreError::InvalidIdentifier(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

/// Renders a `title_metadata_last_modified` value as `YYYY-MM-DD`, or `None`
/// when the value is not a recognizable date.
pub fn canonical_date(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.date_naive().format("%Y-%m-%d").to_string());
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed.date().format("%Y-%m-%d").to_string());
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn canonicalize_cell(cell: &Cell) -> Cell {
    cell.as_deref()
        .map(|value| canonical_date(value).unwrap_or_else(|| value.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchField {
    Title,
    Publisher,
    #[serde(rename = "Platform_YOP")]
    PlatformYop,
    #[serde(rename = "Platform_eISBN")]
    PlatformEisbn,
    #[serde(rename = "OCN")]
    Ocn,
}

impl SearchField {
    pub fn column(self) -> &'static str {
        match self {
            SearchField::Title => "Title",
            SearchField::Publisher => "Publisher",
            SearchField::PlatformYop => "Platform_YOP",
            SearchField::PlatformEisbn => "Platform_eISBN",
            SearchField::Ocn => "OCN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTerm {
    pub field: SearchField,
    pub value: String,
}

/// Title/ISBN style lookup for one institution's access rights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub institution: String,
    pub terms: Vec<SearchTerm>,
}

impl SearchRequest {
    pub fn new(institution: impl Into<String>) -> Self {
        Self {
            institution: institution.into(),
            terms: Vec::new(),
        }
    }

    pub fn term(mut self, field: SearchField, value: impl Into<String>) -> Self {
        self.terms.push(SearchTerm {
            field,
            value: value.into(),
        });
        self
    }

    /// Column labels matching the rows `CatalogStore::search` returns.
    pub fn result_columns(&self) -> Vec<String> {
        [self.institution.as_str(), FILE_NAME_COLUMN, PLATFORM_COLUMN]
            .into_iter()
            .chain(CANONICAL_HEADER)
            .map(str::to_string)
            .collect()
    }

    /// Query template with a `{table}` placeholder plus the values to bind.
    pub fn to_template(&self) -> (String, Vec<String>) {
        let selected = self
            .result_columns()
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");

        let mut predicates = Vec::with_capacity(self.terms.len());
        let mut values = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let column = quote_ident(term.field.column());
            if term.value.contains('*') {
                predicates.push(format!("{column} LIKE ?"));
                values.push(term.value.replace('*', "%"));
            } else if term.field == SearchField::Title {
                predicates.push(format!("LOWER({column}) = LOWER(?)"));
                values.push(term.value.clone());
            } else {
                predicates.push(format!("{column} = ?"));
                values.push(term.value.clone());
            }
        }

        let template = format!(
            "SELECT {selected} FROM {TABLE_PLACEHOLDER} WHERE {}",
            predicates.join(" OR ")
        );
        (template, values)
    }
}

/// SQLite-backed catalog: two index tables, one data table per entry and
/// the per-table institution column mapping.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    include_remote: bool,
}

impl CatalogStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let label = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::Open {
                    path: label.clone(),
                    source: sqlx::Error::Io(err),
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options, SqlitePoolOptions::new(), label).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let label = ":memory:".to_string();
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|source| StoreError::Open {
                path: label.clone(),
                source,
            })?;
        // The database lives only as long as its single connection.
        let pool_options = SqlitePoolOptions::new()
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::connect(options, pool_options, label).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        pool_options: SqlitePoolOptions,
        label: String,
    ) -> Result<Self, StoreError> {
        let pool = pool_options
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: label.clone(),
                source,
            })?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|source| StoreError::Open {
                path: label.clone(),
                source,
            })?;
        debug!(database = %label, "catalog store opened");
        Ok(Self {
            pool,
            include_remote: true,
        })
    }

    /// Whether remote data tables take part in cross-entry queries.
    pub fn with_remote_data(mut self, enabled: bool) -> Self {
        self.include_remote = enabled;
        self
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn list_entries(&self, origin: Origin) -> Result<Vec<CatalogEntry>, StoreError> {
        let sql = format!(
            "SELECT file_name, file_date FROM {} ORDER BY rowid",
            origin.index_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|row| entry_from_row(row, origin)).collect()
    }

    pub async fn get_entry(
        &self,
        name: &str,
        origin: Origin,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        let sql = format!(
            "SELECT file_name, file_date FROM {} WHERE file_name = ?",
            origin.index_table()
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| entry_from_row(&row, origin)).transpose()
    }

    /// Data tables named by the index: remote first (when requested), then local.
    pub async fn list_all_tables(&self, include_remote: bool) -> Result<Vec<TableIdent>, StoreError> {
        let mut origins = Vec::with_capacity(2);
        if include_remote {
            origins.push(Origin::Remote);
        }
        origins.push(Origin::Local);

        let mut tables = Vec::new();
        for origin in origins {
            for entry in self.list_entries(origin).await? {
                tables.push(TableIdent::for_entry(&entry)?);
            }
        }
        Ok(tables)
    }

    pub async fn apply_insert(
        &self,
        entry: &CatalogEntry,
        record: &TabularRecord,
    ) -> Result<(), StoreError> {
        let table = TableIdent::for_entry(entry)?;
        let mut tx = self.begin(entry).await?;
        let result = async {
            write_table(&mut tx, &table, record).await?;
            let sql = format!(
                "INSERT INTO {} (file_name, file_date) VALUES (?, ?) \
                 ON CONFLICT(file_name) DO UPDATE SET file_date = excluded.file_date",
                entry.origin.index_table()
            );
            sqlx::query(&sql)
                .bind(&entry.name)
                .bind(&entry.version)
                .execute(&mut *tx)
                .await?;
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish(tx, entry, result).await?;
        info!(entry = %entry.name, origin = %entry.origin, version = %entry.version, rows = record.row_count(), "inserted catalog entry");
        Ok(())
    }

    pub async fn apply_update(
        &self,
        entry: &CatalogEntry,
        record: &TabularRecord,
    ) -> Result<(), StoreError> {
        let table = TableIdent::for_entry(entry)?;
        let mut tx = self.begin(entry).await?;
        let result = async {
            let sql = format!(
                "UPDATE {} SET file_date = ? WHERE file_name = ?",
                entry.origin.index_table()
            );
            let updated = sqlx::query(&sql)
                .bind(&entry.version)
                .bind(&entry.name)
                .execute(&mut *tx)
                .await?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::EntryNotFound {
                    name: entry.name.clone(),
                    origin: entry.origin,
                });
            }
            write_table(&mut tx, &table, record).await?;
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish(tx, entry, result).await?;
        info!(entry = %entry.name, origin = %entry.origin, version = %entry.version, rows = record.row_count(), "replaced catalog entry");
        Ok(())
    }

    pub async fn apply_delete(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        let table = TableIdent::for_entry(entry)?;
        let mut tx = self.begin(entry).await?;
        let result = async {
            let sql = format!(
                "DELETE FROM {} WHERE file_name = ?",
                entry.origin.index_table()
            );
            let deleted = sqlx::query(&sql)
                .bind(&entry.name)
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() == 0 {
                return Err(StoreError::EntryNotFound {
                    name: entry.name.clone(),
                    origin: entry.origin,
                });
            }
            sqlx::query(&format!("DELETE FROM {METADATA_TABLE} WHERE table_name = ?"))
                .bind(table.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
                .execute(&mut *tx)
                .await?;
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish(tx, entry, result).await?;
        info!(entry = %entry.name, origin = %entry.origin, "deleted catalog entry");
        Ok(())
    }

    pub async fn institution_columns(
        &self,
        entry: &CatalogEntry,
    ) -> Result<Vec<InstitutionColumn>, StoreError> {
        let table = TableIdent::for_entry(entry)?;
        self.columns_for_table(&table).await
    }

    async fn columns_for_table(&self, table: &TableIdent) -> Result<Vec<InstitutionColumn>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT institution, position FROM {METADATA_TABLE} WHERE table_name = ? ORDER BY position"
        ))
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<InstitutionColumn, StoreError> {
                let position: i64 = row.try_get("position")?;
                Ok(InstitutionColumn {
                    name: row.try_get("institution")?,
                    position: usize::try_from(position).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Reads an entry's data table back as a record.
    pub async fn read_table(&self, entry: &CatalogEntry) -> Result<TabularRecord, StoreError> {
        let table = TableIdent::for_entry(entry)?;
        if self.get_entry(&entry.name, entry.origin).await?.is_none() {
            return Err(StoreError::EntryNotFound {
                name: entry.name.clone(),
                origin: entry.origin,
            });
        }

        let info = sqlx::query(&format!("PRAGMA table_info({})", table.quoted()))
            .fetch_all(&self.pool)
            .await?;
        let header = info
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()?;

        let rows = sqlx::query(&format!("SELECT * FROM {} ORDER BY rowid", table.quoted()))
            .fetch_all(&self.pool)
            .await?;
        Ok(TabularRecord {
            header,
            rows: rows.iter().map(row_cells).collect::<Result<_, _>>()?,
        })
    }

    /// Runs `template` against every indexed data table that carries an
    /// access column for `institution`, concatenating the resulting rows.
    pub async fn query_across_entries(
        &self,
        template: &str,
        values: &[String],
        institution: &str,
    ) -> Result<Vec<Vec<Cell>>, StoreError> {
        let mut results = Vec::new();
        for table in self.list_all_tables(self.include_remote).await? {
            let columns = self.columns_for_table(&table).await?;
            if !columns.iter().any(|column| column.name == institution) {
                debug!(table = table.as_str(), institution, "table has no column for institution");
                continue;
            }

            let sql = template.replace(TABLE_PLACEHOLDER, &table.quoted());
            let mut query = sqlx::query(&sql);
            for value in values {
                query = query.bind(value.as_str());
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in &rows {
                results.push(row_cells(row)?);
            }
        }
        Ok(results)
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<Vec<Cell>>, StoreError> {
        if request.terms.is_empty() {
            return Ok(Vec::new());
        }
        let (template, values) = request.to_template();
        self.query_across_entries(&template, &values, &request.institution)
            .await
    }

    async fn begin(&self, entry: &CatalogEntry) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|source| StoreError::TransactionFailure {
                entry: entry.name.clone(),
                source,
            })
    }

    async fn finish(
        &self,
        tx: Transaction<'static, Sqlite>,
        entry: &CatalogEntry,
        result: Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        match result {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|source| StoreError::TransactionFailure {
                    entry: entry.name.clone(),
                    source,
                }),
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(entry = %entry.name, error = %rollback, "rollback failed");
                }
                Err(match err {
                    StoreError::Query(source) => StoreError::TransactionFailure {
                        entry: entry.name.clone(),
                        source,
                    },
                    other => other,
                })
            }
        }
    }
}

fn entry_from_row(row: &SqliteRow, origin: Origin) -> Result<CatalogEntry, StoreError> {
    Ok(CatalogEntry {
        name: row.try_get("file_name")?,
        version: row.try_get("file_date")?,
        origin,
    })
}

/// Every stored cell is TEXT or NULL; anything that does not decode as text is
/// reported instead of read as a missing value.
fn row_cells(row: &SqliteRow) -> Result<Vec<Cell>, StoreError> {
    (0..row.len())
        .map(|index| Ok(row.try_get_unchecked::<Option<String>, _>(index)?))
        .collect()
}

async fn write_table(
    tx: &mut Transaction<'static, Sqlite>,
    table: &TableIdent,
    record: &TabularRecord,
) -> Result<(), StoreError> {
    let quoted = table.quoted();
    let width = record.header.len();
    if width == 0 {
        return Err(StoreError::InvalidIdentifier(table.as_str().to_string()));
    }

    sqlx::query(&format!("DROP TABLE IF EXISTS {quoted}"))
        .execute(&mut **tx)
        .await?;
    let definitions = record
        .header
        .iter()
        .map(|column| format!("{} TEXT", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");
    sqlx::query(&format!("CREATE TABLE {quoted} ({definitions})"))
        .execute(&mut **tx)
        .await?;

    let column_list = record
        .header
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; width].join(", ");
    let insert = format!("INSERT INTO {quoted} ({column_list}) VALUES ({placeholders})");
    let last_modified = record.column_index(LAST_MODIFIED_COLUMN);

    for row in &record.rows {
        let mut query = sqlx::query(&insert);
        for index in 0..width {
            let cell = row.get(index).cloned().flatten();
            let value = if Some(index) == last_modified {
                canonicalize_cell(&cell)
            } else {
                cell
            };
            query = query.bind(value);
        }
        query.execute(&mut **tx).await?;
    }

    sqlx::query(&format!("DELETE FROM {METADATA_TABLE} WHERE table_name = ?"))
        .bind(table.as_str())
        .execute(&mut **tx)
        .await?;
    for column in record.institution_mapping() {
        sqlx::query(&format!(
            "INSERT INTO {METADATA_TABLE} (table_name, institution, position) VALUES (?, ?, ?)"
        ))
        .bind(table.as_str())
        .bind(&column.name)
        .bind(column.position as i64)
        .execute(&mut **tx)
        .await?;
    }

    debug!(table = table.as_str(), rows = record.row_count(), "wrote data table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn undecodable_cells_are_reported() {
        let store = CatalogStore::open_in_memory().await.expect("store");
        let entry = CatalogEntry::new("ACS", "2022_01_01", Origin::Remote);
        let mut header: Vec<String> = CANONICAL_HEADER.iter().map(|c| c.to_string()).collect();
        header.extend(["UPEI", PLATFORM_COLUMN, FILE_NAME_COLUMN].map(String::from));
        let mut row: Vec<Cell> = vec![Some("x".into()); header.len()];
        row[0] = Some("Organic Chemistry".into());
        let record = TabularRecord {
            header,
            rows: vec![row],
        };
        store.apply_insert(&entry, &record).await.expect("insert");

        sqlx::query(r#"UPDATE "ACS" SET "Title" = X'FFFE'"#)
            .execute(&store.pool)
            .await
            .expect("corrupt title");

        assert!(matches!(store.read_table(&entry).await, Err(StoreError::Query(_))));
        let search = SearchRequest::new("UPEI").term(SearchField::Publisher, "x");
        assert!(matches!(store.search(&search).await, Err(StoreError::Query(_))));
        store.close().await;
    }

    #[test]
    fn identifiers_are_quoted_with_doubling() {
        assert_eq!(quote_ident("ACS"), "\"ACS\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn reserved_and_blank_identifiers_are_rejected() {
        for name in ["", "  ", "remote_file_names", "ENTRY_COLUMNS", "sqlite_master", "a\0b"] {
            assert!(
                matches!(TableIdent::new(name), Err(StoreError::InvalidIdentifier(_))),
                "{name:?} should be rejected"
            );
        }
        let local = CatalogEntry::new("file_names", "2024_01_01", Origin::Local);
        assert!(TableIdent::for_entry(&local).is_err());
        assert!(TableIdent::new("Robert'); DROP TABLE x;--").is_ok());
    }

    #[test]
    fn dates_canonicalize_to_day_precision() {
        assert_eq!(canonical_date("2023-04-05 13:45:00").as_deref(), Some("2023-04-05"));
        assert_eq!(canonical_date("2023-04-05T13:45:00+02:00").as_deref(), Some("2023-04-05"));
        assert_eq!(canonical_date("2023-04-05").as_deref(), Some("2023-04-05"));
        assert_eq!(canonical_date("last spring"), None);
        assert_eq!(
            canonicalize_cell(&Some("last spring".into())),
            Some("last spring".into())
        );
        assert_eq!(canonicalize_cell(&None), None);
    }

    #[test]
    fn search_template_uses_like_for_wildcards() {
        let request = SearchRequest::new("UPEI")
            .term(SearchField::Title, "Organic Chemistry")
            .term(SearchField::PlatformEisbn, "978*");
        let (template, values) = request.to_template();

        assert!(template.starts_with("SELECT \"UPEI\", \"File_Name\", \"Platform\", \"Title\""));
        assert!(template.contains("FROM {table} WHERE"));
        assert!(template.contains("LOWER(\"Title\") = LOWER(?) OR \"Platform_eISBN\" LIKE ?"));
        assert_eq!(values, vec!["Organic Chemistry".to_string(), "978%".to_string()]);
        assert_eq!(request.result_columns().len(), 11);
    }
}
