//! Core domain model for the perpetual access rights tracker.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "patrack-core";

/// Fixed leading header every ingested record must carry, in order.
pub const CANONICAL_HEADER: [&str; 8] = [
    "Title",
    "Publisher",
    "Platform_YOP",
    "Platform_eISBN",
    "OCN",
    "agreement_code",
    "collection_name",
    "title_metadata_last_modified",
];

pub const TITLE_COLUMN: &str = "Title";
pub const LAST_MODIFIED_COLUMN: &str = "title_metadata_last_modified";
pub const PLATFORM_COLUMN: &str = "Platform";
pub const FILE_NAME_COLUMN: &str = "File_Name";

/// Number of computed columns appended after the institution columns.
pub const TRAILING_COLUMNS: usize = 2;

/// Where an entry came from. Each origin owns one index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    Remote,
    Local,
}

impl Origin {
    pub fn index_table(self) -> &'static str {
        match self {
            Origin::Remote => "remote_file_names",
            Origin::Local => "local_file_names",
        }
    }

    /// Storage-level table name for a logical entry name.
    pub fn table_name(self, name: &str) -> String {
        match self {
            Origin::Remote => name.to_string(),
            Origin::Local => format!("local_{name}"),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Remote => f.write_str("remote"),
            Origin::Local => f.write_str("local"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    pub origin: Origin,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, version: impl Into<String>, origin: Origin) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            origin,
        }
    }

    pub fn table_name(&self) -> String {
        self.origin.table_name(&self.name)
    }
}

/// Where the content for a planned change can be read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceRef {
    Url(String),
    Path(PathBuf),
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Url(url) => f.write_str(url),
            SourceRef::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One `(source, name, version)` triple discovered in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingItem {
    pub source: SourceRef,
    pub name: String,
    pub version: String,
}

/// Ordered listing scanned from the remote catalog page. Never persisted.
pub type RemoteListing = Vec<ListingItem>;

/// A single cell; `None` is a missing value.
pub type Cell = Option<String>;

/// Canonical in-memory table produced by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabularRecord {
    pub header: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl TabularRecord {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|column| column == name)
    }

    /// Columns strictly between the canonical header and the trailing
    /// `Platform`/`File_Name` pair.
    pub fn institution_columns(&self) -> &[String] {
        let start = CANONICAL_HEADER.len();
        let end = self.header.len().saturating_sub(TRAILING_COLUMNS);
        if end <= start {
            return &[];
        }
        &self.header[start..end]
    }

    pub fn institution_mapping(&self) -> Vec<InstitutionColumn> {
        let start = CANONICAL_HEADER.len();
        self.institution_columns()
            .iter()
            .enumerate()
            .map(|(offset, name)| InstitutionColumn {
                name: name.clone(),
                position: start + offset,
            })
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Position of one institution's access column inside a data table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionColumn {
    pub name: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChange {
    pub entry: CatalogEntry,
    pub source: SourceRef,
}

/// Insert/update/delete actions needed to align an index with a listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPlan {
    pub to_insert: Vec<PlannedChange>,
    pub to_update: Vec<PlannedChange>,
    pub to_delete: Vec<CatalogEntry>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.to_insert.len() + self.to_update.len() + self.to_delete.len()
    }

    /// Inserts then updates, in listing order, tagged with the kind of change.
    pub fn upserts(&self) -> impl Iterator<Item = (ChangeKind, &PlannedChange)> {
        self.to_insert
            .iter()
            .map(|change| (ChangeKind::Insert, change))
            .chain(self.to_update.iter().map(|change| (ChangeKind::Update, change)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Known institution names, split by where they were learned from.
///
/// The two sets stay disjoint: a name known remotely is never also kept as a
/// local registration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstitutionRegistry {
    #[serde(default)]
    pub remote: BTreeSet<String>,
    #[serde(default)]
    pub local: BTreeSet<String>,
}

impl InstitutionRegistry {
    pub fn contains(&self, name: &str) -> bool {
        self.remote.contains(name) || self.local.contains(name)
    }

    pub fn set_remote<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remote = names.into_iter().map(Into::into).collect();
        let remote = &self.remote;
        self.local.retain(|name| !remote.contains(name));
    }

    /// Registers local names, returning how many were actually new.
    pub fn add_local<I, S>(&mut self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for name in names {
            let name = name.into();
            if name.trim().is_empty() || self.remote.contains(&name) {
                continue;
            }
            if self.local.insert(name) {
                added += 1;
            }
        }
        added
    }

    pub fn remove_local(&mut self, name: &str) -> bool {
        self.local.remove(name)
    }

    /// Names from `candidates` that neither set knows, in first-seen order.
    /// Blank names are ignored.
    pub fn unknown<'a, I>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut seen = BTreeSet::new();
        candidates
            .into_iter()
            .filter(|name| !name.trim().is_empty() && !self.contains(name))
            .filter(|name| seen.insert(name.to_string()))
            .cloned()
            .collect()
    }

    /// Local then remote names, as offered to an operator choosing an institution.
    pub fn all(&self) -> Vec<String> {
        self.local.iter().chain(self.remote.iter()).cloned().collect()
    }
}
