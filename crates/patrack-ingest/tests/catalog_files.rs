use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use patrack_core::SourceRef;
use patrack_ingest::{CatalogFetcher, FileFormat, FileIngestor, FormatError};
use patrack_storage::{CatalogSource, NetworkError};

const PAGE_URL: &str = "https://library.example.org/pa/index.html";

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .canonicalize()
        .expect("fixtures root")
}

/// Serves `fixtures/catalog` as if it were published under `/pa/`.
struct FixtureSource;

impl FixtureSource {
    fn path_for(url: &str) -> Result<PathBuf, NetworkError> {
        let relative = url
            .strip_prefix("https://library.example.org/pa/")
            .ok_or_else(|| NetworkError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })?;
        let file = if relative == "index.html" {
            "catalog_page.html"
        } else {
            relative.trim_start_matches("files/")
        };
        Ok(fixtures_root().join("catalog").join(file))
    }
}

#[async_trait]
impl CatalogSource for FixtureSource {
    async fn get_text(&self, url: &str) -> Result<String, NetworkError> {
        let bytes = self.get_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        let path = Self::path_for(url)?;
        std::fs::read(&path).map_err(|_| NetworkError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

#[tokio::test]
async fn fetcher_lists_catalog_files_from_page() {
    let fetcher = CatalogFetcher::new(Arc::new(FixtureSource));
    let listing = fetcher.fetch(PAGE_URL).await.expect("listing");

    let names: Vec<_> = listing.iter().map(|item| item.name.as_str()).collect();
    assert_eq!(names, vec!["ACS", "Wiley"]);
    assert_eq!(listing[1].version, "2021_12_31");
    assert_eq!(
        listing[0].source,
        SourceRef::Url(
            "https://library.example.org/pa/files/CRKN_PARightsTracking_ACS_2022_01_01.csv"
                .to_string()
        )
    );
}

#[tokio::test]
async fn downloaded_catalog_files_parse_and_validate() {
    let fetcher = CatalogFetcher::new(Arc::new(FixtureSource));
    let ingestor = FileIngestor::new();
    let listing = fetcher.fetch(PAGE_URL).await.expect("listing");

    for item in &listing {
        let SourceRef::Url(url) = &item.source else {
            panic!("remote items carry urls");
        };
        let bytes = fetcher.download(&item.source).await.expect("download");
        let format = FileFormat::from_path(url).expect("format");
        let file_name = url.rsplit('/').next().expect("file name");
        let record = ingestor.parse(&bytes, format, file_name).expect("parse");
        ingestor.validate(&record).expect("valid");

        assert_eq!(record.header.last().map(String::as_str), Some("File_Name"));
        assert!(record.rows.iter().all(|row| row.last().and_then(|c| c.as_deref()) == Some(file_name)));
        assert!(record
            .institution_columns()
            .contains(&"Univ. of Prince Edward Island".to_string()));
    }
}

#[tokio::test]
async fn missing_file_surfaces_http_status() {
    let fetcher = CatalogFetcher::new(Arc::new(FixtureSource));
    let err = fetcher
        .fetch("https://elsewhere.example.org/")
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::HttpStatus { status: 404, .. }));
}

#[test]
fn local_file_with_renamed_column_fails_validation() {
    let path = fixtures_root().join("local").join("bad_header.csv");
    let bytes = std::fs::read(&path).expect("fixture");
    let ingestor = FileIngestor::new();
    let record = ingestor
        .parse(&bytes, FileFormat::from_path(&path).expect("format"), "bad_header.csv")
        .expect("parse");

    assert_eq!(
        ingestor.validate(&record),
        Err(FormatError::HeaderMismatch {
            position: 2,
            expected: "Platform_YOP".to_string()
        })
    );
}

#[tokio::test]
async fn downloaded_workbook_reads_the_rights_sheet() {
    let fetcher = CatalogFetcher::new(Arc::new(FixtureSource));
    let file_name = "CRKN_PARightsTracking_Taylor_2023_06_30.xlsx";
    let bytes = fetcher
        .download(&SourceRef::Url(format!(
            "https://library.example.org/pa/files/{file_name}"
        )))
        .await
        .expect("workbook download");

    let ingestor = FileIngestor::new();
    let record = ingestor
        .parse(&bytes, FileFormat::Xlsx, file_name)
        .expect("parse workbook");
    ingestor.validate(&record).expect("valid workbook");

    assert_eq!(
        record.institution_columns(),
        ["Univ. of Prince Edward Island", "Acadia University"]
    );
    assert_eq!(record.rows.len(), 2);
    let first: Vec<Option<&str>> = record.rows[0].iter().map(|cell| cell.as_deref()).collect();
    assert_eq!(
        first,
        vec![
            Some("Chemistry Basics"),
            Some("Taylor & Francis"),
            Some("2019"),
            Some("9780841234567"),
            Some("123456"),
            Some("CRKN-TF-2019"),
            Some("Taylor Books"),
            Some("2022-01-01 09:00:00"),
            Some("Y"),
            Some("N"),
            Some("Taylor"),
            Some(file_name),
        ]
    );
    assert_eq!(record.rows[1][4], None);
    assert_eq!(record.rows[1][7].as_deref(), Some("2023-01-01 12:00:00"));
}

#[test]
fn workbook_without_rights_sheet_is_rejected() {
    let bytes = std::fs::read(fixtures_root().join("local/wrong_sheet.xlsx")).expect("fixture");
    assert_eq!(
        FileIngestor::new().parse(&bytes, FileFormat::Xlsx, "wrong_sheet.xlsx"),
        Err(FormatError::MissingSheet {
            sheet: "PA-Rights".to_string()
        })
    );
}

#[test]
fn workbook_cells_keep_their_absolute_columns() {
    let bytes = std::fs::read(fixtures_root().join("local/shifted_label.xlsx")).expect("fixture");
    assert_eq!(
        FileIngestor::new().parse(&bytes, FileFormat::Xlsx, "shifted_label.xlsx"),
        Err(FormatError::NoPlatform)
    );
}
