use std::collections::HashSet;
use std::sync::Arc;

use patrack_core::{ListingItem, RemoteListing, SourceRef};
use patrack_storage::{CatalogSource, NetworkError};
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::{info, warn};

const CATALOG_EXTENSIONS: [&str; 3] = [".xlsx", ".csv", ".tsv"];

/// Splits a catalog file name such as
/// `CRKN_PARightsTracking_ACS_2022_03_29_03.xlsx` into `("ACS", "2022_03_29_03")`.
///
/// Only the trailing path segment is considered and the stem ends at its first
/// `.`. Returns `None` when the stem
/// has fewer than three `_`-separated tokens.
pub fn parse_file_name(path: &str) -> Option<(String, String)> {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = file.split_once('.').map_or(file, |(stem, _)| stem);
    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() < 3 || tokens[2].trim().is_empty() {
        return None;
    }
    Some((tokens[2].to_string(), tokens[3..].join("_")))
}

fn link_path(href: &str) -> &str {
    href.split(['?', '#']).next().unwrap_or(href)
}

fn is_catalog_link(href: &str) -> bool {
    let path = link_path(href).to_ascii_lowercase();
    CATALOG_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Scans anchors on a catalog page and returns one item per entry name, in
/// page order, with hrefs resolved against `page_url`.
pub fn extract_listing(html: &str, page_url: &str) -> RemoteListing {
    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(err) => {
            warn!(error = %err, "invalid anchor selector");
            return Vec::new();
        }
    };
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut listing = Vec::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if !is_catalog_link(href) {
            continue;
        }

        let Some((name, version)) = parse_file_name(link_path(href)) else {
            warn!(href, "catalog link does not follow the file naming convention; skipped");
            continue;
        };
        if !seen.insert(name.clone()) {
            warn!(href, name = %name, "duplicate catalog link ignored");
            continue;
        }

        let url = base
            .as_ref()
            .and_then(|base| base.join(href).ok())
            .map(|url| url.to_string())
            .unwrap_or_else(|| href.to_string());
        listing.push(ListingItem {
            source: SourceRef::Url(url),
            name,
            version,
        });
    }
    listing
}

/// Downloads the catalog page and extracts the remote listing from it.
#[derive(Clone)]
pub struct CatalogFetcher {
    source: Arc<dyn CatalogSource>,
}

impl CatalogFetcher {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self { source }
    }

    pub async fn fetch(&self, url: &str) -> Result<RemoteListing, NetworkError> {
        let html = self.source.get_text(url).await?;
        let listing = extract_listing(&html, url);
        info!(url, entries = listing.len(), "catalog page scanned");
        Ok(listing)
    }

    pub async fn download(&self, source: &SourceRef) -> Result<Vec<u8>, NetworkError> {
        match source {
            SourceRef::Url(url) => self.source.get_bytes(url).await,
            SourceRef::Path(path) => Err(NetworkError::Unexpected {
                url: path.display().to_string(),
                message: "local paths are not downloadable".to_string(),
            }),
        }
    }
}
