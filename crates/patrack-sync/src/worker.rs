use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use patrack_core::{
    CatalogEntry, ChangeKind, InstitutionRegistry, ListingItem, Origin, PlannedChange, SourceRef,
    SyncPlan,
};
use patrack_ingest::{CatalogFetcher, FileFormat, FileIngestor, FormatError};
use patrack_storage::{
    CatalogSource, CatalogStore, DownloadArchive, HttpFetcher, NetworkError, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::confirm::{ConfirmationChannel, Decision, HandshakeKind, HandshakeRequest, HandshakeTicket};
use crate::messages::Message;
use crate::planner::plan;
use crate::SyncConfig;

/// Sub-steps each local file's share of the progress bar is split into.
const LOCAL_FILE_STEPS: u32 = 7;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry file error: {0}")]
    Registry(#[from] serde_yaml::Error),
}

#[derive(Debug)]
pub enum SyncEvent {
    Progress(u8),
    Notice(String),
    Error(String),
    Handshake(HandshakeTicket),
    RegistryUpdated(InstitutionRegistry),
    Finished(SyncOutcome),
}

/// What one run did, reported with `SyncEvent::Finished`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SyncOutcome {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    /// Entries or files that failed and were skipped.
    pub failed: Vec<String>,
    /// Files the operator chose not to upload.
    pub skipped: Vec<String>,
    /// The operator declined the remote change set.
    pub declined: bool,
    /// A network failure stopped the remaining work.
    pub aborted: bool,
}

impl SyncOutcome {
    pub fn applied(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// Ordered, non-blocking event stream from the worker to its observer.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
    last_progress: Option<u8>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                last_progress: None,
            },
            rx,
        )
    }

    fn send(&self, event: SyncEvent) {
        // A departed observer must not stop the run.
        let _ = self.tx.send(event);
    }

    /// Emits a progress value, never going backwards or repeating.
    pub fn progress(&mut self, value: u8) {
        let value = value.min(100);
        if self.last_progress.is_some_and(|last| value <= last) {
            return;
        }
        self.last_progress = Some(value);
        self.send(SyncEvent::Progress(value));
    }

    pub fn notice(&self, text: String) {
        self.send(SyncEvent::Notice(text));
    }

    pub fn error(&self, text: String) {
        self.send(SyncEvent::Error(text));
    }

    pub fn handshake(&self, ticket: HandshakeTicket) {
        self.send(SyncEvent::Handshake(ticket));
    }

    pub fn registry_updated(&self, registry: InstitutionRegistry) {
        self.send(SyncEvent::RegistryUpdated(registry));
    }

    pub fn finished(&self, outcome: SyncOutcome) {
        self.send(SyncEvent::Finished(outcome));
    }
}

pub fn load_registry(path: &Path) -> Result<InstitutionRegistry, SyncError> {
    if !path.exists() {
        return Ok(InstitutionRegistry::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&text)?)
}

pub async fn save_registry(path: &Path, registry: &InstitutionRegistry) -> Result<(), SyncError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_yaml::to_string(registry)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

enum UploadResult {
    Applied { kind: ChangeKind, rows: usize },
    Declined,
}

/// Runs remote syncs and local upload batches on background tasks.
#[derive(Clone)]
pub struct SyncWorker {
    config: SyncConfig,
    source: Arc<dyn CatalogSource>,
    ingestor: FileIngestor,
    confirmations: ConfirmationChannel,
    archive: Option<DownloadArchive>,
    registry: Arc<Mutex<InstitutionRegistry>>,
}

impl SyncWorker {
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Self::with_source(config, Arc::new(fetcher))
    }

    pub fn with_source(config: SyncConfig, source: Arc<dyn CatalogSource>) -> anyhow::Result<Self> {
        let registry = match &config.registry_path {
            Some(path) => load_registry(path)
                .with_context(|| format!("loading institution registry {}", path.display()))?,
            None => InstitutionRegistry::default(),
        };
        Ok(Self {
            confirmations: ConfirmationChannel::new(config.handshake_timeout()),
            archive: config.download_dir.clone().map(DownloadArchive::new),
            ingestor: FileIngestor::new(),
            registry: Arc::new(Mutex::new(registry)),
            source,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn registry(&self) -> InstitutionRegistry {
        self.registry.lock().await.clone()
    }

    pub fn spawn_remote_sync(&self) -> (JoinHandle<SyncOutcome>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (mut sink, events) = EventSink::channel();
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run_remote_sync(&mut sink).await });
        (handle, events)
    }

    pub fn spawn_local_batch(
        &self,
        files: Vec<PathBuf>,
    ) -> (JoinHandle<SyncOutcome>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (mut sink, events) = EventSink::channel();
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run_local_batch(&files, &mut sink).await });
        (handle, events)
    }

    async fn open_store(&self) -> Result<CatalogStore, StoreError> {
        Ok(CatalogStore::open(&self.config.database_path)
            .await?
            .with_remote_data(self.config.allow_remote))
    }

    async fn ask(&self, sink: &EventSink, kind: HandshakeKind) -> Decision {
        let language = self.config.language;
        let prompt = match &kind {
            HandshakeKind::ApplyRemoteChanges { change_count } => Message::ApplyRemoteChanges {
                change_count: *change_count,
            }
            .render(language),
            HandshakeKind::ReplaceLocalEntry { file_name } => {
                Message::ReplaceFile { file_name }.render(language)
            }
            HandshakeKind::AddInstitutions { names } => {
                Message::NewInstitutions { names }.render(language)
            }
        };
        let (ticket, pending) = self.confirmations.open(HandshakeRequest { kind, prompt });
        sink.handshake(ticket);
        match pending.wait().await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "handshake ended without a decision, treating it as a rejection");
                Decision::Reject
            }
        }
    }

    /// Reconciles the remote index with the catalog page. Always ends with
    /// `Progress(100)` and `Finished`.
    pub async fn run_remote_sync(&self, sink: &mut EventSink) -> SyncOutcome {
        let span = info_span!("remote_sync", url = %self.config.catalog_url);
        let outcome = self.remote_sync(sink).instrument(span).await;
        sink.progress(100);
        sink.finished(outcome.clone());
        outcome
    }

    async fn remote_sync(&self, sink: &mut EventSink) -> SyncOutcome {
        let language = self.config.language;
        let mut outcome = SyncOutcome::default();
        sink.progress(0);

        let store = match self.open_store().await {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, "could not open catalog store");
                sink.error(err.to_string());
                outcome.aborted = true;
                return outcome;
            }
        };
        sink.progress(5);

        let fetcher = CatalogFetcher::new(self.source.clone());
        let listing = match fetcher.fetch(&self.config.catalog_url).await {
            Ok(listing) => listing,
            Err(err) => {
                error!(error = %err, "catalog page could not be fetched");
                sink.error(Message::PageFetchFailed(err.kind()).render(language));
                outcome.aborted = true;
                self.finalize_remote(store, sink).await;
                return outcome;
            }
        };
        sink.progress(10);

        let index = match store.list_entries(Origin::Remote).await {
            Ok(index) => index,
            Err(err) => {
                error!(error = %err, "remote index could not be read");
                sink.error(err.to_string());
                outcome.aborted = true;
                self.finalize_remote(store, sink).await;
                return outcome;
            }
        };
        let plan = plan(&listing, &index, Origin::Remote);
        info!(
            inserts = plan.to_insert.len(),
            updates = plan.to_update.len(),
            deletes = plan.to_delete.len(),
            "remote plan computed"
        );
        sink.progress(20);

        if plan.is_empty() {
            sink.notice(Message::CatalogUpToDate.render(language));
        } else {
            let kind = HandshakeKind::ApplyRemoteChanges {
                change_count: plan.change_count(),
            };
            if self.ask(sink, kind).await.is_approved() {
                self.apply_remote_plan(&store, &fetcher, &plan, sink, &mut outcome)
                    .await;
            } else {
                warn!("remote changes declined by operator");
                outcome.declined = true;
            }
        }

        self.finalize_remote(store, sink).await;
        outcome
    }

    async fn apply_remote_plan(
        &self,
        store: &CatalogStore,
        fetcher: &CatalogFetcher,
        plan: &SyncPlan,
        sink: &mut EventSink,
        outcome: &mut SyncOutcome,
    ) {
        let language = self.config.language;
        let upserts: Vec<(ChangeKind, &PlannedChange)> = plan.upserts().collect();
        let total = upserts.len().max(1);

        for (position, (kind, change)) in upserts.iter().enumerate() {
            sink.progress(30 + (position * 60 / total) as u8);
            let file_name = source_file_name(&change.source);
            match self.apply_remote_change(store, fetcher, *kind, change).await {
                Ok(rows) => {
                    info!(entry = %change.entry.name, version = %change.entry.version, rows, "remote entry applied");
                    match kind {
                        ChangeKind::Insert => outcome.inserted.push(change.entry.name.clone()),
                        _ => outcome.updated.push(change.entry.name.clone()),
                    }
                }
                Err(SyncError::Network(err)) => {
                    error!(entry = %change.entry.name, error = %err, "download failed, stopping remote sync");
                    sink.error(Message::DownloadInterrupted(err.kind()).render(language));
                    outcome.failed.push(change.entry.name.clone());
                    outcome.aborted = true;
                    return;
                }
                Err(SyncError::Format(err)) => {
                    error!(entry = %change.entry.name, error = %err, "remote file rejected");
                    let reason = err.to_string();
                    sink.error(
                        Message::RemoteFileRejected {
                            file_name: &file_name,
                            reason: &reason,
                        }
                        .render(language),
                    );
                    outcome.failed.push(change.entry.name.clone());
                }
                Err(err) => {
                    error!(entry = %change.entry.name, error = %err, "remote entry could not be applied");
                    let reason = err.to_string();
                    sink.error(
                        Message::ProcessingError {
                            file_name: &file_name,
                            reason: &reason,
                        }
                        .render(language),
                    );
                    outcome.failed.push(change.entry.name.clone());
                }
            }
        }
        sink.progress(90);

        let deletes = plan.to_delete.len().max(1);
        for (position, entry) in plan.to_delete.iter().enumerate() {
            sink.progress(90 + ((position + 1) * 9 / deletes) as u8);
            match store.apply_delete(entry).await {
                Ok(()) => outcome.deleted.push(entry.name.clone()),
                Err(err) => {
                    error!(entry = %entry.name, error = %err, "remote entry could not be deleted");
                    sink.error(err.to_string());
                    outcome.failed.push(entry.name.clone());
                }
            }
        }
    }

    async fn apply_remote_change(
        &self,
        store: &CatalogStore,
        fetcher: &CatalogFetcher,
        kind: ChangeKind,
        change: &PlannedChange,
    ) -> Result<usize, SyncError> {
        let file_name = source_file_name(&change.source);
        let format = FileFormat::from_path(&file_name)?;
        let bytes = fetcher.download(&change.source).await?;

        if let Some(archive) = &self.archive {
            match archive.store_bytes(&change.entry, format.extension(), &bytes).await {
                Ok(stored) => info!(path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "download archived"),
                Err(err) => warn!(error = %err, "download could not be archived"),
            }
        }

        let record = self.ingestor.parse(&bytes, format, &file_name)?;
        self.ingestor.validate(&record)?;
        match kind {
            ChangeKind::Update => store.apply_update(&change.entry, &record).await?,
            _ => store.apply_insert(&change.entry, &record).await?,
        }
        Ok(record.row_count())
    }

    /// Recomputes the remote institution set, publishes and persists it,
    /// then closes the store.
    async fn finalize_remote(&self, store: CatalogStore, sink: &EventSink) {
        match remote_institutions(&store).await {
            Ok(names) => {
                let snapshot = {
                    let mut registry = self.registry.lock().await;
                    registry.set_remote(names);
                    registry.clone()
                };
                sink.registry_updated(snapshot.clone());
                self.persist_registry(&snapshot, sink).await;
            }
            Err(err) => {
                error!(error = %err, "remote institutions could not be read");
                sink.error(err.to_string());
            }
        }
        store.close().await;
    }

    async fn persist_registry(&self, registry: &InstitutionRegistry, sink: &EventSink) {
        let Some(path) = &self.config.registry_path else {
            return;
        };
        if let Err(err) = save_registry(path, registry).await {
            error!(path = %path.display(), error = %err, "institution registry could not be saved");
            let reason = err.to_string();
            sink.error(Message::RegistrySaveFailed { reason: &reason }.render(self.config.language));
        }
    }

    /// Uploads operator-supplied files into the local index, one at a time.
    pub async fn run_local_batch(&self, files: &[PathBuf], sink: &mut EventSink) -> SyncOutcome {
        let span = info_span!("local_batch", files = files.len());
        let outcome = self.local_batch(files, sink).instrument(span).await;
        sink.progress(100);
        sink.finished(outcome.clone());
        outcome
    }

    async fn local_batch(&self, files: &[PathBuf], sink: &mut EventSink) -> SyncOutcome {
        let language = self.config.language;
        let mut outcome = SyncOutcome::default();
        sink.progress(0);

        let store = match self.open_store().await {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, "could not open catalog store");
                sink.error(err.to_string());
                outcome.aborted = true;
                return outcome;
            }
        };

        let share = 100.0 / files.len().max(1) as f64;
        for (position, path) in files.iter().enumerate() {
            let mut progress = FileProgress {
                base: position as f64 * share,
                share,
                step: 0,
            };
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());

            match self
                .upload_local_file(&store, path, &file_name, sink, &mut progress)
                .await
            {
                Ok(UploadResult::Applied { kind, rows }) => {
                    sink.notice(
                        Message::UploadComplete {
                            file_name: &file_name,
                            rows,
                        }
                        .render(language),
                    );
                    let name = local_entry_name(&file_name);
                    match kind {
                        ChangeKind::Insert => outcome.inserted.push(name),
                        _ => outcome.updated.push(name),
                    }
                }
                Ok(UploadResult::Declined) => {
                    warn!(file = %file_name, "upload declined by operator");
                    sink.error(Message::UploadCancelled { file_name: &file_name }.render(language));
                    outcome.skipped.push(file_name.clone());
                }
                Err(err) => {
                    error!(file = %file_name, error = %err, "local upload failed");
                    let reason = err.to_string();
                    let text = match &err {
                        SyncError::Format(FormatError::UnsupportedFormat { .. }) => {
                            Message::InvalidFileType { file_name: &file_name }
                        }
                        SyncError::Format(_) => Message::InvalidFileFormat {
                            file_name: &file_name,
                            reason: &reason,
                        },
                        _ => Message::ProcessingError {
                            file_name: &file_name,
                            reason: &reason,
                        },
                    };
                    sink.error(text.render(language));
                    outcome.failed.push(file_name.clone());
                }
            }
            sink.progress(((position + 1) as f64 * share) as u8);
        }

        store.close().await;
        outcome
    }

    async fn upload_local_file(
        &self,
        store: &CatalogStore,
        path: &Path,
        file_name: &str,
        sink: &mut EventSink,
        progress: &mut FileProgress,
    ) -> Result<UploadResult, SyncError> {
        let format = FileFormat::from_path(path)?;
        let version = chrono::Local::now().format("%Y_%m_%d").to_string();
        let listing = [ListingItem {
            source: SourceRef::Path(path.to_path_buf()),
            name: local_entry_name(file_name),
            version,
        }];
        let index = store.list_entries(Origin::Local).await?;
        let plan = plan(&listing, &index, Origin::Local);
        let (kind, change) = match plan.upserts().next() {
            Some((kind, change)) => (kind, change.clone()),
            None => return Ok(UploadResult::Declined),
        };
        progress.advance(sink);

        if kind == ChangeKind::Update {
            let replace = HandshakeKind::ReplaceLocalEntry {
                file_name: file_name.to_string(),
            };
            if !self.ask(sink, replace).await.is_approved() {
                return Ok(UploadResult::Declined);
            }
        }
        progress.advance(sink);

        let bytes = tokio::fs::read(path).await?;
        let record = self.ingestor.parse(&bytes, format, file_name)?;
        progress.advance(sink);

        self.ingestor.validate(&record)?;
        progress.advance(sink);

        let unknown = self.registry.lock().await.unknown(record.institution_columns());
        if !unknown.is_empty() {
            let add = HandshakeKind::AddInstitutions {
                names: unknown.clone(),
            };
            if !self.ask(sink, add).await.is_approved() {
                return Ok(UploadResult::Declined);
            }
        }
        progress.advance(sink);

        if !unknown.is_empty() {
            let snapshot = {
                let mut registry = self.registry.lock().await;
                registry.add_local(unknown);
                registry.clone()
            };
            sink.registry_updated(snapshot.clone());
            self.persist_registry(&snapshot, sink).await;
        }
        progress.advance(sink);

        match kind {
            ChangeKind::Update => store.apply_update(&change.entry, &record).await?,
            _ => store.apply_insert(&change.entry, &record).await?,
        }
        progress.advance(sink);
        Ok(UploadResult::Applied {
            kind,
            rows: record.row_count(),
        })
    }

    /// Deletes a local entry chosen by the operator.
    pub async fn remove_local_entry(&self, name: &str) -> Result<CatalogEntry, SyncError> {
        let store = self.open_store().await?;
        let result = async {
            let entry = store
                .get_entry(name, Origin::Local)
                .await?
                .ok_or_else(|| StoreError::EntryNotFound {
                    name: name.to_string(),
                    origin: Origin::Local,
                })?;
            store.apply_delete(&entry).await?;
            Ok::<_, SyncError>(entry)
        }
        .await;
        store.close().await;
        result
    }
}

struct FileProgress {
    base: f64,
    share: f64,
    step: u32,
}

impl FileProgress {
    fn advance(&mut self, sink: &mut EventSink) {
        self.step = (self.step + 1).min(LOCAL_FILE_STEPS);
        let value = self.base + self.share * f64::from(self.step) / f64::from(LOCAL_FILE_STEPS);
        sink.progress(value as u8);
    }
}

/// Local entries are named after the file name up to its first `.`.
fn local_entry_name(file_name: &str) -> String {
    file_name.split('.').next().unwrap_or(file_name).to_string()
}

fn source_file_name(source: &SourceRef) -> String {
    match source {
        SourceRef::Url(url) => {
            let path = url.split(['?', '#']).next().unwrap_or(url);
            path.rsplit('/').next().unwrap_or(path).to_string()
        }
        SourceRef::Path(path) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

async fn remote_institutions(store: &CatalogStore) -> Result<Vec<String>, StoreError> {
    let entries = store.list_entries(Origin::Remote).await?;
    let Some(first) = entries.first() else {
        return Ok(Vec::new());
    };
    Ok(store
        .institution_columns(first)
        .await?
        .into_iter()
        .map(|column| column.name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_names_stop_at_the_first_dot() {
        assert_eq!(local_entry_name("upei_titles.csv"), "upei_titles");
        assert_eq!(local_entry_name("list.v2.xlsx"), "list");
    }

    #[test]
    fn source_file_names_drop_query_strings() {
        let url = SourceRef::Url("https://x.org/files/CRKN_PA_ACS_1.csv?dl=1".into());
        assert_eq!(source_file_name(&url), "CRKN_PA_ACS_1.csv");
        let path = SourceRef::Path(PathBuf::from("/tmp/mine.tsv"));
        assert_eq!(source_file_name(&path), "mine.tsv");
    }

    #[test]
    fn progress_never_moves_backwards() {
        let (mut sink, mut events) = EventSink::channel();
        sink.progress(0);
        sink.progress(30);
        sink.progress(20);
        sink.progress(30);
        sink.progress(250);
        drop(sink);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::Progress(value) = event {
                seen.push(value);
            }
        }
        assert_eq!(seen, vec![0, 30, 100]);
    }

    #[test]
    fn file_progress_splits_a_share_into_seven_steps() {
        let (mut sink, mut events) = EventSink::channel();
        let mut progress = FileProgress {
            base: 50.0,
            share: 50.0,
            step: 0,
        };
        for _ in 0..LOCAL_FILE_STEPS {
            progress.advance(&mut sink);
        }
        drop(sink);

        let mut last = 0;
        while let Ok(SyncEvent::Progress(value)) = events.try_recv() {
            last = value;
        }
        assert_eq!(last, 100);
    }
}
