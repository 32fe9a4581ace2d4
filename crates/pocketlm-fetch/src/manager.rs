//! Resumable model downloads.
//!
//! Each model id gets at most one job, supervised by a [`TaskRegistry`]. A job
//! streams into `<id>.gguf.tmp`, resuming from the temp file's length with a
//! `Range` request, and renames to `<id>.gguf` once the byte count matches the
//! announced total. Pause and cancel are delivered as a [`JobSignal`] and take
//! effect at the next read of the body.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use pocketlm_types::{DownloadEvent, DownloadState, DownloadStatus, ModelDescriptor};
use pocketlm_utils::{TaskControl, TaskRegistry};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::layout::{FileKind, ModelLayout};
use crate::store::DownloadStore;
use crate::transport::{TransferResponse, Transport};

/// Control value a running job observes between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobSignal {
    #[default]
    Run,
    Pause,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Extra attempts when opening the transfer fails with a retryable error.
    pub retry_count: usize,
    pub retry_delay: Duration,
    /// Minimum spacing between progress notifications.
    pub progress_interval: Duration,
    /// Bytes a server may send beyond the announced length.
    pub size_tolerance: u64,
    /// How long cancel/delete wait for a job to notice its signal before
    /// aborting it.
    pub stop_wait: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_secs(2),
            progress_interval: Duration::from_millis(200),
            size_tolerance: 1,
            stop_wait: Duration::from_secs(3),
        }
    }
}

enum Outcome {
    Completed { path: PathBuf, size: u64 },
    Paused { downloaded: u64, total: Option<u64> },
    Cancelled,
}

#[derive(Clone)]
pub struct DownloadManager {
    layout: ModelLayout,
    transport: Arc<dyn Transport>,
    store: DownloadStore,
    jobs: TaskRegistry<JobSignal>,
    config: DownloadConfig,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("dir", &self.layout.dir())
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    pub fn new(layout: ModelLayout, transport: Arc<dyn Transport>) -> Self {
        Self::with_config(layout, transport, DownloadConfig::default())
    }

    pub fn with_config(
        layout: ModelLayout,
        transport: Arc<dyn Transport>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            layout,
            transport,
            store: DownloadStore::new(),
            jobs: TaskRegistry::new("downloads"),
            config,
        }
    }

    pub fn layout(&self) -> &ModelLayout {
        &self.layout
    }

    /// Read-only handle for observers.
    pub fn store(&self) -> &DownloadStore {
        &self.store
    }

    // ── queries ──────────────────────────────────────────────────────────

    /// Path of the finished model file, if it exists.
    pub fn path(&self, model_id: &str) -> Option<PathBuf> {
        let path = self.layout.final_path(model_id);
        path.is_file().then_some(path)
    }

    pub fn is_downloaded(&self, model_id: &str) -> bool {
        self.path(model_id).is_some()
    }

    pub async fn state(&self, model_id: &str) -> DownloadState {
        self.store.get(model_id).await
    }

    pub async fn states(&self) -> Vec<DownloadState> {
        self.store.snapshot().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadState> {
        self.store.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.store.subscribe_events()
    }

    /// Live jobs for `model_id`: 0 or 1.
    pub fn active_jobs(&self, model_id: &str) -> usize {
        self.jobs.count(model_id)
    }

    // ── commands ─────────────────────────────────────────────────────────

    /// Begin (or continue, if a temp file exists) downloading `descriptor`.
    ///
    /// Returns `false` without doing anything when a job for the id is already
    /// running or the model is already on disk.
    pub async fn start(&self, descriptor: &ModelDescriptor) -> Result<bool, FetchError> {
        let id = descriptor.id.as_str();
        ModelLayout::validate_id(id)?;

        if let Some(path) = self.path(id) {
            let size = fs::metadata(&path).await?.len();
            self.store
                .replace(DownloadState::downloaded(id, path, size))
                .await;
            debug!(model_id = %id, "model already downloaded; start ignored");
            return Ok(false);
        }

        if self.jobs.is_running(id) {
            debug!(model_id = %id, "download already in flight; start ignored");
            return Ok(false);
        }

        let offset = file_len(&self.layout.temp_path(id)).await?;
        let hint = (descriptor.size_bytes > 0).then_some(descriptor.size_bytes);

        // The job holds off until `Downloading` is published, so its own
        // writes always land after this one.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let manager = self.clone();
        let job_descriptor = descriptor.clone();
        let spawned = self.jobs.spawn(id, move |control| async move {
            if ready_rx.await.is_ok() {
                manager.run_job(job_descriptor, control).await;
            }
        });

        let Some(task_id) = spawned else {
            debug!(model_id = %id, "another start won the race; start ignored");
            return Ok(false);
        };
        self.store
            .update(id, |s| {
                s.status = DownloadStatus::Downloading;
                s.downloaded_bytes = offset;
                s.total_bytes = s.total_bytes.or(hint);
            })
            .await;
        let _ = ready_tx.send(());
        info!(model_id = %id, task_id, offset, url = %descriptor.download_url, "download started");
        Ok(true)
    }

    /// Ask the job for `model_id` to stop and keep its partial file.
    pub fn pause(&self, model_id: &str) -> bool {
        let signalled = self.jobs.signal(model_id, JobSignal::Pause);
        if signalled {
            info!(model_id = %model_id, "pause requested");
        }
        signalled
    }

    /// Continue a paused or failed download from its temp file.
    pub async fn resume(&self, descriptor: &ModelDescriptor) -> Result<bool, FetchError> {
        // A job that was just paused may still be flushing.
        self.wait_stopped(&descriptor.id).await;
        self.start(descriptor).await
    }

    /// Stop the job for `model_id` and reset its state to `NotDownloaded`.
    pub async fn cancel(&self, model_id: &str, delete_partial: bool) -> Result<(), FetchError> {
        if self.jobs.signal(model_id, JobSignal::Cancel) {
            info!(model_id = %model_id, delete_partial, "cancel requested");
            self.wait_stopped(model_id).await;
        }
        if delete_partial {
            remove_if_exists(&self.layout.temp_path(model_id)).await?;
        }
        self.store.reset(model_id).await;
        Ok(())
    }

    /// Remove both the finished and the partial file for `model_id`.
    pub async fn delete(&self, model_id: &str) -> Result<(), FetchError> {
        ModelLayout::validate_id(model_id)?;
        self.cancel(model_id, true).await?;
        remove_if_exists(&self.layout.final_path(model_id)).await?;
        info!(model_id = %model_id, "model deleted");
        Ok(())
    }

    /// Rebuild the state table from the models directory.
    ///
    /// Finished files become `Downloaded`, temp files `Paused` with an unknown
    /// total. Entries whose files have vanished are reset.
    pub async fn reconcile(&self) -> Result<Vec<DownloadState>, FetchError> {
        let files = self.layout.scan().await?;
        let complete: HashSet<&str> = files
            .iter()
            .filter(|f| f.kind == FileKind::Complete)
            .map(|f| f.model_id.as_str())
            .collect();

        let mut seen = HashSet::new();
        for file in &files {
            seen.insert(file.model_id.clone());
            if self.jobs.is_running(&file.model_id) {
                continue;
            }
            match file.kind {
                FileKind::Complete => {
                    self.store
                        .replace(DownloadState::downloaded(
                            &file.model_id,
                            file.path.clone(),
                            file.len,
                        ))
                        .await;
                }
                FileKind::Partial if complete.contains(file.model_id.as_str()) => {
                    warn!(model_id = %file.model_id, "stale temp file next to finished model");
                }
                FileKind::Partial => {
                    self.store
                        .replace(DownloadState {
                            model_id: file.model_id.clone(),
                            status: DownloadStatus::Paused,
                            downloaded_bytes: file.len,
                            total_bytes: None,
                            local_path: None,
                            error_message: None,
                        })
                        .await;
                }
            }
        }

        for state in self.store.snapshot().await {
            let on_disk = seen.contains(&state.model_id);
            let claims_file = matches!(
                state.status,
                DownloadStatus::Downloaded | DownloadStatus::Paused | DownloadStatus::Downloading
            );
            if claims_file && !on_disk && !self.jobs.is_running(&state.model_id) {
                self.store.reset(&state.model_id).await;
            }
        }

        let states = self.store.snapshot().await;
        info!(dir = %self.layout.dir().display(), models = states.len(), "models directory reconciled");
        Ok(states)
    }

    /// Abort every job. Partial files are kept.
    pub fn shutdown(&self) {
        self.jobs.shutdown();
    }

    // ── job ──────────────────────────────────────────────────────────────

    async fn run_job(self, descriptor: ModelDescriptor, mut control: TaskControl<JobSignal>) {
        let id = descriptor.id.as_str();
        match self.transfer(&descriptor, &mut control).await {
            Ok(Outcome::Completed { path, size }) => {
                info!(model_id = %id, size, path = %path.display(), "download completed");
                self.store
                    .replace(DownloadState::downloaded(id, path, size))
                    .await;
                self.store.emit(DownloadEvent::Completed {
                    model_id: id.to_owned(),
                });
            }
            Ok(Outcome::Paused { downloaded, total }) => {
                info!(model_id = %id, downloaded, "download paused");
                self.store
                    .update(id, |s| {
                        s.status = DownloadStatus::Paused;
                        s.downloaded_bytes = downloaded;
                        if total.is_some() {
                            s.total_bytes = total;
                        }
                    })
                    .await;
            }
            Ok(Outcome::Cancelled) => {
                debug!(model_id = %id, "download job stopped for cancel");
            }
            Err(e) => {
                error!(model_id = %id, error = %e, kind = ?e.kind(), "download failed");
                let message = e.to_string();
                self.store
                    .update(id, |s| {
                        s.status = DownloadStatus::Error;
                        s.error_message = Some(message.clone());
                    })
                    .await;
                self.store.emit(DownloadEvent::Failed {
                    model_id: id.to_owned(),
                    message,
                });
            }
        }
    }

    async fn transfer(
        &self,
        descriptor: &ModelDescriptor,
        control: &mut TaskControl<JobSignal>,
    ) -> Result<Outcome, FetchError> {
        let id = descriptor.id.as_str();
        let url = descriptor.download_url.as_str();
        let temp_path = self.layout.temp_path(id);
        let final_path = self.layout.final_path(id);
        fs::create_dir_all(self.layout.dir()).await?;

        let offset = file_len(&temp_path).await?;
        let response = match self.open_with_retry(url, offset, control).await {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(stopped(control.current(), offset, None)),
            Err(FetchError::RangeNotSatisfiable { .. }) if self.holds_whole_file(descriptor, offset) => {
                info!(model_id = %id, offset, "temp file already holds the whole model");
                return self.finish(descriptor, &temp_path, &final_path, offset).await;
            }
            Err(FetchError::RangeNotSatisfiable { .. }) => {
                warn!(model_id = %id, offset, "server rejected resume offset; restarting from zero");
                remove_if_exists(&temp_path).await?;
                match self.open_with_retry(url, 0, control).await? {
                    Some(response) => response,
                    None => return Ok(stopped(control.current(), 0, None)),
                }
            }
            Err(e) => return Err(e),
        };

        let TransferResponse {
            partial,
            content_length,
            mut body,
        } = response;

        let start = if offset > 0 && partial {
            offset
        } else {
            if offset > 0 {
                warn!(model_id = %id, offset, "server ignored range request; restarting from zero");
            }
            0
        };
        let announced = content_length.map(|len| start + len);
        let total = announced.or((descriptor.size_bytes > 0).then_some(descriptor.size_bytes));
        debug!(model_id = %id, start, ?announced, "writing to temp file");

        let mut file = open_at(&temp_path, start).await?;
        let mut downloaded = start;
        self.report_progress(id, downloaded, total).await;
        let mut last_report = Instant::now();

        loop {
            match control.current() {
                JobSignal::Run => {}
                JobSignal::Pause => {
                    file.flush().await?;
                    return Ok(Outcome::Paused { downloaded, total });
                }
                JobSignal::Cancel => {
                    file.flush().await?;
                    return Ok(Outcome::Cancelled);
                }
            }

            let next = tokio::select! {
                biased;
                alive = control.changed() => {
                    if !alive {
                        file.flush().await?;
                        return Ok(Outcome::Paused { downloaded, total });
                    }
                    continue;
                }
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    file.flush().await?;
                    self.report_progress(id, downloaded, total).await;
                    return Err(e);
                }
                None => break,
            };

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if last_report.elapsed() >= self.config.progress_interval {
                last_report = Instant::now();
                self.report_progress(id, downloaded, total).await;
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        self.report_progress(id, downloaded, total).await;

        if let Some(expected) = announced {
            if downloaded < expected || downloaded > expected + self.config.size_tolerance {
                return Err(FetchError::Incomplete {
                    received: downloaded,
                    expected,
                });
            }
        }

        self.finish(descriptor, &temp_path, &final_path, downloaded).await
    }

    /// Open the transfer, retrying retryable failures. `None` means the job
    /// was signalled before a response arrived.
    async fn open_with_retry(
        &self,
        url: &str,
        offset: u64,
        control: &mut TaskControl<JobSignal>,
    ) -> Result<Option<TransferResponse>, FetchError> {
        let mut attempt = 0;
        loop {
            if control.current() != JobSignal::Run {
                return Ok(None);
            }

            let result = tokio::select! {
                biased;
                alive = control.changed() => {
                    if !alive {
                        return Ok(None);
                    }
                    continue;
                }
                result = self.transport.open(url, offset) => result,
            };

            match result {
                Ok(response) => return Ok(Some(response)),
                Err(e) if e.is_retryable() && attempt < self.config.retry_count => {
                    attempt += 1;
                    warn!(url, offset, attempt, error = %e, "opening transfer failed; retrying");
                    tokio::select! {
                        biased;
                        alive = control.changed() => {
                            if !alive {
                                return Ok(None);
                            }
                        }
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn holds_whole_file(&self, descriptor: &ModelDescriptor, len: u64) -> bool {
        descriptor.size_bytes > 0
            && len >= descriptor.size_bytes
            && len <= descriptor.size_bytes + self.config.size_tolerance
    }

    async fn finish(
        &self,
        descriptor: &ModelDescriptor,
        temp_path: &Path,
        final_path: &Path,
        size: u64,
    ) -> Result<Outcome, FetchError> {
        if let Some(expected) = descriptor.sha256.as_deref() {
            let actual = sha256_file(temp_path).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                if let Err(e) = fs::remove_file(temp_path).await {
                    warn!(model_id = %descriptor.id, error = %e, "could not remove corrupt temp file");
                }
                return Err(FetchError::ChecksumMismatch {
                    model_id: descriptor.id.clone(),
                    expected: expected.to_owned(),
                    actual,
                });
            }
            debug!(model_id = %descriptor.id, "checksum verified");
        }

        fs::rename(temp_path, final_path).await?;
        Ok(Outcome::Completed {
            path: final_path.to_path_buf(),
            size,
        })
    }

    async fn report_progress(&self, model_id: &str, downloaded: u64, total: Option<u64>) {
        let state = self
            .store
            .update(model_id, |s| {
                s.status = DownloadStatus::Downloading;
                s.downloaded_bytes = downloaded;
                s.total_bytes = total;
            })
            .await;
        self.store.emit(DownloadEvent::Progress {
            model_id: model_id.to_owned(),
            progress: state.progress(),
            downloaded_bytes: state.downloaded_bytes,
            total_bytes: state.total_bytes,
        });
    }

    /// Wait for the job to exit on its own, aborting it after `stop_wait`.
    async fn wait_stopped(&self, model_id: &str) {
        let deadline = Instant::now() + self.config.stop_wait;
        while self.jobs.is_running(model_id) {
            if Instant::now() >= deadline {
                warn!(model_id = %model_id, "download job did not stop in time; aborting");
                self.jobs.abort(model_id);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn stopped(signal: JobSignal, downloaded: u64, total: Option<u64>) -> Outcome {
    match signal {
        JobSignal::Cancel => Outcome::Cancelled,
        JobSignal::Run | JobSignal::Pause => Outcome::Paused { downloaded, total },
    }
}

/// Lower-case hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<String, FetchError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

async fn file_len(path: &Path) -> Result<u64, FetchError> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), FetchError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn open_at(path: &Path, offset: u64) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(offset == 0)
        .open(path)
        .await?;
    if offset > 0 {
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}
