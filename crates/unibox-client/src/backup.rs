//! Download → Upload → Cleanup chains that move attachments to cloud storage.
//!
//! Chains are keyed by file id. A file has at most one chain in flight;
//! enqueueing again while one runs keeps the existing chain.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use unibox_shared::types::DownloadingState;
use unibox_shared::CoreError;
use unibox_store::{DeliveryLedger, StoreError};

use crate::cloud::{ActiveCloud, CloudServiceTable};
use crate::download::Downloader;
use crate::events::{CoreEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStage {
    Download,
    Upload,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSnapshot {
    pub file_id: i64,
    pub stage: Option<BackupStage>,
    pub state: JobState,
    /// Download progress in bytes; zero outside the download stage.
    pub downloaded: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Started,
    AlreadyRunning,
}

struct JobHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<BackupSnapshot>,
}

#[derive(Clone)]
pub struct BackupPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: DeliveryLedger,
    downloader: Downloader,
    cloud: Arc<CloudServiceTable>,
    events: EventBus,
    jobs: Mutex<HashMap<i64, JobHandle>>,
}

/// Why a chain stopped before finishing.
enum Stop {
    Cancelled,
    Failed(CoreError),
}

impl From<CoreError> for Stop {
    fn from(e: CoreError) -> Self {
        Self::Failed(e)
    }
}

impl From<StoreError> for Stop {
    fn from(e: StoreError) -> Self {
        Self::Failed(e.into())
    }
}

/// Side effects a cancelled chain has to undo.
#[derive(Default)]
struct Undo {
    /// The chain holds the file's download claim.
    downloading: bool,
    uploaded: Option<(ActiveCloud, String)>,
}

impl BackupPipeline {
    pub fn new(
        ledger: DeliveryLedger,
        downloader: Downloader,
        cloud: Arc<CloudServiceTable>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                downloader,
                cloud,
                events,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a chain for `file_id` unless one is already in flight.
    pub fn enqueue(&self, file_id: i64) -> EnqueueOutcome {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&file_id) {
            debug!(file_id, "Backup already in flight");
            return EnqueueOutcome::AlreadyRunning;
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(BackupSnapshot {
            file_id,
            stage: None,
            state: JobState::Queued,
            downloaded: 0,
            total: 0,
        });
        jobs.insert(
            file_id,
            JobHandle {
                cancel: cancel.clone(),
                progress: rx,
            },
        );
        drop(jobs);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_job(file_id, cancel, tx).await });
        info!(file_id, "Backup queued");
        EnqueueOutcome::Started
    }

    /// Back up one file on request, replacing any previous cloud copy reference.
    pub async fn backup_file(&self, file_id: i64) -> Result<EnqueueOutcome, CoreError> {
        if self.is_running(file_id) {
            return Ok(EnqueueOutcome::AlreadyRunning);
        }
        self.inner.ledger.clear_cloud_info(file_id).await?;

        let settings = self.inner.ledger.settings().await?;
        if let Err(e) = self.inner.cloud.resolve(&settings) {
            self.inner.events.notice(&e);
            return Err(e);
        }
        Ok(self.enqueue(file_id))
    }

    /// Queue every file without a cloud copy under the size threshold.
    ///
    /// Returns the number of chains started. Does nothing when auto-backup is
    /// off or no cloud service is usable.
    pub async fn auto_backup(&self) -> Result<usize, CoreError> {
        let settings = self.inner.ledger.settings().await?;
        if !settings.auto_backup {
            return Ok(0);
        }
        if let Err(e) = self.inner.cloud.resolve(&settings) {
            debug!(error = %e, "Auto-backup skipped");
            return Ok(0);
        }

        let candidates = self
            .inner
            .ledger
            .backup_candidates(settings.auto_backup_limit_bytes())
            .await?;
        let started = candidates
            .iter()
            .filter(|f| self.enqueue(f.file_id) == EnqueueOutcome::Started)
            .count();
        info!(candidates = candidates.len(), started, "Auto-backup pass");
        Ok(started)
    }

    /// Cancel a queued or running chain. Returns `false` if none was in flight.
    ///
    /// A chain already in its cleanup stage still finishes.
    pub fn cancel(&self, file_id: i64) -> bool {
        let jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get(&file_id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, file_id: i64) -> bool {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&file_id)
    }

    /// Snapshots of an in-flight chain, ending with its final state.
    ///
    /// Intermediate snapshots may be coalesced. Dropping the stream leaves
    /// the chain running.
    pub fn progress(&self, file_id: i64) -> Option<impl Stream<Item = BackupSnapshot> + Send + 'static> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&file_id)
            .map(|job| WatchStream::new(job.progress.clone()))
    }
}

impl Inner {
    async fn run_job(
        self: Arc<Self>,
        file_id: i64,
        cancel: CancellationToken,
        tx: watch::Sender<BackupSnapshot>,
    ) {
        let progress = Progress {
            file_id,
            tx,
            events: self.events.clone(),
        };
        let mut undo = Undo::default();

        let state = match self.run_stages(file_id, &cancel, &progress, &mut undo).await {
            Ok(()) => {
                info!(file_id, "Backup finished");
                JobState::Succeeded
            }
            Err(Stop::Failed(e)) => {
                warn!(file_id, error = %e, "Backup failed");
                self.events.notice(&e);
                JobState::Failed
            }
            Err(Stop::Cancelled) => {
                self.rollback(file_id, undo).await;
                info!(file_id, "Backup cancelled");
                JobState::Cancelled
            }
        };

        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&file_id);
        progress.finish(state);
    }

    /// Cancellation interrupts the download and the upload, and is checked
    /// again before cleanup. Ledger writes always run to completion; once
    /// cleanup starts the chain finishes.
    async fn run_stages(
        &self,
        file_id: i64,
        cancel: &CancellationToken,
        progress: &Progress,
        undo: &mut Undo,
    ) -> Result<(), Stop> {
        progress.stage(BackupStage::Download, 0, 0);
        let record = self.ledger.file(file_id).await?;
        let local = match record.local_path.as_deref() {
            Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => {
                debug!(file_id, path, "Using local copy");
                PathBuf::from(path)
            }
            _ => {
                undo.downloading = true;
                let path = interruptible(cancel, self.download(file_id, progress)).await?;
                undo.downloading = false;
                path
            }
        };

        progress.stage(BackupStage::Upload, 0, 0);
        let settings = self.ledger.settings().await?;
        let active = self.cloud.resolve(&settings)?;
        let file = interruptible(cancel, active.upload(&local, &record.name)).await?;
        undo.uploaded = Some((active.clone(), file.cloud_id.clone()));
        self.ledger
            .set_cloud_info(file_id, active.service, file.cloud_id)
            .await?;
        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }

        progress.stage(BackupStage::Cleanup, 0, 0);
        remove_local_copy(&local).await?;
        self.ledger.set_local_path(file_id, None).await?;
        Ok(())
    }

    async fn download(&self, file_id: i64, progress: &Progress) -> Result<PathBuf, CoreError> {
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let report = async {
            while let Some(state) = state_rx.recv().await {
                if let DownloadingState::Downloading { downloaded, total } = state {
                    progress.stage(BackupStage::Download, downloaded, total);
                }
            }
        };
        let (path, ()) = tokio::join!(
            self.downloader.download(file_id, false, Some(state_tx)),
            report
        );
        path
    }

    async fn rollback(&self, file_id: i64, undo: Undo) {
        if undo.downloading {
            if let Err(e) = self.downloader.abort(file_id).await {
                warn!(file_id, error = %e, "Rollback could not release download");
            }
        }
        if let Err(e) = self.ledger.clear_cloud_info(file_id).await {
            warn!(file_id, error = %e, "Rollback could not clear cloud info");
        }
        if let Some((active, cloud_id)) = undo.uploaded {
            match active.delete(&cloud_id).await {
                Ok(()) => debug!(file_id, cloud_id, "Removed uploaded copy"),
                Err(e) => warn!(file_id, cloud_id, error = %e, "Uploaded copy left behind"),
            }
        }
    }
}

async fn interruptible<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, CoreError>>,
) -> Result<T, Stop> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Stop::Cancelled),
        result = work => result.map_err(Stop::Failed),
    }
}

async fn remove_local_copy(path: &Path) -> Result<(), CoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

struct Progress {
    file_id: i64,
    tx: watch::Sender<BackupSnapshot>,
    events: EventBus,
}

impl Progress {
    fn publish(&self, snapshot: BackupSnapshot) {
        self.events.emit(CoreEvent::Backup(snapshot.clone()));
        self.tx.send_replace(snapshot);
    }

    fn stage(&self, stage: BackupStage, downloaded: u64, total: u64) {
        self.publish(BackupSnapshot {
            file_id: self.file_id,
            stage: Some(stage),
            state: JobState::Running,
            downloaded,
            total,
        });
    }

    fn finish(self, state: JobState) {
        let stage = self.tx.borrow().stage;
        self.publish(BackupSnapshot {
            file_id: self.file_id,
            stage,
            state,
            downloaded: 0,
            total: 0,
        });
    }
}
