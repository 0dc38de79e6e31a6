//! Attachment downloads and their persisted progress.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use unibox_shared::types::DownloadingState;
use unibox_shared::CoreError;
use unibox_store::{DeliveryLedger, FileTransferRecord};

use crate::cloud::CloudServiceTable;

/// A response body as a stream of chunks.
pub struct FetchedBody {
    pub total: Option<u64>,
    pub chunks: BoxStream<'static, anyhow::Result<Bytes>>,
}

#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedBody>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedBody> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(FetchedBody {
            total: response.content_length(),
            chunks: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(anyhow::Error::from))
                .boxed(),
        })
    }
}

#[derive(Clone)]
pub struct Downloader {
    ledger: DeliveryLedger,
    fetcher: Arc<dyn FileFetcher>,
    cloud: Arc<CloudServiceTable>,
    download_dir: PathBuf,
    poll_interval: Duration,
}

impl Downloader {
    pub fn new(
        ledger: DeliveryLedger,
        fetcher: Arc<dyn FileFetcher>,
        cloud: Arc<CloudServiceTable>,
        download_dir: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            fetcher,
            cloud,
            download_dir,
            poll_interval,
        }
    }

    /// Fetch a file to the download directory and record its local path.
    ///
    /// The file is claimed atomically first; a second call while one holds
    /// the claim fails without touching the file. Every state is persisted,
    /// in order, and mirrored to `progress`. Failures are persisted as
    /// [`DownloadingState::Failure`] and returned; reporting them is up to
    /// the caller. If the returned future is dropped midway, the file stays
    /// claimed until [`Downloader::abort`] releases it.
    pub async fn download(
        &self,
        file_id: i64,
        cloud_first: bool,
        progress: Option<mpsc::UnboundedSender<DownloadingState>>,
    ) -> Result<PathBuf, CoreError> {
        let record = self.ledger.file(file_id).await?;
        if !self.ledger.claim_download(file_id, record.size).await? {
            return Err(CoreError::Io(format!("file {file_id} is already downloading")));
        }

        let report = |state: DownloadingState| {
            if let Some(p) = &progress {
                let _ = p.send(state);
            }
        };
        report(DownloadingState::Downloading {
            downloaded: 0,
            total: record.size,
        });

        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<(u64, u64)>();
        let fetch = async {
            let ticks = tick_tx;
            self.fetch_into_place(&record, cloud_first, &ticks).await
        };
        let persist = async {
            while let Some((downloaded, total)) = tick_rx.recv().await {
                if let Err(e) = self
                    .ledger
                    .record_download_progress(file_id, downloaded, total)
                    .await
                {
                    warn!(file_id, error = %e, "Failed to persist download progress");
                }
                report(DownloadingState::Downloading { downloaded, total });
            }
        };
        let (result, ()) = tokio::join!(fetch, persist);

        let result = match result {
            Ok(path) => {
                let path_str = path.to_string_lossy().into_owned();
                match self.ledger.set_local_path(file_id, Some(path_str)).await {
                    Ok(()) => Ok(path),
                    Err(e) => Err(CoreError::from(e)),
                }
            }
            Err(e) => Err(e),
        };

        let terminal = match &result {
            Ok(_) => DownloadingState::Done,
            Err(_) => DownloadingState::Failure,
        };
        if let Err(e) = self.ledger.set_download_state(file_id, terminal).await {
            warn!(file_id, error = %e, "Failed to persist download state");
        }
        report(terminal);

        match &result {
            Ok(path) => info!(file_id, path = %path.display(), "Download finished"),
            Err(e) => warn!(file_id, error = %e, "Download failed"),
        }
        result
    }

    /// Release the claim of an interrupted download.
    ///
    /// Marks the file `Failure` so it can be retried and removes the partly
    /// written file. Returns `false` if no download held the file.
    pub async fn abort(&self, file_id: i64) -> Result<bool, CoreError> {
        let record = self.ledger.file(file_id).await?;
        if !self.ledger.release_download(file_id).await? {
            return Ok(false);
        }

        let partial = self.download_dir.join(local_file_name(&record));
        match tokio::fs::remove_file(&partial).await {
            Ok(()) => debug!(file_id, path = %partial.display(), "Removed partial download"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file_id, error = %e, "Partial download left behind"),
        }
        info!(file_id, "Download aborted");
        Ok(true)
    }

    async fn fetch_into_place(
        &self,
        record: &FileTransferRecord,
        cloud_first: bool,
        ticks: &mpsc::UnboundedSender<(u64, u64)>,
    ) -> Result<PathBuf, CoreError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        if cloud_first {
            if let Some(cloud_id) = record.cloud_id.as_deref() {
                let settings = self.ledger.settings().await?;
                let active = self.cloud.resolve(&settings)?;
                debug!(file_id = record.file_id, service = %active.service, "Downloading from cloud copy");
                let report = |downloaded: u64, total: u64| {
                    let _ = ticks.send((downloaded, total));
                };
                return active.download(cloud_id, &self.download_dir, &report).await;
            }
        }

        let url = record
            .url
            .as_deref()
            .ok_or_else(|| CoreError::Io(format!("file {} has no source url", record.file_id)))?;
        let dest = self.download_dir.join(local_file_name(record));
        self.fetch_url(url, &dest, record.size, ticks).await?;
        Ok(dest)
    }

    async fn fetch_url(
        &self,
        url: &str,
        dest: &Path,
        size_hint: u64,
        ticks: &mpsc::UnboundedSender<(u64, u64)>,
    ) -> Result<(), CoreError> {
        let body = self
            .fetcher
            .fetch(url)
            .await
            .map_err(|e| CoreError::Io(format!("{e:#}")))?;
        let total = body.total.unwrap_or(size_hint);

        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded = 0u64;
        let mut chunks = body.chunks;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| CoreError::Io(format!("{e:#}")))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            let _ = ticks.send((downloaded, total));
        }
        file.flush().await?;
        Ok(())
    }

    /// Poll the persisted state until the download reaches `Done` or `Failure`.
    ///
    /// The terminal state is yielded last. Dropping the stream stops polling.
    pub fn watch(&self, file_id: i64) -> impl Stream<Item = DownloadingState> + Send + 'static {
        let ledger = self.ledger.clone();
        let period = self.poll_interval;

        stream::unfold(
            (ledger, None::<tokio::time::Interval>, false),
            move |(ledger, ticker, finished)| async move {
                if finished {
                    return None;
                }
                let mut ticker = ticker.unwrap_or_else(|| tokio::time::interval(period));
                ticker.tick().await;
                let state = match ledger.file(file_id).await {
                    Ok(record) => record.state,
                    Err(e) => {
                        warn!(file_id, error = %e, "Stopped watching download");
                        return None;
                    }
                };
                Some((state, (ledger, Some(ticker), state.is_terminal())))
            },
        )
    }
}

fn local_file_name(record: &FileTransferRecord) -> String {
    let name: String = record
        .name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}_{}", record.file_id, name)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use unibox_store::NewFile;

    use super::*;

    /// Serves a fixed body in fixed-size chunks.
    pub(crate) struct ChunkedFetcher {
        pub body: Vec<u8>,
        pub chunk: usize,
        pub fail: AtomicBool,
        /// Pause before each chunk.
        pub chunk_delay: Option<Duration>,
    }

    impl ChunkedFetcher {
        pub(crate) fn new(len: usize, chunk: usize) -> Self {
            Self {
                body: vec![7u8; len],
                chunk,
                fail: AtomicBool::new(false),
                chunk_delay: None,
            }
        }

        pub(crate) fn slow(len: usize, chunk: usize, delay: Duration) -> Self {
            Self {
                chunk_delay: Some(delay),
                ..Self::new(len, chunk)
            }
        }
    }

    #[async_trait]
    impl FileFetcher for ChunkedFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<FetchedBody> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("connection reset");
            }
            let chunks: Vec<anyhow::Result<Bytes>> = self
                .body
                .chunks(self.chunk)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let delay = self.chunk_delay;
            Ok(FetchedBody {
                total: Some(self.body.len() as u64),
                chunks: stream::iter(chunks)
                    .then(move |chunk| async move {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        chunk
                    })
                    .boxed(),
            })
        }
    }

    async fn setup(fetcher: ChunkedFetcher) -> (Downloader, i64, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = DeliveryLedger::open_in_memory().unwrap();
        let file_id = ledger
            .add_file(NewFile {
                name: "report.pdf".into(),
                url: Some("https://files.example/report.pdf".into()),
                size: 1000,
                ..Default::default()
            })
            .await
            .unwrap();
        let downloader = Downloader::new(
            ledger,
            Arc::new(fetcher),
            Arc::new(CloudServiceTable::new()),
            dir.path().join("downloads"),
            Duration::from_millis(10),
        );
        (downloader, file_id, dir)
    }

    #[tokio::test]
    async fn two_tick_download_progress_sequence() {
        let (downloader, file_id, _dir) = setup(ChunkedFetcher::new(1000, 500)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let path = downloader.download(file_id, false, Some(tx)).await.unwrap();

        let mut states = Vec::new();
        while let Some(s) = rx.recv().await {
            states.push(s);
        }
        assert_eq!(
            states,
            vec![
                DownloadingState::Downloading { downloaded: 0, total: 1000 },
                DownloadingState::Downloading { downloaded: 500, total: 1000 },
                DownloadingState::Downloading { downloaded: 1000, total: 1000 },
                DownloadingState::Done,
            ]
        );

        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), 1000);
        let record = downloader.ledger.file(file_id).await.unwrap();
        assert_eq!(record.state, DownloadingState::Done);
        assert_eq!(record.local_path.as_deref(), Some(path.to_str().unwrap()));
    }

    #[tokio::test]
    async fn failure_is_persisted_and_retryable() {
        let fetcher = ChunkedFetcher::new(1000, 500);
        fetcher.fail.store(true, Ordering::SeqCst);
        let (downloader, file_id, _dir) = setup(fetcher).await;

        assert!(downloader.download(file_id, false, None).await.is_err());
        let record = downloader.ledger.file(file_id).await.unwrap();
        assert_eq!(record.state, DownloadingState::Failure);
        assert!(record.state.can_start());
    }

    #[tokio::test]
    async fn watch_ends_at_terminal_state() {
        let (downloader, file_id, _dir) = setup(ChunkedFetcher::new(1000, 500)).await;
        downloader.download(file_id, false, None).await.unwrap();

        let seen: Vec<_> = downloader.watch(file_id).collect().await;
        assert_eq!(seen, vec![DownloadingState::Done]);
    }

    #[tokio::test]
    async fn concurrent_downloads_claim_once() {
        let fetcher = ChunkedFetcher::slow(100, 25, Duration::from_millis(20));
        let (downloader, file_id, _dir) = setup(fetcher).await;

        let (a, b) = tokio::join!(
            downloader.download(file_id, false, None),
            downloader.download(file_id, false, None),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(err.to_string().contains("already downloading"));

        let record = downloader.ledger.file(file_id).await.unwrap();
        assert_eq!(record.state, DownloadingState::Done);
    }

    #[tokio::test]
    async fn abort_releases_interrupted_download() {
        let fetcher = ChunkedFetcher::slow(100, 10, Duration::from_millis(30));
        let (downloader, file_id, dir) = setup(fetcher).await;

        let task = tokio::spawn({
            let downloader = downloader.clone();
            async move { downloader.download(file_id, false, None).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let partial = dir.path().join("downloads").join(format!("{file_id}_report.pdf"));
        assert!(partial.exists());
        let record = downloader.ledger.file(file_id).await.unwrap();
        assert!(matches!(record.state, DownloadingState::Downloading { .. }));

        assert!(downloader.abort(file_id).await.unwrap());
        assert!(!downloader.abort(file_id).await.unwrap());
        assert!(!partial.exists());
        let record = downloader.ledger.file(file_id).await.unwrap();
        assert_eq!(record.state, DownloadingState::Failure);
        assert!(record.state.can_start());

        let path = downloader.download(file_id, false, None).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), 100);
    }
}
