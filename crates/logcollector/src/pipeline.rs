// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Listing, downloading, parsing and shipping one day of logs.
//!
//! ```text
//!   list ──► downloads ──► [download workers] ──► files ──► [parse workers]
//!                 ▲                                              │ one job per line
//!                 └── delayed retry                              ▼
//!                                          lines ──► [line workers] ──► Storage
//! ```
//!
//! Every queue is bounded, so a slow stage holds back the one before it.
//! Failed jobs are put back after the retry strategy's delay by a detached
//! task; a job that runs out of attempts ends up in the report's dead letters.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use log_shipper::{DeliveryError, RetryStrategy, Storage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::PipelineError;
use crate::normalizer::Normalizer;
use crate::source::RemoteSource;

const FILE_QUEUE_CAPACITY: usize = 3;
const LINE_QUEUE_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub remote_root: String,
    pub work_dir: PathBuf,
    pub download_workers: usize,
    pub parse_workers: usize,
    pub line_workers: usize,
    pub retry_strategy: RetryStrategy,
}

/// What one invocation collects.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub apps: Vec<String>,
    /// Server names or shell globs, `*` for all.
    pub servers: Vec<String>,
    pub date: NaiveDate,
    /// Skip listed paths until the first one under this server.
    pub from_server: Option<String>,
    pub drop_database: bool,
    pub drop_measurement: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Parse,
    Line,
}

/// A job that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub stage: Stage,
    /// Remote path, local file or the line itself.
    pub subject: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub paths_listed: usize,
    pub paths_skipped: usize,
    pub files_downloaded: usize,
    pub files_processed: usize,
    pub lines_accepted: usize,
    pub lines_skipped: usize,
    pub lines_failed: usize,
    pub dead_letters: Vec<DeadLetter>,
}

/// A remote file and where it lands locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub remote_path: String,
    pub local_path: PathBuf,
}

impl TransferJob {
    /// `<root>/<server>/<date>/<app>/<file>` is stored as `<server>_<date>_<file>.log`.
    pub fn new(remote_root: &str, work_dir: &Path, remote_path: &str) -> Result<Self, PipelineError> {
        let relative = remote_path
            .strip_prefix(remote_root)
            .ok_or_else(|| PipelineError::UnexpectedPath(remote_path.to_string()))?
            .trim_start_matches('/');
        let segments: Vec<&str> = relative.split('/').collect();
        let &[server, date, _app, file] = segments.as_slice() else {
            return Err(PipelineError::UnexpectedPath(remote_path.to_string()));
        };
        if [server, date, file].iter().any(|s| s.is_empty()) {
            return Err(PipelineError::UnexpectedPath(remote_path.to_string()));
        }
        Ok(TransferJob {
            remote_path: remote_path.to_string(),
            local_path: work_dir.join(format!("{server}_{date}_{file}.log")),
        })
    }
}

/// Outstanding work counter that can be awaited until it drops to zero.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct Counters {
    paths_listed: AtomicUsize,
    paths_skipped: AtomicUsize,
    files_downloaded: AtomicUsize,
    files_processed: AtomicUsize,
    lines_accepted: AtomicUsize,
    lines_skipped: AtomicUsize,
    lines_failed: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Attempt<T> {
    job: T,
    number: u32,
}

impl<T> Attempt<T> {
    fn first(job: T) -> Self {
        Attempt { job, number: 1 }
    }
}

/// Lines of one local file still travelling through the line stage.
struct FileProgress {
    path: PathBuf,
    pending: InFlight,
    sent: AtomicUsize,
}

struct LineJob {
    line: String,
    file: Arc<FileProgress>,
}

type Receiver<T> = Arc<Mutex<mpsc::Receiver<Attempt<T>>>>;

struct Context {
    source: Arc<dyn RemoteSource>,
    storage: Arc<dyn Storage>,
    normalizer: Arc<Normalizer>,
    retry: RetryStrategy,
    counters: Counters,
    inflight: InFlight,
    dead_letters: Mutex<Vec<DeadLetter>>,
    downloads: mpsc::Sender<Attempt<TransferJob>>,
    files: mpsc::Sender<Attempt<TransferJob>>,
    lines: mpsc::Sender<Attempt<LineJob>>,
}

impl Context {
    /// Schedules another attempt, or hands the job back once attempts are exhausted.
    fn retry<T: Send + 'static>(
        &self,
        queue: &mpsc::Sender<Attempt<T>>,
        failed: Attempt<T>,
    ) -> Option<Attempt<T>> {
        if !self.retry.should_retry(failed.number) {
            return Some(failed);
        }
        let delay = self.retry.delay(failed.number);
        let next = Attempt {
            job: failed.job,
            number: failed.number + 1,
        };
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if queue.send(next).await.is_err() {
                error!("Queue closed before a retried job could be resubmitted");
            }
        });
        None
    }

    async fn dead_letter(&self, stage: Stage, subject: String, attempts: u32, error: String) {
        error!(
            "Giving up on {:?} job after {} attempts: {} ({})",
            stage, attempts, subject, error
        );
        self.dead_letters.lock().await.push(DeadLetter {
            stage,
            subject,
            attempts,
            error,
        });
    }

    async fn download(&self, attempt: Attempt<TransferJob>) {
        let TransferJob {
            remote_path,
            local_path,
        } = &attempt.job;
        match self.source.fetch(remote_path, local_path).await {
            Ok(bytes) => {
                debug!("Downloaded {} ({} bytes)", remote_path, bytes);
                bump(&self.counters.files_downloaded);
                self.inflight.begin();
                if self.files.send(Attempt::first(attempt.job)).await.is_err() {
                    self.inflight.finish();
                }
                self.inflight.finish();
            }
            Err(e) => {
                warn!(
                    "Unable to download {} (attempt {}): {}",
                    remote_path, attempt.number, e
                );
                if let Err(remove) = tokio::fs::remove_file(local_path).await {
                    debug!("No partial file to remove at {}: {}", local_path.display(), remove);
                }
                if let Some(exhausted) = self.retry(&self.downloads, attempt) {
                    self.dead_letter(
                        Stage::Download,
                        exhausted.job.remote_path,
                        exhausted.number,
                        e.to_string(),
                    )
                    .await;
                    self.inflight.finish();
                }
            }
        }
    }

    async fn process_file(&self, attempt: Attempt<TransferJob>) {
        let path = attempt.job.local_path.clone();
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    "Unable to open {} (attempt {}): {}",
                    path.display(),
                    attempt.number,
                    e
                );
                if let Some(exhausted) = self.retry(&self.files, attempt) {
                    self.dead_letter(
                        Stage::Parse,
                        path.display().to_string(),
                        exhausted.number,
                        e.to_string(),
                    )
                    .await;
                    self.inflight.finish();
                }
                return;
            }
        };

        let progress = Arc::new(FileProgress {
            path: path.clone(),
            pending: InFlight::default(),
            sent: AtomicUsize::new(0),
        });
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut read = 0_usize;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(&['\n', '\r'][..]);
                    if line.is_empty() {
                        continue;
                    }
                    read += 1;
                    progress.pending.begin();
                    let job = LineJob {
                        line: line.to_string(),
                        file: Arc::clone(&progress),
                    };
                    if self.lines.send(Attempt::first(job)).await.is_err() {
                        progress.pending.finish();
                    }
                }
                Err(e) => {
                    // Lines already queued would be duplicated by a retry.
                    error!("Unable to read {}: {}", path.display(), e);
                    break;
                }
            }
        }

        progress.pending.wait_idle().await;
        info!(
            "Sent: {} of {} lines from {}",
            progress.sent.load(Ordering::SeqCst),
            read,
            path.display()
        );
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Unable to remove {}: {}", path.display(), e);
        }
        bump(&self.counters.files_processed);
        self.inflight.finish();
    }

    async fn process_line(&self, attempt: Attempt<LineJob>) {
        let record = match self.normalizer.normalize(&attempt.job.line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping line of {}: {}", attempt.job.file.path.display(), e);
                bump(&self.counters.lines_skipped);
                attempt.job.file.pending.finish();
                return;
            }
        };

        match self.storage.send(record).await {
            Ok(()) => {
                bump(&self.counters.lines_accepted);
                attempt.job.file.sent.fetch_add(1, Ordering::SeqCst);
                attempt.job.file.pending.finish();
            }
            Err(e) => {
                warn!("Unable to send line (attempt {}): {}", attempt.number, e);
                let exhausted = if matches!(e, DeliveryError::Encode(_)) {
                    Some(attempt)
                } else {
                    self.retry(&self.lines, attempt)
                };
                if let Some(exhausted) = exhausted {
                    bump(&self.counters.lines_failed);
                    let file = Arc::clone(&exhausted.job.file);
                    self.dead_letter(
                        Stage::Line,
                        exhausted.job.line,
                        exhausted.number,
                        e.to_string(),
                    )
                    .await;
                    file.pending.finish();
                }
            }
        }
    }

    async fn report(&self) -> RunReport {
        let load = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        RunReport {
            paths_listed: load(&self.counters.paths_listed),
            paths_skipped: load(&self.counters.paths_skipped),
            files_downloaded: load(&self.counters.files_downloaded),
            files_processed: load(&self.counters.files_processed),
            lines_accepted: load(&self.counters.lines_accepted),
            lines_skipped: load(&self.counters.lines_skipped),
            lines_failed: load(&self.counters.lines_failed),
            dead_letters: self.dead_letters.lock().await.clone(),
        }
    }
}

async fn run_worker<T, F, Fut>(queue: Receiver<T>, shutdown: CancellationToken, mut handle: F)
where
    F: FnMut(Attempt<T>) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = async { queue.lock().await.recv().await } => next,
        };
        match next {
            Some(job) => handle(job).await,
            None => break,
        }
    }
}

/// Local midnight of `date` and the instant 24 hours later.
fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    let from = Local
        .from_local_datetime(&midnight)
        .earliest()
        .map_or_else(|| midnight.and_utc(), |local| local.with_timezone(&Utc));
    (from, from + ChronoDuration::hours(24))
}

pub struct Pipeline {
    source: Arc<dyn RemoteSource>,
    storage: Arc<dyn Storage>,
    normalizer: Arc<Normalizer>,
    settings: PipelineSettings,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        source: Arc<dyn RemoteSource>,
        storage: Arc<dyn Storage>,
        normalizer: Normalizer,
        settings: PipelineSettings,
    ) -> Self {
        Pipeline {
            source,
            storage,
            normalizer: Arc::new(normalizer),
            settings,
        }
    }

    /// Collects everything `request` names and waits until every queued job
    /// has been delivered, skipped or dead-lettered.
    ///
    /// Only the destructive operations requested up front abort the run;
    /// everything else is logged and counted.
    pub async fn run(&self, request: RunRequest) -> Result<RunReport, PipelineError> {
        if request.drop_database {
            info!("Dropping database");
            self.storage.drop_database().await?;
        }

        let (downloads_tx, downloads_rx) = mpsc::channel(self.settings.download_workers.max(1));
        let (files_tx, files_rx) = mpsc::channel(FILE_QUEUE_CAPACITY);
        let (lines_tx, lines_rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        let context = Arc::new(Context {
            source: Arc::clone(&self.source),
            storage: Arc::clone(&self.storage),
            normalizer: Arc::clone(&self.normalizer),
            retry: self.settings.retry_strategy,
            counters: Counters::default(),
            inflight: InFlight::default(),
            dead_letters: Mutex::new(Vec::new()),
            downloads: downloads_tx,
            files: files_tx,
            lines: lines_tx,
        });

        let shutdown = CancellationToken::new();
        let mut workers = JoinSet::new();
        let downloads_rx: Receiver<TransferJob> = Arc::new(Mutex::new(downloads_rx));
        for _ in 0..self.settings.download_workers.max(1) {
            let ctx = Arc::clone(&context);
            workers.spawn(run_worker(
                Arc::clone(&downloads_rx),
                shutdown.clone(),
                move |job| {
                    let ctx = Arc::clone(&ctx);
                    async move { ctx.download(job).await }
                },
            ));
        }
        let files_rx: Receiver<TransferJob> = Arc::new(Mutex::new(files_rx));
        for _ in 0..self.settings.parse_workers.max(1) {
            let ctx = Arc::clone(&context);
            workers.spawn(run_worker(
                Arc::clone(&files_rx),
                shutdown.clone(),
                move |job| {
                    let ctx = Arc::clone(&ctx);
                    async move { ctx.process_file(job).await }
                },
            ));
        }
        let lines_rx: Receiver<LineJob> = Arc::new(Mutex::new(lines_rx));
        for _ in 0..self.settings.line_workers.max(1) {
            let ctx = Arc::clone(&context);
            workers.spawn(run_worker(
                Arc::clone(&lines_rx),
                shutdown.clone(),
                move |job| {
                    let ctx = Arc::clone(&ctx);
                    async move { ctx.process_line(job).await }
                },
            ));
        }

        let result = self.submit(&context, &request).await;

        context.inflight.wait_idle().await;
        shutdown.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Pipeline worker failed: {}", e);
            }
        }
        result?;

        let report = context.report().await;
        info!(
            "Run finished: {} paths listed, {} skipped, {} files processed, {} lines accepted, {} skipped, {} failed",
            report.paths_listed,
            report.paths_skipped,
            report.files_processed,
            report.lines_accepted,
            report.lines_skipped,
            report.lines_failed
        );
        Ok(report)
    }

    async fn submit(&self, context: &Context, request: &RunRequest) -> Result<(), PipelineError> {
        let date = request.date.format("%Y%m%d").to_string();
        let (from, to) = day_bounds(request.date);
        let from_server_prefix = request
            .from_server
            .as_ref()
            .map(|server| format!("{}/{server}/", self.settings.remote_root.trim_end_matches('/')));
        let mut resumed = from_server_prefix.is_none();

        for app in &request.apps {
            let paths = match self.source.list(app, &request.servers, &date).await {
                Ok(paths) => paths,
                Err(e) => {
                    error!("Unable to list files of {}: {}", app, e);
                    continue;
                }
            };
            info!("Found {} files for {}", paths.len(), app);

            if request.drop_measurement {
                info!("Dropping measurement {}", app);
                self.storage.drop_measurement(app).await?;
            }
            if let Err(e) = self.storage.delete_by_date_range(app, from, to).await {
                warn!("Unable to delete {} records of {}: {}", app, date, e);
            }

            for path in paths {
                bump(&context.counters.paths_listed);
                if !resumed {
                    match &from_server_prefix {
                        Some(prefix) if path.starts_with(prefix.as_str()) => resumed = true,
                        _ => {
                            info!("Skip: {}", path);
                            bump(&context.counters.paths_skipped);
                            continue;
                        }
                    }
                }
                let job = match TransferJob::new(
                    &self.settings.remote_root,
                    &self.settings.work_dir,
                    &path,
                ) {
                    Ok(job) => job,
                    Err(e) => {
                        error!("{}", e);
                        bump(&context.counters.paths_skipped);
                        continue;
                    }
                };
                context.inflight.begin();
                if context.downloads.send(Attempt::first(job)).await.is_err() {
                    context.inflight.finish();
                }
            }
        }
        Ok(())
    }
}
