// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log_shipper::{DeliveryError, LogRecord, RetryStrategy, Storage};
use logcollector::errors::SourceError;
use logcollector::normalizer::Normalizer;
use logcollector::pipeline::{Pipeline, PipelineSettings, RunRequest, Stage};
use logcollector::source::RemoteSource;
use remote_shell::TransportError;

const ROOT: &str = "/var/log/remote";

fn file_content(host: &str) -> String {
    format!(
        "2024-01-01T10:00:01.000001+01:00 {host} billing[42] level=info method=GET took=12ms\n\
         2024-01-01T10:00:02.000001+01:00 {host} billing[42] level=info method=POST count=3\n\
         2024-01-01T10:00:03.000001+01:00 {host} billing[42]\n\
         2024-01-01T10:00:04.000001+01:00 {host} billing[42] level=warn msg=\"slow request\"\n"
    )
}

#[derive(Default)]
struct FakeSource {
    listings: HashMap<String, Vec<String>>,
    files: HashMap<String, String>,
    /// Remaining failures per remote path; `usize::MAX` fails forever.
    failures: Mutex<HashMap<String, usize>>,
    fetches: AtomicUsize,
}

impl FakeSource {
    fn billing() -> Self {
        let paths = vec![
            format!("{ROOT}/web1/20240101/billing/app.log"),
            format!("{ROOT}/web2/20240101/billing/app.log"),
        ];
        let mut files = HashMap::new();
        files.insert(paths[0].clone(), file_content("web1"));
        files.insert(paths[1].clone(), file_content("web2"));
        let mut listings = HashMap::new();
        listings.insert("billing".to_string(), paths);
        FakeSource {
            listings,
            files,
            ..FakeSource::default()
        }
    }

    fn fail(self, path: &str, times: usize) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
        self
    }
}

#[async_trait]
impl RemoteSource for FakeSource {
    async fn list(
        &self,
        app: &str,
        _servers: &[String],
        date: &str,
    ) -> Result<Vec<String>, SourceError> {
        assert_eq!(date, "20240101");
        self.listings
            .get(app)
            .cloned()
            .ok_or(SourceError::Transport(TransportError::ExitStatus(2)))
    }

    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(remote_path) {
                if *left > 0 {
                    *left = left.saturating_sub(1);
                    return Err(SourceError::Transport(TransportError::ExitMissing));
                }
            }
        }
        let content = &self.files[remote_path];
        tokio::fs::write(local_path, content).await.unwrap();
        Ok(content.len() as u64)
    }
}

#[derive(Default)]
struct FakeStorage {
    records: Mutex<Vec<LogRecord>>,
    operations: Mutex<Vec<String>>,
    failing_sends: AtomicUsize,
}

#[async_trait]
impl Storage for FakeStorage {
    async fn send(&self, record: LogRecord) -> Result<(), DeliveryError> {
        if self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeliveryError::Closed);
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }

    async fn drop_database(&self) -> Result<(), DeliveryError> {
        self.operations.lock().unwrap().push("drop_database".into());
        Ok(())
    }

    async fn drop_measurement(&self, app: &str) -> Result<(), DeliveryError> {
        self.operations
            .lock()
            .unwrap()
            .push(format!("drop_measurement {app}"));
        Ok(())
    }

    async fn delete_by_date_range(
        &self,
        app: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        assert_eq!((to - from).num_hours(), 24);
        self.operations.lock().unwrap().push(format!("delete {app}"));
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    fn already_sent(&self) -> u64 {
        self.records.lock().unwrap().len() as u64
    }
}

fn pipeline(
    source: Arc<FakeSource>,
    storage: Arc<FakeStorage>,
    work_dir: &Path,
    retry_strategy: RetryStrategy,
) -> Pipeline {
    Pipeline::new(
        source,
        storage,
        Normalizer::new(["go-queue"]),
        PipelineSettings {
            remote_root: ROOT.to_string(),
            work_dir: work_dir.to_path_buf(),
            download_workers: 2,
            parse_workers: 2,
            line_workers: 2,
            retry_strategy,
        },
    )
}

fn request(apps: &[&str]) -> RunRequest {
    RunRequest {
        apps: apps.iter().map(|app| app.to_string()).collect(),
        servers: vec!["*".to_string()],
        date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        from_server: None,
        drop_database: false,
        drop_measurement: false,
    }
}

fn leftover_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

#[tokio::test]
async fn test_collects_two_files_and_skips_malformed_lines() {
    let work_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::billing());
    let storage = Arc::new(FakeStorage::default());

    let report = pipeline(
        Arc::clone(&source),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::Immediate(3),
    )
    .run(request(&["billing"]))
    .await
    .unwrap();

    assert_eq!(report.paths_listed, 2);
    assert_eq!(report.files_downloaded, 2);
    assert_eq!(report.files_processed, 2);
    assert_eq!(report.lines_accepted, 6);
    assert_eq!(report.lines_skipped, 2);
    assert!(report.dead_letters.is_empty());
    assert_eq!(storage.already_sent(), 6);
    assert!(leftover_files(work_dir.path()).is_empty());

    let records = storage.records.lock().unwrap();
    assert!(records.iter().all(|r| r.app == "billing"));
    let hosts: Vec<&str> = records.iter().map(|r| r.tags["host"].as_str()).collect();
    assert_eq!(hosts.iter().filter(|h| **h == "web1").count(), 3);
    assert_eq!(hosts.iter().filter(|h| **h == "web2").count(), 3);
    assert_eq!(
        storage.operations.lock().unwrap().clone(),
        vec!["delete billing"]
    );
}

#[tokio::test]
async fn test_failed_download_is_retried() {
    let work_dir = tempfile::tempdir().unwrap();
    let flaky = format!("{ROOT}/web1/20240101/billing/app.log");
    let source = Arc::new(FakeSource::billing().fail(&flaky, 2));
    let storage = Arc::new(FakeStorage::default());

    let report = pipeline(
        Arc::clone(&source),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::Immediate(3),
    )
    .run(request(&["billing"]))
    .await
    .unwrap();

    assert_eq!(report.files_downloaded, 2);
    assert_eq!(report.lines_accepted, 6);
    assert!(report.dead_letters.is_empty());
    assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_exhausted_download_is_dead_lettered() {
    let work_dir = tempfile::tempdir().unwrap();
    let broken = format!("{ROOT}/web2/20240101/billing/app.log");
    let source = Arc::new(FakeSource::billing().fail(&broken, usize::MAX));
    let storage = Arc::new(FakeStorage::default());

    let report = pipeline(
        Arc::clone(&source),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::LinearBackoff(2, 1),
    )
    .run(request(&["billing"]))
    .await
    .unwrap();

    assert_eq!(report.files_downloaded, 1);
    assert_eq!(report.lines_accepted, 3);
    assert_eq!(report.dead_letters.len(), 1);
    let letter = &report.dead_letters[0];
    assert_eq!(letter.stage, Stage::Download);
    assert_eq!(letter.subject, broken);
    assert_eq!(letter.attempts, 2);
    assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_failed_line_sends_are_retried_then_dead_lettered() {
    let work_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::billing());

    let storage = Arc::new(FakeStorage::default());
    storage.failing_sends.store(2, Ordering::SeqCst);
    let report = pipeline(
        Arc::clone(&source),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::Immediate(3),
    )
    .run(request(&["billing"]))
    .await
    .unwrap();
    assert_eq!(report.lines_accepted, 6);
    assert_eq!(report.lines_failed, 0);

    let storage = Arc::new(FakeStorage::default());
    storage.failing_sends.store(usize::MAX, Ordering::SeqCst);
    let report = pipeline(
        Arc::new(FakeSource::billing()),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::Immediate(2),
    )
    .run(request(&["billing"]))
    .await
    .unwrap();
    assert_eq!(report.lines_accepted, 0);
    assert_eq!(report.lines_failed, 6);
    assert_eq!(report.lines_skipped, 2);
    assert!(report
        .dead_letters
        .iter()
        .all(|letter| letter.stage == Stage::Line && letter.attempts == 2));
    assert!(leftover_files(work_dir.path()).is_empty());
}

#[tokio::test]
async fn test_from_server_skips_until_first_match() {
    let work_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::billing());
    let storage = Arc::new(FakeStorage::default());
    let mut request = request(&["billing"]);
    request.from_server = Some("web2".to_string());
    request.drop_database = true;
    request.drop_measurement = true;

    let report = pipeline(
        Arc::clone(&source),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::Immediate(1),
    )
    .run(request)
    .await
    .unwrap();

    assert_eq!(report.paths_listed, 2);
    assert_eq!(report.paths_skipped, 1);
    assert_eq!(report.files_downloaded, 1);
    assert_eq!(report.lines_accepted, 3);
    assert_eq!(
        storage.operations.lock().unwrap().clone(),
        vec!["drop_database", "drop_measurement billing", "delete billing"]
    );
}

#[tokio::test]
async fn test_unlisted_application_is_skipped() {
    let work_dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::billing());
    let storage = Arc::new(FakeStorage::default());

    let report = pipeline(
        Arc::clone(&source),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::Immediate(1),
    )
    .run(request(&["unknown", "billing"]))
    .await
    .unwrap();

    assert_eq!(report.paths_listed, 2);
    assert_eq!(report.lines_accepted, 6);
    assert_eq!(
        storage.operations.lock().unwrap().clone(),
        vec!["delete billing"]
    );
}

#[tokio::test]
async fn test_from_server_does_not_match_sibling_server_names() {
    let work_dir = tempfile::tempdir().unwrap();
    let sibling = format!("{ROOT}/web10/20240101/billing/app.log");
    let wanted = format!("{ROOT}/web1/20240101/billing/app.log");
    let mut source = FakeSource::default();
    source
        .listings
        .insert("billing".to_string(), vec![sibling.clone(), wanted.clone()]);
    source.files.insert(sibling, file_content("web10"));
    source.files.insert(wanted, file_content("web1"));
    let source = Arc::new(source);
    let storage = Arc::new(FakeStorage::default());
    let mut request = request(&["billing"]);
    request.from_server = Some("web1".to_string());

    let report = pipeline(
        Arc::clone(&source),
        Arc::clone(&storage),
        work_dir.path(),
        RetryStrategy::Immediate(1),
    )
    .run(request)
    .await
    .unwrap();

    assert_eq!(report.paths_skipped, 1);
    assert_eq!(report.files_downloaded, 1);
    let records = storage.records.lock().unwrap();
    assert!(records.iter().all(|r| r.tags["host"] == "web1"));
    assert_eq!(records.len(), 3);
}
