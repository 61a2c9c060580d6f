// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log_shipper::{
    Backend, Batch, BatchClient, BatchSettings, DeliveryError, LogRecord, Storage,
};
use tracing_test::traced_test;

#[derive(Default)]
struct FakeBatch(Vec<String>);

impl Batch for FakeBatch {
    type Entry = String;

    fn push(&mut self, entry: String) {
        self.0.push(entry);
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Default)]
struct Recorder {
    sends: Mutex<Vec<Vec<String>>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    creates: AtomicUsize,
}

impl Recorder {
    fn sends(&self) -> Vec<Vec<String>> {
        self.sends.lock().unwrap().clone()
    }

    fn fail_next(&self, error: DeliveryError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

struct FakeBackend(Arc<Recorder>);

#[async_trait]
impl Backend for FakeBackend {
    type Batch = FakeBatch;

    fn name(&self) -> &'static str {
        "FAKE"
    }

    fn encode(&self, record: LogRecord) -> Result<String, DeliveryError> {
        Ok(record.raw().unwrap_or_default().to_string())
    }

    async fn send(&self, batch: &FakeBatch) -> Result<(), DeliveryError> {
        self.0.sends.lock().unwrap().push(batch.0.clone());
        match self.0.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn create_destination(&self) -> Result<(), DeliveryError> {
        self.0.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drop_database(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn drop_measurement(&self, _app: &str) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn delete_by_date_range(
        &self,
        _app: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }
}

fn client(max_size_bytes: usize) -> (BatchClient<FakeBackend>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let client = BatchClient::start(
        FakeBackend(Arc::clone(&recorder)),
        BatchSettings {
            buffer: 16,
            max_size_bytes,
            max_wait: Duration::from_secs(5),
        },
    );
    (client, recorder)
}

fn record(line: &str, size: usize) -> LogRecord {
    LogRecord::new("billing", Utc::now(), size).with_field("raw", line)
}

#[tokio::test(start_paused = true)]
async fn test_overflowing_record_flushes_previous_batch_immediately() {
    let (client, recorder) = client(100);

    client.send(record("a", 40)).await.unwrap();
    client.send(record("b", 40)).await.unwrap();
    client.send(record("c", 40)).await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(recorder.sends(), vec![vec!["a", "b"]]);

    // Only the 40 bytes of "c" carry over: 40 + 50 stays under the threshold.
    client.send(record("d", 50)).await.unwrap();
    tokio::task::yield_now().await;
    assert_eq!(recorder.sends().len(), 1);

    client.stop().await.unwrap();
    assert_eq!(recorder.sends(), vec![vec!["a", "b"], vec!["c", "d"]]);
}

#[tokio::test(start_paused = true)]
async fn test_exact_threshold_does_not_flush() {
    let (client, recorder) = client(100);

    client.send(record("a", 50)).await.unwrap();
    client.send(record("b", 50)).await.unwrap();
    tokio::task::yield_now().await;
    assert!(recorder.sends().is_empty());

    client.stop().await.unwrap();
    assert_eq!(recorder.sends(), vec![vec!["a", "b"]]);
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_non_empty_batch_and_rearms() {
    let (client, recorder) = client(1_000);

    client.send(record("a", 10)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(recorder.sends(), vec![vec!["a"]]);

    // Idle periods do not produce empty flushes.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(recorder.sends().len(), 1);

    client.send(record("b", 10)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(recorder.sends(), vec![vec!["a"], vec!["b"]]);

    client.stop().await.unwrap();
    assert_eq!(recorder.sends().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_empty_batch_does_not_flush() {
    let (client, recorder) = client(100);

    client.stop().await.unwrap();

    assert!(recorder.sends().is_empty());
    assert!(matches!(
        client.send(record("late", 1)).await,
        Err(DeliveryError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sent_count_includes_failed_batches() {
    let (client, recorder) = client(1_000);
    recorder.fail_next(DeliveryError::Query("boom".to_string()));

    for line in ["a", "b", "c"] {
        client.send(record(line, 1)).await.unwrap();
    }
    client.stop().await.unwrap();

    assert_eq!(recorder.sends().len(), 1);
    assert_eq!(client.already_sent(), 3);
    assert_eq!(client.already_sent(), 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_missing_destination_is_created_and_batch_resent() {
    let (client, recorder) = client(1_000);
    recorder.fail_next(DeliveryError::DestinationMissing(
        "database not found: log".to_string(),
    ));

    client.send(record("a", 1)).await.unwrap();
    client.stop().await.unwrap();

    assert_eq!(recorder.creates.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.sends(), vec![vec!["a"], vec!["a"]]);
    assert_eq!(client.already_sent(), 1);
    assert!(logs_contain("Destination missing"));
}
