// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size- and time-triggered batching in front of a [`Backend`].
//!
//! ```text
//!   BatchClient::send ──► mpsc (bounded) ──► BatchService::run
//!                                              │   record: size check, push
//!                                              │   timer:  flush if non-empty
//!                                              ▼
//!                                           Backend::send
//! ```
//!
//! The service task owns the batch exclusively. A flush swaps the batch for an
//! empty one before the backend sees it, so a failed send never blocks the
//! records that arrive afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

use crate::errors::DeliveryError;
use crate::record::LogRecord;
use crate::storage::{Backend, Batch, Storage};

/// Consume-and-reset counter of records handed to a backend.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    sent: AtomicU64,
}

impl DeliveryStats {
    pub fn add(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the count accumulated since the previous call and resets it.
    pub fn take(&self) -> u64 {
        self.sent.swap(0, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    /// Capacity of the inbound channel.
    pub buffer: usize,
    /// Source bytes a batch may hold before it is flushed.
    pub max_size_bytes: usize,
    pub max_wait: Duration,
}

enum BatchCommand<E> {
    Insert { entry: E, size: usize },
    Shutdown(oneshot::Sender<()>),
}

struct BatchService<B: Backend> {
    backend: Arc<B>,
    rx: mpsc::Receiver<BatchCommand<<B::Batch as Batch>::Entry>>,
    settings: BatchSettings,
    stats: Arc<DeliveryStats>,
    batch: B::Batch,
    size: usize,
}

impl<B: Backend> BatchService<B> {
    async fn run(mut self) {
        debug!("{} batch service started", self.backend.name());
        let timer = sleep(self.settings.max_wait);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(BatchCommand::Insert { entry, size }) => {
                        self.size += size;
                        if self.size > self.settings.max_size_bytes {
                            if !self.batch.is_empty() {
                                self.flush().await;
                                timer.as_mut().reset(Instant::now() + self.settings.max_wait);
                            }
                            self.size = size;
                        }
                        self.batch.push(entry);
                    }
                    Some(BatchCommand::Shutdown(done)) => {
                        self.drain().await;
                        if done.send(()).is_err() {
                            debug!("{} shutdown requester went away", self.backend.name());
                        }
                        return;
                    }
                    None => {
                        self.drain().await;
                        return;
                    }
                },
                () = &mut timer => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                    self.size = 0;
                    timer.as_mut().reset(Instant::now() + self.settings.max_wait);
                }
            }
        }
    }

    async fn drain(&mut self) {
        self.rx.close();
        while let Some(command) = self.rx.recv().await {
            match command {
                BatchCommand::Insert { entry, .. } => self.batch.push(entry),
                BatchCommand::Shutdown(done) => {
                    let _ = done.send(());
                }
            }
        }
        if !self.batch.is_empty() {
            self.flush().await;
        }
        debug!("{} batch service stopped", self.backend.name());
    }

    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        let count = batch.len();
        self.size = 0;
        // Counted before the attempt: this tracks hand-off, not confirmation.
        self.stats.add(count as u64);
        debug!("{} | Flushing {} records", self.backend.name(), count);

        match self.backend.send(&batch).await {
            Ok(()) => {}
            Err(DeliveryError::DestinationMissing(reason)) => {
                warn!(
                    "{} | Destination missing ({}), creating it",
                    self.backend.name(),
                    reason
                );
                if let Err(e) = self.backend.create_destination().await {
                    error!("{} | Unable to create destination: {}", self.backend.name(), e);
                    return;
                }
                if let Err(e) = self.backend.send(&batch).await {
                    error!(
                        "{} | Dropping {} records after recreating destination: {}",
                        self.backend.name(),
                        count,
                        e
                    );
                }
            }
            Err(e) => {
                error!("{} | Dropping {} records: {}", self.backend.name(), count, e);
            }
        }
    }
}

/// [`Storage`] implementation driving one [`BatchService`] task.
pub struct BatchClient<B: Backend> {
    backend: Arc<B>,
    tx: mpsc::Sender<BatchCommand<<B::Batch as Batch>::Entry>>,
    stats: Arc<DeliveryStats>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> BatchClient<B> {
    /// Spawns the coordination task on the current runtime.
    pub fn start(backend: B, settings: BatchSettings) -> Self {
        let backend = Arc::new(backend);
        let stats = Arc::new(DeliveryStats::default());
        let (tx, rx) = mpsc::channel(settings.buffer.max(1));
        let service = BatchService {
            backend: Arc::clone(&backend),
            rx,
            settings,
            stats: Arc::clone(&stats),
            batch: B::Batch::default(),
            size: 0,
        };
        let task = tokio::spawn(service.run());
        BatchClient {
            backend,
            tx,
            stats,
            task: Mutex::new(Some(task)),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: Backend> Storage for BatchClient<B> {
    async fn send(&self, record: LogRecord) -> Result<(), DeliveryError> {
        let size = record.size_bytes;
        let entry = self.backend.encode(record)?;
        self.tx
            .send(BatchCommand::Insert { entry, size })
            .await
            .map_err(|_| DeliveryError::Closed)
    }

    async fn drop_database(&self) -> Result<(), DeliveryError> {
        self.backend.drop_database().await
    }

    async fn drop_measurement(&self, app: &str) -> Result<(), DeliveryError> {
        self.backend.drop_measurement(app).await
    }

    async fn delete_by_date_range(
        &self,
        app: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        self.backend.delete_by_date_range(app, from, to).await
    }

    async fn stop(&self) -> Result<(), DeliveryError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BatchCommand::Shutdown(done_tx)).await.is_ok() {
            // A dropped sender means the service already finished.
            let _ = done_rx.await;
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("{} batch service failed: {}", self.backend.name(), e);
            }
        }
        Ok(())
    }

    fn already_sent(&self) -> u64 {
        self.stats.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_stats_consume_and_reset() {
        let stats = DeliveryStats::default();
        stats.add(3);
        stats.add(4);
        assert_eq!(stats.take(), 7);
        assert_eq!(stats.take(), 0);
    }
}
