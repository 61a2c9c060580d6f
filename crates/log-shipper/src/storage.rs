// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contracts between the pipeline, the delivery engine and the backends.
//!
//! The pipeline only sees [`Storage`]. A [`crate::batch_client::BatchClient`]
//! implements it on top of any [`Backend`], which knows how to turn records
//! into its own [`Batch`] representation and how to ship one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::DeliveryError;
use crate::record::LogRecord;

/// Destination for normalized records.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Queue one record for delivery. Waits while the engine's buffer is full.
    async fn send(&self, record: LogRecord) -> Result<(), DeliveryError>;

    async fn drop_database(&self) -> Result<(), DeliveryError>;

    async fn drop_measurement(&self, app: &str) -> Result<(), DeliveryError>;

    /// Remove the records of `app` with `from <= time < to`.
    async fn delete_by_date_range(
        &self,
        app: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), DeliveryError>;

    /// Flush whatever is buffered and release the engine.
    async fn stop(&self) -> Result<(), DeliveryError>;

    /// Records handed to the backend since the previous call.
    fn already_sent(&self) -> u64;
}

/// Backend-specific accumulation of encoded records.
pub trait Batch: Default + Send + Sync + 'static {
    type Entry: Send + Sync + 'static;

    fn push(&mut self, entry: Self::Entry);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wire adapter for one storage system.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Batch: Batch;

    fn name(&self) -> &'static str;

    fn encode(&self, record: LogRecord) -> Result<<Self::Batch as Batch>::Entry, DeliveryError>;

    async fn send(&self, batch: &Self::Batch) -> Result<(), DeliveryError>;

    /// Recreate the destination after [`DeliveryError::DestinationMissing`].
    async fn create_destination(&self) -> Result<(), DeliveryError>;

    async fn drop_database(&self) -> Result<(), DeliveryError>;

    async fn drop_measurement(&self, app: &str) -> Result<(), DeliveryError>;

    async fn delete_by_date_range(
        &self,
        app: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), DeliveryError>;
}
