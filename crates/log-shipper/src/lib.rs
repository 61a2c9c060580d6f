// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batched delivery of parsed log records to InfluxDB or Loki.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch_client;
pub mod constants;
pub mod errors;
pub mod influxdb;
pub mod loki;
pub mod rate_limit;
pub mod record;
pub mod retry;
pub mod storage;

pub use batch_client::{BatchClient, BatchSettings, DeliveryStats};
pub use errors::DeliveryError;
pub use record::{FieldValue, LogRecord};
pub use retry::RetryStrategy;
pub use storage::{Backend, Batch, Storage};
