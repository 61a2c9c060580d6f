// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine tuning for the two backends.
//!
//! InfluxDB accepts large write bodies, so its batches are allowed to grow to
//! roughly ten megabytes of source lines. Loki rejects pushes well before
//! that and is additionally throttled by [`crate::rate_limit::RateLimiter`].

use std::time::Duration;

/// Records that may wait in the engine's inbound channel.
pub const ENTRY_BUFFER_SIZE: usize = 1_000;

/// Flush interval shared by both engines.
pub const BATCH_WAIT: Duration = Duration::from_secs(5);

pub const INFLUXDB_MAX_BATCH_BYTES: usize = 10_000_000;

pub const LOKI_MAX_BATCH_BYTES: usize = 2_000_000;

/// Bytes Loki may receive per [`LOKI_RATE_LIMIT_WINDOW`].
pub const LOKI_RATE_LIMIT_BYTES: usize = 2_000_000;

pub const LOKI_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Attempts made for a push answered with 429 Too Many Requests.
pub const LOKI_THROTTLED_ATTEMPTS: u32 = 3;

pub const LOKI_THROTTLED_PAUSE: Duration = Duration::from_secs(2);

/// Per-request timeout for backend HTTP calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
