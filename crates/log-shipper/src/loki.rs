// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loki adapter using the gzip-compressed JSON push API.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info};

use crate::constants::{
    LOKI_RATE_LIMIT_BYTES, LOKI_RATE_LIMIT_WINDOW, LOKI_THROTTLED_ATTEMPTS, LOKI_THROTTLED_PAUSE,
    REQUEST_TIMEOUT,
};
use crate::errors::DeliveryError;
use crate::rate_limit::RateLimiter;
use crate::record::{FieldValue, LogRecord};
use crate::storage::{Backend, Batch};

/// Stream labels of one record, in fingerprint order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pairs: Vec<(String, String)>,
}

impl Labels {
    /// `app` comes first, the record's tags follow in key order. Values
    /// containing `{` are left out.
    #[must_use]
    pub fn from_record(record: &LogRecord) -> Self {
        let mut pairs = vec![("app".to_string(), record.app.clone())];
        for (key, value) in &record.tags {
            if key == "app" || value.is_empty() || value.contains('{') {
                continue;
            }
            pairs.push((key.clone(), value.clone()));
        }
        Labels { pairs }
    }

    /// The `{key="value",...}` form used to group entries into streams.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let inner: Vec<String> = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }

    fn to_map(&self) -> BTreeMap<String, String> {
        self.pairs.iter().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct LokiEntry {
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

#[derive(Debug, Clone)]
struct Stream {
    labels: Labels,
    entries: Vec<(DateTime<Utc>, String)>,
}

/// Entries grouped by label fingerprint.
#[derive(Debug, Default, Clone)]
pub struct LokiBatch {
    streams: HashMap<String, Stream>,
    count: usize,
}

impl LokiBatch {
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// JSON push body with every stream's entries in timestamp order.
    pub fn to_push_request(&self) -> Result<Vec<u8>, DeliveryError> {
        let mut streams = Vec::with_capacity(self.streams.len());
        for stream in self.streams.values() {
            let mut entries = stream.entries.clone();
            entries.sort_by_key(|(ts, _)| *ts);
            let mut values = Vec::with_capacity(entries.len());
            for (ts, line) in entries {
                let nanos = ts.timestamp_nanos_opt().ok_or_else(|| {
                    DeliveryError::Encode(format!("timestamp {ts} out of range"))
                })?;
                values.push([nanos.to_string(), line]);
            }
            streams.push(PushStream {
                stream: stream.labels.to_map(),
                values,
            });
        }
        serde_json::to_vec(&PushRequest { streams })
            .map_err(|e| DeliveryError::Encode(e.to_string()))
    }
}

impl Batch for LokiBatch {
    type Entry = LokiEntry;

    fn push(&mut self, entry: LokiEntry) {
        let fingerprint = entry.labels.fingerprint();
        self.streams
            .entry(fingerprint)
            .or_insert_with(|| Stream {
                labels: entry.labels,
                entries: Vec::new(),
            })
            .entries
            .push((entry.timestamp, entry.line));
        self.count += 1;
    }

    fn len(&self) -> usize {
        self.count
    }
}

#[derive(Serialize)]
struct PushRequest {
    streams: Vec<PushStream>,
}

#[derive(Serialize)]
struct PushStream {
    stream: BTreeMap<String, String>,
    values: Vec<[String; 2]>,
}

pub struct LokiBackend {
    client: reqwest::Client,
    url: String,
    limiter: RateLimiter,
    throttled_pause: Duration,
}

impl LokiBackend {
    pub fn new(url: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(LokiBackend {
            client,
            url: url.into(),
            limiter: RateLimiter::new(LOKI_RATE_LIMIT_WINDOW, LOKI_RATE_LIMIT_BYTES),
            throttled_pause: LOKI_THROTTLED_PAUSE,
        })
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn with_throttled_pause(mut self, pause: Duration) -> Self {
        self.throttled_pause = pause;
        self
    }
}

#[async_trait]
impl Backend for LokiBackend {
    type Batch = LokiBatch;

    fn name(&self) -> &'static str {
        "LOKI"
    }

    fn encode(&self, record: LogRecord) -> Result<LokiEntry, DeliveryError> {
        let labels = Labels::from_record(&record);
        let line = match record.raw() {
            Some(raw) => raw.to_string(),
            None => render_fields(&record),
        };
        Ok(LokiEntry {
            labels,
            timestamp: record.timestamp,
            line,
        })
    }

    async fn send(&self, batch: &LokiBatch) -> Result<(), DeliveryError> {
        let json = batch.to_push_request()?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        let body = encoder
            .finish()
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            self.limiter.acquire(body.len()).await;
            let response = self
                .client
                .post(format!("{}/loki/api/v1/push", self.url))
                .header(CONTENT_TYPE, "application/json")
                .header(CONTENT_ENCODING, "gzip")
                .body(body.clone())
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                debug!("LOKI | Pushed {} streams", batch.stream_count());
                return Ok(());
            }
            if status == StatusCode::TOO_MANY_REQUESTS && attempts < LOKI_THROTTLED_ATTEMPTS {
                info!("LOKI | Throttled, retrying in {:?}", self.throttled_pause);
                tokio::time::sleep(self.throttled_pause).await;
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected { status, body });
        }
    }

    async fn create_destination(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn drop_database(&self) -> Result<(), DeliveryError> {
        info!("LOKI | Dropping a database is not supported, ignoring");
        Ok(())
    }

    async fn drop_measurement(&self, app: &str) -> Result<(), DeliveryError> {
        info!("LOKI | Dropping {} is not supported, ignoring", app);
        Ok(())
    }

    async fn delete_by_date_range(
        &self,
        app: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        info!(
            "LOKI | Deleting {} between {} and {} is not supported, ignoring",
            app, from, to
        );
        Ok(())
    }
}

fn render_fields(record: &LogRecord) -> String {
    record
        .fields
        .iter()
        .map(|(key, value)| match value {
            FieldValue::Str(s) if s.contains(' ') => format!("{key}={s:?}"),
            value => format!("{key}={value}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
