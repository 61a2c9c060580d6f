// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! InfluxDB 1.x adapter speaking line protocol over HTTP.

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::constants::REQUEST_TIMEOUT;
use crate::errors::DeliveryError;
use crate::record::{FieldValue, LogRecord};
use crate::storage::{Backend, Batch};

#[derive(Debug, Clone)]
pub struct InfluxDbConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Encoded points waiting for one `/write` call.
#[derive(Debug, Default, Clone)]
pub struct InfluxBatch {
    lines: Vec<String>,
}

impl InfluxBatch {
    #[must_use]
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }
}

impl Batch for InfluxBatch {
    type Entry = String;

    fn push(&mut self, entry: String) {
        self.lines.push(entry);
    }

    fn len(&self) -> usize {
        self.lines.len()
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct StatementResult {
    error: Option<String>,
}

pub struct InfluxDbBackend {
    client: reqwest::Client,
    config: InfluxDbConfig,
}

impl InfluxDbBackend {
    pub fn new(config: InfluxDbConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(InfluxDbBackend { client, config })
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.config.database
    }

    async fn query(&self, statement: &str, database: Option<&str>) -> Result<(), DeliveryError> {
        debug!("INFLUXDB | {}", statement);
        let mut params = vec![("q", statement)];
        if let Some(db) = database {
            params.push(("db", db));
        }
        let response = self
            .client
            .post(format!("{}/query", self.config.url))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(DeliveryError::Rejected { status, body });
        }
        let parsed: QueryResponse = serde_json::from_str(&body)
            .map_err(|e| DeliveryError::Query(format!("unreadable response: {e}")))?;
        if let Some(error) = parsed.error {
            return Err(DeliveryError::Query(error));
        }
        match parsed.results.into_iter().find_map(|r| r.error) {
            Some(error) => Err(DeliveryError::Query(error)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Backend for InfluxDbBackend {
    type Batch = InfluxBatch;

    fn name(&self) -> &'static str {
        "INFLUXDB"
    }

    fn encode(&self, record: LogRecord) -> Result<String, DeliveryError> {
        encode_point(&record)
    }

    async fn send(&self, batch: &InfluxBatch) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(format!("{}/write", self.config.url))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[("db", self.config.database.as_str()), ("precision", "ns")])
            .body(batch.body())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND && body.contains("database not found") {
            return Err(DeliveryError::DestinationMissing(body));
        }
        Err(DeliveryError::Rejected { status, body })
    }

    async fn create_destination(&self) -> Result<(), DeliveryError> {
        let statement = format!("CREATE DATABASE {}", quote_ident(&self.config.database));
        self.query(&statement, None).await
    }

    async fn drop_database(&self) -> Result<(), DeliveryError> {
        let statement = format!("DROP DATABASE {}", quote_ident(&self.config.database));
        self.query(&statement, None).await
    }

    async fn drop_measurement(&self, app: &str) -> Result<(), DeliveryError> {
        let statement = format!("DROP MEASUREMENT {}", quote_ident(app));
        self.query(&statement, Some(&self.config.database)).await
    }

    async fn delete_by_date_range(
        &self,
        app: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        let statement = format!(
            "DELETE FROM {} WHERE time >= '{}' AND time < '{}'",
            quote_ident(app),
            from.to_rfc3339_opts(SecondsFormat::Secs, true),
            to.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        self.query(&statement, Some(&self.config.database)).await
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Renders one record as a line-protocol point with a nanosecond timestamp.
pub fn encode_point(record: &LogRecord) -> Result<String, DeliveryError> {
    let mut line = String::with_capacity(record.size_bytes + 64);
    escape_into(&mut line, &record.app, &[',', ' ']);

    for (key, value) in &record.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        escape_into(&mut line, key, &[',', '=', ' ']);
        line.push('=');
        escape_into(&mut line, value, &[',', '=', ' ']);
    }

    let mut separator = ' ';
    for (key, value) in &record.fields {
        if let FieldValue::Float(v) = value {
            if !v.is_finite() {
                continue;
            }
        }
        line.push(separator);
        separator = ',';
        escape_into(&mut line, key, &[',', '=', ' ']);
        line.push('=');
        match value {
            FieldValue::Str(s) => {
                line.push('"');
                escape_into(&mut line, s, &['"', '\\']);
                line.push('"');
            }
            FieldValue::Int(i) => {
                let _ = write!(line, "{i}i");
            }
            FieldValue::Float(v) => {
                let _ = write!(line, "{v}");
            }
        }
    }
    if separator == ' ' {
        return Err(DeliveryError::Encode(format!(
            "record for {} has no fields",
            record.app
        )));
    }

    let nanos = record.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        DeliveryError::Encode(format!("timestamp {} out of range", record.timestamp))
    })?;
    let _ = write!(line, " {nanos}");
    Ok(line)
}

fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for c in value.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            c if special.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}
