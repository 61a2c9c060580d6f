// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns one syslog line into a [`LogRecord`].
//!
//! Lines look like
//!
//! ```text
//! 2024-01-01T10:00:00.000001+01:00 web1 billing[4242] level=info method=GET took=12ms
//! ```
//!
//! The header gives the timestamp, host and application. The logfmt body
//! becomes fields, with a handful of keys treated specially.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use log_shipper::record::{HOST_TAG, METHOD_TOPIC_TAG, RAW_FIELD};
use log_shipper::{FieldValue, LogRecord};
use tracing::debug;

use crate::duration::parse_duration_millis;
use crate::errors::ParseError;
use crate::logfmt;

/// Keys never forwarded.
const DROPPED_KEYS: &[&str] = &["requestBody"];

/// Keys kept verbatim even when they look numeric.
const STRING_KEYS: &[&str] = &[
    "customer",
    "phone",
    "op",
    "secondaryProj",
    "queueId",
    "userName",
    "mode",
];

const STAT_KEY: &str = "stat";
const STAT_PREFIX: &str = "QueueStat{";
const STAT_SUFFIX: &str = "}";

/// Marker after which Go's monotonic clock reading follows in `time=` values.
const MONOTONIC_MARKER: &str = " m=";

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    queue_monitor_apps: HashSet<String>,
}

impl Normalizer {
    /// `queue_monitor_apps` lists the applications whose `stat` field is
    /// decomposed into integer fields.
    pub fn new<I, S>(queue_monitor_apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Normalizer {
            queue_monitor_apps: queue_monitor_apps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn normalize(&self, line: &str) -> Result<LogRecord, ParseError> {
        let segments: Vec<&str> = line.splitn(4, ' ').collect();
        let &[stamp, host, app_segment, body] = segments.as_slice() else {
            return Err(ParseError::TooShort {
                segments: segments.len(),
                line: line.to_string(),
            });
        };

        let app = app_segment.split('[').next().unwrap_or_default();
        if app.is_empty() {
            return Err(ParseError::MissingApp(app_segment.to_string()));
        }
        let header_time = parse_header_time(stamp);

        let mut record = LogRecord::new(app, header_time.unwrap_or_default(), line.len())
            .with_tag(HOST_TAG, host)
            .with_field(RAW_FIELD, body);
        let mut body_time = None;

        let (pairs, error) = logfmt::decode(body);
        if let Some(error) = error {
            debug!("Partially decoded body of {}: {:?}", app, error);
        }
        for (key, value) in pairs {
            if DROPPED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if STRING_KEYS.contains(&key.as_str()) {
                record.fields.insert(key, FieldValue::Str(value));
            } else if key == "method" || key == "topic" {
                record.tags.insert(METHOD_TOPIC_TAG.to_string(), value);
            } else if key == "time" {
                body_time = parse_body_time(&value).or(body_time);
            } else if key == STAT_KEY {
                if self.queue_monitor_apps.contains(app) {
                    decompose_stat(&value, &mut record);
                }
                record.fields.insert(key, FieldValue::Str(value));
            } else {
                record.fields.insert(key, infer_type(value));
            }
        }

        record.timestamp = match (body_time, header_time) {
            (Some(time), _) | (None, Some(time)) => time,
            (None, None) => return Err(ParseError::Timestamp(stamp.to_string())),
        };
        Ok(record)
    }
}

/// Integer, then float, then duration in milliseconds, else the string itself.
#[must_use]
pub fn infer_type(value: String) -> FieldValue {
    if let Ok(i) = value.parse::<i64>() {
        return FieldValue::Int(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return FieldValue::Float(f);
    }
    if let Some(ms) = parse_duration_millis(&value) {
        return FieldValue::Int(ms);
    }
    FieldValue::Str(value)
}

fn parse_header_time(stamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(stamp) {
        return Some(time.with_timezone(&Utc));
    }
    let naive = stamp.split('+').next().unwrap_or_default();
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|time| time.and_utc())
}

/// Parses `2024-01-01 10:00:00.123456 +0100 CET m=+0.0012`.
fn parse_body_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.split(MONOTONIC_MARKER).next().unwrap_or_default().trim();
    let value = match value.rsplit_once(' ') {
        Some((head, zone)) if zone.chars().all(|c| c.is_ascii_alphabetic()) => head,
        _ => value,
    };
    DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// `QueueStat{running=0, completed=3, lastJobTime=...}` adds `running` and
/// `completed` as integer fields.
fn decompose_stat(value: &str, record: &mut LogRecord) {
    let inner = value.strip_prefix(STAT_PREFIX).unwrap_or(value);
    let inner = inner.strip_suffix(STAT_SUFFIX).unwrap_or(inner);
    for pair in inner.split(", ") {
        let Some((key, raw)) = pair.split_once('=') else {
            continue;
        };
        if let Ok(i) = raw.parse::<i64>() {
            record.fields.insert(key.to_string(), FieldValue::Int(i));
        }
    }
}
