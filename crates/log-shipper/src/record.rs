// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The normalized unit handed from the parser to the delivery engines.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Tag carrying the request method or queue topic of a line.
pub const METHOD_TOPIC_TAG: &str = "method_topic";
/// Tag carrying the originating host.
pub const HOST_TAG: &str = "host";
/// Field holding the undecoded body of the line.
pub const RAW_FIELD: &str = "raw";

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl FieldValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Owning application, never empty.
    pub app: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
    /// Length of the source line, used for batch size accounting.
    pub size_bytes: usize,
}

impl LogRecord {
    pub fn new(app: impl Into<String>, timestamp: DateTime<Utc>, size_bytes: usize) -> Self {
        LogRecord {
            app: app.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
            size_bytes,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The undecoded body, if the parser kept it.
    #[must_use]
    pub fn raw(&self) -> Option<&str> {
        self.fields.get(RAW_FIELD).and_then(FieldValue::as_str)
    }
}
