// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use log_shipper::DeliveryError;
use remote_shell::{FetchError, TransportError};

/// Why a single line was rejected. Lines are never retried on these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("too short log line ({segments} segments): {line}")]
    TooShort { segments: usize, line: String },

    #[error("no application in segment {0:?}")]
    MissingApp(String),

    #[error("unable to parse timestamp {0:?}")]
    Timestamp(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SSH_AUTH_SOCK environment variable is not set")]
    MissingAgentSocket,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("remote command failed: {0}")]
    Transport(#[from] TransportError),

    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    Delivery(#[from] DeliveryError),

    #[error("unable to read {path}: {source}")]
    LocalFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("remote path {0} does not follow <root>/<server>/<date>/<app>/<file>")]
    UnexpectedPath(String),
}
