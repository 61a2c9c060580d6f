// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Failures talking to a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The target database does not exist. The engine creates it and retries.
    #[error("destination missing: {0}")]
    DestinationMissing(String),

    #[error("{status}: backend rejected the request: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The record cannot be represented by the backend.
    #[error("unable to encode record: {0}")]
    Encode(String),

    /// The delivery engine has stopped accepting records.
    #[error("delivery engine is closed")]
    Closed,
}
