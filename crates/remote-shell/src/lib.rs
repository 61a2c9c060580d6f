// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote command execution and file transfer over SSH.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod errors;
pub mod fetcher;
pub mod ssh;
pub mod transport;

pub use errors::{FetchError, TransportError};
pub use fetcher::Fetcher;
pub use transport::RemoteShell;
