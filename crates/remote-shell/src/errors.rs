// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the remote shell transport and the file fetcher.

use std::time::Duration;

use crate::fetcher::HandshakeState;

/// Failures of the connection, of a session, or of a remote command.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The TCP/SSH connection could not be established.
    #[error("failed to dial {address}: {message}")]
    Connect { address: String, message: String },

    /// None of the agent identities were accepted by the server.
    #[error("authentication failed for user {0}")]
    Auth(String),

    /// The key agent could not be reached or refused to answer.
    #[error("ssh agent error: {0}")]
    Agent(String),

    /// A command session could not be opened on the live connection.
    #[error("failed to create session: {0}")]
    Session(String),

    /// The exec request for the command was rejected.
    #[error("failed to execute command: {0}")]
    Exec(String),

    /// The remote side closed the session without reporting an exit status
    /// or an exit signal. The connection is considered broken.
    #[error("remote process exited without an exit status")]
    ExitMissing,

    /// The remote command finished with a non-zero status.
    #[error("remote command exited with status {0}")]
    ExitStatus(u32),

    /// The remote command was killed by a signal.
    #[error("remote command killed by signal {0}")]
    ExitSignal(String),

    #[error("stream relay failed: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the error means the cached connection must be discarded.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::ExitMissing | TransportError::Session(_))
    }
}

/// Invalid transition of the fetch control handshake.
#[derive(Debug, thiserror::Error)]
#[error("handshake cannot {action} while {state:?}")]
pub struct HandshakeError {
    pub action: &'static str,
    pub state: HandshakeState,
}

/// Failures of a single remote-to-local file transfer.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("control handshake failed: {0}")]
    Protocol(#[from] HandshakeError),

    #[error("control channel write failed: {0}")]
    Control(std::io::Error),

    #[error("unable to create local file {path}: {source}")]
    LocalFile {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to decompress remote stream: {0}")]
    Decompress(std::io::Error),

    #[error("no data received for {0:?}")]
    Timeout(Duration),

    #[error("decompression task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
