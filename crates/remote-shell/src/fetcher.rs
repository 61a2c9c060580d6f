// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pulls one remote log file to local storage.
//!
//! The remote command streams the file through `decompress | redact | gzip`.
//! Its standard input doubles as a one-byte control channel: the local side
//! announces it is ready with [`MARKER_OK`], inflates the incoming gzip stream
//! into the local file, then acknowledges with [`MARKER_OK`] or
//! [`MARKER_FAILED`]. Inflating happens on a blocking task so the wait for the
//! remote exit and the read of its output never wait on each other.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinError;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error};

use crate::errors::{FetchError, HandshakeError, TransportError};
use crate::transport::{Connector, RemoteShell};

/// Ready / success marker written on the control channel.
pub const MARKER_OK: u8 = 0x00;
/// Local failure marker written on the control channel.
pub const MARKER_FAILED: u8 = 0x02;

const OUTPUT_PIPE_CAPACITY: usize = 64 * 1024;
const CONTROL_PIPE_CAPACITY: usize = 16;
const FORWARD_CHUNK_SIZE: usize = 8 * 1024;

/// `sed` program removing request bodies from the streamed log.
const REDACT_REQUEST_BODY: &str = r#"s/(.*) requestBody=".*" (serveTime.*)/\1 \2/"#;

/// Control handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingRemoteOutput,
    Relaying,
    AwaitingAck,
    Done,
}

/// Writes the control bytes in the only order the remote side accepts.
pub struct Handshake<W> {
    control: W,
    state: HandshakeState,
}

impl<W: AsyncWrite + Unpin> Handshake<W> {
    pub fn new(control: W) -> Self {
        Handshake {
            control,
            state: HandshakeState::AwaitingRemoteOutput,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn require_state(&self, state: HandshakeState, action: &'static str) -> Result<(), FetchError> {
        if self.state == state {
            Ok(())
        } else {
            Err(HandshakeError {
                action,
                state: self.state,
            }
            .into())
        }
    }

    /// Tells the remote side the local reader is in place.
    pub async fn signal_ready(&mut self) -> Result<(), FetchError> {
        self.require_state(HandshakeState::AwaitingRemoteOutput, "signal ready")?;
        self.write(MARKER_OK).await?;
        self.state = HandshakeState::Relaying;
        Ok(())
    }

    /// Marks the end of the inbound stream.
    pub fn relay_finished(&mut self) -> Result<(), FetchError> {
        self.require_state(HandshakeState::Relaying, "finish relaying")?;
        self.state = HandshakeState::AwaitingAck;
        Ok(())
    }

    /// Sends the final verdict and closes the control channel.
    pub async fn acknowledge(&mut self, success: bool) -> Result<(), FetchError> {
        self.require_state(HandshakeState::AwaitingAck, "acknowledge")?;
        let marker = if success { MARKER_OK } else { MARKER_FAILED };
        // The remote command may already be gone; the verdict is best effort.
        if let Err(e) = self.write(marker).await {
            debug!("control channel closed before acknowledgement: {e}");
        }
        let _ = self.control.shutdown().await;
        self.state = HandshakeState::Done;
        Ok(())
    }

    async fn write(&mut self, marker: u8) -> Result<(), FetchError> {
        self.control
            .write_all(&[marker])
            .await
            .map_err(FetchError::Control)?;
        self.control.flush().await.map_err(FetchError::Control)
    }
}

/// Builds the remote pipeline streaming `remote_path` as redacted gzip.
#[must_use]
pub fn fetch_command(remote_path: &str) -> String {
    let decompress = if remote_path.ends_with(".xz") {
        "xzcat"
    } else if remote_path.ends_with(".gz") {
        "zcat"
    } else {
        "cat"
    };
    format!(
        "{decompress} {} |sed -re '{REDACT_REQUEST_BODY}' |gzip -qc",
        shell_quote(remote_path)
    )
}

/// Single-quotes `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub struct Fetcher<C: Connector> {
    shell: Arc<RemoteShell<C>>,
    idle_timeout: Duration,
}

/// Whichever half of a transfer completed first.
enum Finished {
    Command(Result<(), TransportError>),
    Relay(Result<Result<u64, FetchError>, JoinError>),
}

impl<C: Connector> Fetcher<C> {
    /// `idle_timeout` bounds the wait for each chunk of the remote stream,
    /// not the whole transfer.
    pub fn new(shell: Arc<RemoteShell<C>>, idle_timeout: Duration) -> Self {
        Fetcher {
            shell,
            idle_timeout,
        }
    }

    /// Downloads `remote_path` into `local_path`, returning the number of
    /// decompressed bytes written. Any failure fails the whole fetch.
    pub async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, FetchError> {
        let local_file_error = |source| FetchError::LocalFile {
            path: local_path.display().to_string(),
            source,
        };
        let file = tokio::fs::File::create(local_path)
            .await
            .map_err(local_file_error)?
            .into_std()
            .await;

        let (mut output_writer, output_reader) = tokio::io::duplex(OUTPUT_PIPE_CAPACITY);
        let (control_writer, mut control_reader) = tokio::io::duplex(CONTROL_PIPE_CAPACITY);

        let mut relay = tokio::spawn(receive(
            Handshake::new(control_writer),
            output_reader,
            file,
            self.idle_timeout,
        ));

        let command = fetch_command(remote_path);
        debug!("Fetching {remote_path} with: {command}");
        let mut stderr = Vec::new();
        let mut run = Box::pin(self.shell.run_once(
            &command,
            &mut control_reader,
            &mut output_writer,
            &mut stderr,
        ));

        let finished = tokio::select! {
            result = &mut run => Finished::Command(result),
            received = &mut relay => Finished::Relay(received),
        };
        let (run_result, received) = match finished {
            Finished::Command(result) => {
                drop(run);
                // Unblocks the inflater when the session never got to stream anything.
                drop(output_writer);
                drop(control_reader);
                (Some(result), relay.await?)
            }
            // A stalled stream leaves the session hanging; abandon it.
            Finished::Relay(received) => match received? {
                Err(FetchError::Timeout(idle)) => {
                    drop(run);
                    (None, Err(FetchError::Timeout(idle)))
                }
                received => (Some(run.await), received),
            },
        };

        if !stderr.is_empty() {
            debug!(
                "remote stderr for {remote_path}: {}",
                String::from_utf8_lossy(&stderr).trim_end()
            );
        }
        match run_result {
            // The output pipe broke because the inflater gave up first.
            Some(Err(TransportError::Io(_))) if received.is_err() => received,
            Some(Err(e)) => Err(e.into()),
            Some(Ok(())) | None => received,
        }
    }
}

/// Local half of the transfer: handshake plus inflate into `file`.
async fn receive(
    mut handshake: Handshake<DuplexStream>,
    mut output: DuplexStream,
    file: File,
    idle_timeout: Duration,
) -> Result<u64, FetchError> {
    handshake.signal_ready().await?;

    let (mut feed, inflater_input) = tokio::io::duplex(OUTPUT_PIPE_CAPACITY);
    let task = tokio::task::spawn_blocking(move || inflate(inflater_input, file));
    let streamed = forward(&mut output, &mut feed, idle_timeout).await;
    drop(feed);
    let inflated = task.await;

    let outcome = match (streamed, inflated) {
        (Err(e), _) => Err(e),
        (Ok(()), Ok(Ok(bytes))) => Ok(bytes),
        (Ok(()), Ok(Err(e))) => Err(FetchError::Decompress(e)),
        (Ok(()), Err(e)) => Err(FetchError::Join(e)),
    };

    handshake.relay_finished()?;
    if let Err(e) = &outcome {
        error!("Failed to read gzip: {e}");
    }
    handshake.acknowledge(outcome.is_ok()).await?;
    outcome
}

/// Moves the remote stream to the inflater, failing once no chunk arrived
/// for `idle_timeout`.
async fn forward(
    output: &mut DuplexStream,
    feed: &mut DuplexStream,
    idle_timeout: Duration,
) -> Result<(), FetchError> {
    let mut chunk = vec![0u8; FORWARD_CHUNK_SIZE];
    loop {
        let read = tokio::time::timeout(idle_timeout, output.read(&mut chunk))
            .await
            .map_err(|_| FetchError::Timeout(idle_timeout))?;
        let n = read.map_err(FetchError::Decompress)?;
        if n == 0 {
            return Ok(());
        }
        // The inflater stopped early and reports its own error.
        if feed.write_all(&chunk[..n]).await.is_err() {
            return Ok(());
        }
    }
}

fn inflate(output: DuplexStream, file: File) -> std::io::Result<u64> {
    let mut decoder = MultiGzDecoder::new(SyncIoBridge::new(output));
    let mut writer = BufWriter::new(file);
    let bytes = std::io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(bytes)
}
