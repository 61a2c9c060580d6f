// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Command execution over a single shared remote connection.
//!
//! A [`RemoteShell`] owns at most one live connection per host. The connection
//! is created lazily by the first caller that needs a session and dropped as
//! soon as it shows a transport-level failure, so the next caller reconnects.
//! Only the connect-or-reuse decision is serialized; once a session is open the
//! command runs without holding the lock.
//!
//! ```text
//!   stdin reader ──relay──▶ channel stdin
//!                             │
//!                          remote command
//!                             │
//!   stdout writer ◀─relay── Stdout events ◀─┐
//!   stderr writer ◀─relay── Stderr events ◀─┴── dispatch (channel events)
//! ```

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::TransportError;

/// Number of output chunks buffered per relay before dispatch waits.
const RELAY_BUFFER: usize = 64;

pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// One event observed on an exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
}

/// How a remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Exit {
    Status(u32),
    Signal(String),
}

/// Produces new connections to the remote host.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Human readable `host:port` used in logs and errors.
    fn address(&self) -> String;

    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// An established connection able to multiplex command sessions.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type Channel: ExecChannel;

    async fn open_channel(&self) -> Result<Self::Channel, TransportError>;
}

/// A single command session.
#[async_trait]
pub trait ExecChannel: Send + 'static {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Writer feeding the command's standard input. Shutting it down sends EOF.
    fn stdin(&mut self) -> BoxedWriter;

    /// Next stdout/stderr chunk or exit notification. `None` once the channel
    /// is closed.
    async fn next_event(&mut self) -> Option<ChannelEvent>;
}

/// Lazily connected shell on one remote host.
pub struct RemoteShell<C: Connector> {
    connector: C,
    connection: Mutex<Option<Arc<C::Connection>>>,
}

impl<C: Connector> RemoteShell<C> {
    pub fn new(connector: C) -> Self {
        RemoteShell {
            connector,
            connection: Mutex::new(None),
        }
    }

    pub fn address(&self) -> String {
        self.connector.address()
    }

    /// Establishes the connection if none is cached.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut guard = self.connection.lock().await;
        self.ensure_connected(&mut guard).await.map(|_| ())
    }

    async fn ensure_connected(
        &self,
        slot: &mut Option<Arc<C::Connection>>,
    ) -> Result<Arc<C::Connection>, TransportError> {
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }
        debug!("Connect to: {}", self.connector.address());
        let connection = Arc::new(self.connector.connect().await?);
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Opens a fresh command session, connecting first when needed.
    pub async fn new_session(&self) -> Result<<C::Connection as Connection>::Channel, TransportError> {
        let connection = {
            let mut guard = self.connection.lock().await;
            self.ensure_connected(&mut guard).await?
        };
        match connection.open_channel().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                self.discard(&connection).await;
                Err(e)
            }
        }
    }

    /// Drops the cached connection if it is still the given one.
    async fn discard(&self, broken: &Arc<C::Connection>) {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().is_some_and(|c| Arc::ptr_eq(c, broken)) {
            *guard = None;
        }
    }

    async fn discard_current(&self) {
        self.connection.lock().await.take();
    }

    /// Runs `command` and copies its output to `stdout` and `stderr` once it
    /// ended. A missing exit status drops the connection and the command is
    /// issued once more on a new connection; the second outcome is final and
    /// output of the abandoned attempt is discarded.
    ///
    /// Output is buffered per attempt. Use [`RemoteShell::run_once`] to stream.
    pub async fn run<R, W, E>(
        &self,
        command: &str,
        stdin: &mut R,
        stdout: &mut W,
        stderr: &mut E,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let mut attempt_stdout = Vec::new();
        let mut attempt_stderr = Vec::new();
        let mut result = self
            .run_once(command, stdin, &mut attempt_stdout, &mut attempt_stderr)
            .await;
        if let Err(TransportError::ExitMissing) = result {
            warn!("Exit code missing, reconnecting to {}", self.address());
            attempt_stdout.clear();
            attempt_stderr.clear();
            result = self
                .run_once(command, stdin, &mut attempt_stdout, &mut attempt_stderr)
                .await;
        }

        stdout.write_all(&attempt_stdout).await?;
        stdout.shutdown().await?;
        stderr.write_all(&attempt_stderr).await?;
        stderr.shutdown().await?;
        result
    }

    /// Runs `command` a single time. Connection-level failures still discard
    /// the cached connection, but nothing is retried.
    pub async fn run_once<R, W, E>(
        &self,
        command: &str,
        stdin: &mut R,
        stdout: &mut W,
        stderr: &mut E,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let mut channel = self.new_session().await?;
        channel.exec(command).await?;
        let result = pump(channel, stdin, stdout, stderr).await;
        if let Err(e) = &result {
            if e.is_connection_lost() {
                self.discard_current().await;
            }
        }
        result
    }
}

/// Wires the standard streams of `channel` and waits for the command to end.
async fn pump<Ch, R, W, E>(
    mut channel: Ch,
    stdin: &mut R,
    stdout: &mut W,
    stderr: &mut E,
) -> Result<(), TransportError>
where
    Ch: ExecChannel,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    let mut remote_stdin = channel.stdin();
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(RELAY_BUFFER);
    let (err_tx, err_rx) = mpsc::channel::<Vec<u8>>(RELAY_BUFFER);
    let closed = CancellationToken::new();

    let stdin_relay = async {
        tokio::select! {
            copied = tokio::io::copy(stdin, &mut remote_stdin) => {
                if let Err(e) = copied {
                    debug!("stdin relay stopped: {e}");
                }
                if let Err(e) = remote_stdin.shutdown().await {
                    debug!("unable to close remote stdin: {e}");
                }
            }
            () = closed.cancelled() => {}
        }
    };

    let dispatch = async {
        let mut exit = None;
        while let Some(event) = channel.next_event().await {
            match event {
                // A relay that gave up drops its receiver; keep draining the channel.
                ChannelEvent::Stdout(chunk) => {
                    let _ = out_tx.send(chunk).await;
                }
                ChannelEvent::Stderr(chunk) => {
                    let _ = err_tx.send(chunk).await;
                }
                ChannelEvent::ExitStatus(status) => exit = Some(Exit::Status(status)),
                ChannelEvent::ExitSignal(signal) => exit = Some(Exit::Signal(signal)),
            }
        }
        drop(out_tx);
        drop(err_tx);
        closed.cancel();
        exit
    };

    let (_, exit, stdout_result, stderr_result) = tokio::join!(
        stdin_relay,
        dispatch,
        relay(out_rx, stdout),
        relay(err_rx, stderr)
    );

    match exit {
        None => Err(TransportError::ExitMissing),
        Some(Exit::Signal(signal)) => Err(TransportError::ExitSignal(signal)),
        Some(Exit::Status(0)) => {
            stdout_result?;
            stderr_result?;
            Ok(())
        }
        Some(Exit::Status(status)) => Err(TransportError::ExitStatus(status)),
    }
}

/// Copies chunks into `writer` and shuts it down once the sender side closes.
async fn relay<W>(mut rx: mpsc::Receiver<Vec<u8>>, writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(chunk) = rx.recv().await {
        writer.write_all(&chunk).await?;
    }
    writer.shutdown().await
}
