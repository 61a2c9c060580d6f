// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted in-memory connector standing in for an SSH server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use remote_shell::transport::{
    BoxedWriter, ChannelEvent, Connection, Connector, ExecChannel,
};
use remote_shell::TransportError;
use tokio::io::{AsyncReadExt, DuplexStream};

/// What one command session will emit.
#[derive(Clone, Debug, Default)]
pub struct Script {
    pub events: Vec<ChannelEvent>,
    /// Hold the output back until one byte arrived on stdin.
    pub wait_for_stdin: bool,
    /// Pause before each event.
    pub delay: Option<Duration>,
    /// Keep the session open without further events once they ran out.
    pub stall: bool,
}

impl Script {
    pub fn exits(events: Vec<ChannelEvent>) -> Self {
        Script {
            events,
            ..Script::default()
        }
    }
}

#[derive(Default)]
struct FakeState {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
    commands: Mutex<Vec<String>>,
    stdin_seen: Mutex<Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

#[allow(dead_code)]
impl FakeConnector {
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        let connector = FakeConnector::default();
        connector
            .state
            .scripts
            .lock()
            .unwrap()
            .extend(scripts);
        connector
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn stdin_seen(&self) -> Vec<u8> {
        self.state.stdin_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    fn address(&self) -> String {
        "fake:22".to_string()
    }

    async fn connect(&self) -> Result<FakeConnection, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct FakeConnection {
    state: Arc<FakeState>,
}

#[async_trait]
impl Connection for FakeConnection {
    type Channel = FakeChannel;

    async fn open_channel(&self) -> Result<FakeChannel, TransportError> {
        let script = self
            .state
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Session("no script left".to_string()))?;
        let (writer, reader) = tokio::io::duplex(1024);
        Ok(FakeChannel {
            events: script.events.into(),
            wait_for_stdin: script.wait_for_stdin,
            delay: script.delay,
            stall: script.stall,
            stdin_writer: Some(writer),
            stdin_reader: reader,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct FakeChannel {
    events: VecDeque<ChannelEvent>,
    wait_for_stdin: bool,
    delay: Option<Duration>,
    stall: bool,
    stdin_writer: Option<DuplexStream>,
    stdin_reader: DuplexStream,
    state: Arc<FakeState>,
}

#[async_trait]
impl ExecChannel for FakeChannel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.state.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }

    fn stdin(&mut self) -> BoxedWriter {
        match self.stdin_writer.take() {
            Some(writer) => Box::pin(writer),
            None => Box::pin(tokio::io::sink()),
        }
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.wait_for_stdin {
            self.wait_for_stdin = false;
            let mut byte = [0u8; 1];
            if self.stdin_reader.read_exact(&mut byte).await.is_ok() {
                self.state.stdin_seen.lock().unwrap().push(byte[0]);
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.events.pop_front() {
            None if self.stall => std::future::pending().await,
            event => event,
        }
    }
}
