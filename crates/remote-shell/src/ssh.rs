// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SSH implementation of the transport traits, authenticated through the
//! local key agent.
//!
//! Host keys are not verified. This is only acceptable because the collector
//! talks to a single aggregation host inside a trusted network.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg};
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use tracing::debug;

use crate::errors::TransportError;
use crate::transport::{BoxedWriter, ChannelEvent, Connection, Connector, ExecChannel};

/// Extended data stream number carrying stderr.
const STDERR_STREAM: u32 = 1;

/// Connection parameters for the remote host.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Path of the agent socket, usually taken from `SSH_AUTH_SOCK`.
    pub agent_socket: String,
}

struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    #[must_use]
    pub fn new(config: SshConfig) -> Self {
        SshConnector { config }
    }

    async fn authenticate(&self, handle: &mut Handle<AcceptAnyHostKey>) -> Result<(), TransportError> {
        let stream = tokio::net::UnixStream::connect(&self.config.agent_socket)
            .await
            .map_err(|e| TransportError::Agent(format!("{}: {e}", self.config.agent_socket)))?;
        let mut agent = AgentClient::connect(stream);
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| TransportError::Agent(e.to_string()))?;

        for key in identities {
            let (returned, outcome) = handle
                .authenticate_future(self.config.user.clone(), key, agent)
                .await;
            agent = returned;
            match outcome {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(e) => debug!("agent identity rejected: {e:?}"),
            }
        }
        Err(TransportError::Auth(self.config.user.clone()))
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Connection = SshConnection;

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn connect(&self) -> Result<SshConnection, TransportError> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(
            config,
            (self.config.host.as_str(), self.config.port),
            AcceptAnyHostKey,
        )
        .await
        .map_err(|e| TransportError::Connect {
            address: self.address(),
            message: e.to_string(),
        })?;
        self.authenticate(&mut handle).await?;
        Ok(SshConnection { handle })
    }
}

pub struct SshConnection {
    handle: Handle<AcceptAnyHostKey>,
}

#[async_trait]
impl Connection for SshConnection {
    type Channel = SshChannel;

    async fn open_channel(&self) -> Result<SshChannel, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Session(e.to_string()))?;
        Ok(SshChannel { channel })
    }
}

pub struct SshChannel {
    channel: Channel<Msg>,
}

#[async_trait]
impl ExecChannel for SshChannel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Exec(e.to_string()))
    }

    fn stdin(&mut self) -> BoxedWriter {
        Box::pin(self.channel.make_writer())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { ref data } => return Some(ChannelEvent::Stdout(data.to_vec())),
                ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                    return Some(ChannelEvent::Stderr(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ChannelEvent::ExitStatus(exit_status))
                }
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    return Some(ChannelEvent::ExitSignal(format!("{signal_name:?}")))
                }
                _ => continue,
            }
        }
    }
}
