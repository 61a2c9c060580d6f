// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log_shipper::influxdb::InfluxDbConfig;
use log_shipper::RetryStrategy;
use remote_shell::ssh::SshConfig;

use crate::errors::ConfigError;

const DEFAULT_SSH_HOST: &str = "syslog-server";
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_REMOTE_ROOT: &str = "/var/log/remote";
const DEFAULT_QUEUE_MONITOR_APP: &str = "go-queue";
const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_FETCH_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_INFLUXDB_URL: &str = "http://localhost:8086";
const DEFAULT_LOKI_URL: &str = "http://localhost:3100";

#[derive(Debug, Clone)]
pub struct Config {
    pub ssh: SshConfig,
    pub remote_root: String,
    pub work_dir: PathBuf,
    /// Applications collected when none are named on the command line.
    pub apps: Vec<String>,
    pub queue_monitor_apps: Vec<String>,
    pub download_workers: usize,
    pub parse_workers: usize,
    pub line_workers: usize,
    pub retry_strategy: RetryStrategy,
    /// Longest wait for the next chunk of a file being fetched.
    pub fetch_idle_timeout: Duration,
    pub influxdb: InfluxDbConfig,
    pub loki_url: String,
}

impl Config {
    pub fn new() -> Result<Config, ConfigError> {
        let agent_socket = env::var("SSH_AUTH_SOCK")
            .ok()
            .filter(|socket| !socket.is_empty())
            .ok_or(ConfigError::MissingAgentSocket)?;

        let user = env::var("LC_SSH_USER")
            .or_else(|_| env::var("USER"))
            .unwrap_or_default();

        let retry_strategy = RetryStrategy::LinearBackoff(
            parse_or("LC_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS),
            parse_or("LC_RETRY_BACKOFF_MS", DEFAULT_RETRY_BACKOFF_MS),
        );

        Ok(Config {
            ssh: SshConfig {
                host: env::var("LC_SSH_HOST").unwrap_or_else(|_| DEFAULT_SSH_HOST.to_string()),
                port: parse_or("LC_SSH_PORT", DEFAULT_SSH_PORT),
                user,
                agent_socket,
            },
            remote_root: env::var("LC_REMOTE_ROOT")
                .map(|root| root.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| DEFAULT_REMOTE_ROOT.to_string()),
            work_dir: env::var("LC_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            apps: list("LC_APPS").unwrap_or_default(),
            queue_monitor_apps: list("LC_QUEUE_MONITOR_APPS")
                .unwrap_or_else(|| vec![DEFAULT_QUEUE_MONITOR_APP.to_string()]),
            download_workers: parse_or("LC_DOWNLOAD_WORKERS", 1_usize).max(1),
            parse_workers: parse_or("LC_PARSE_WORKERS", 1_usize).max(1),
            line_workers: parse_or("LC_LINE_WORKERS", 1_usize).max(1),
            retry_strategy,
            fetch_idle_timeout: Duration::from_secs(parse_or(
                "LC_HANDSHAKE_TIMEOUT_SECS",
                DEFAULT_FETCH_IDLE_TIMEOUT_SECS,
            )),
            influxdb: InfluxDbConfig {
                url: env::var("INFLUXDB_URL").unwrap_or_else(|_| DEFAULT_INFLUXDB_URL.to_string()),
                username: env::var("INFLUXDB_USER").unwrap_or_else(|_| "admin".to_string()),
                password: env::var("INFLUXDB_PASSWORD").unwrap_or_else(|_| "admin".to_string()),
                database: env::var("INFLUXDB_DATABASE").unwrap_or_else(|_| "log".to_string()),
            },
            loki_url: env::var("LOKI_URL").unwrap_or_else(|_| DEFAULT_LOKI_URL.to_string()),
        })
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}
