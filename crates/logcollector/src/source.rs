// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where log files come from: listing and downloading them from the
//! aggregation host.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remote_shell::transport::Connector;
use remote_shell::{Fetcher, RemoteShell, TransportError};
use tracing::{debug, warn};

use crate::errors::SourceError;

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Remote paths of every file of `app` on `servers` for `date` (`YYYYMMDD`).
    async fn list(&self, app: &str, servers: &[String], date: &str)
        -> Result<Vec<String>, SourceError>;

    /// Downloads `remote_path` to `local_path`, returning the bytes written.
    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, SourceError>;
}

/// [`RemoteSource`] backed by one shared remote shell connection.
pub struct ShellSource<C: Connector> {
    shell: Arc<RemoteShell<C>>,
    fetcher: Fetcher<C>,
    remote_root: String,
}

impl<C: Connector> ShellSource<C> {
    pub fn new(connector: C, remote_root: impl Into<String>, fetch_idle_timeout: Duration) -> Self {
        let shell = Arc::new(RemoteShell::new(connector));
        ShellSource {
            fetcher: Fetcher::new(Arc::clone(&shell), fetch_idle_timeout),
            shell,
            remote_root: remote_root.into(),
        }
    }

    /// Opens the shared connection up front so credential problems surface
    /// before any work is queued.
    pub async fn connect(&self) -> Result<(), SourceError> {
        self.shell.connect().await?;
        Ok(())
    }
}

/// `ls <root>/<server>/<date>/<app>/* ...` for every server pattern.
#[must_use]
pub fn listing_command(remote_root: &str, app: &str, servers: &[String], date: &str) -> String {
    let globs: Vec<String> = servers
        .iter()
        .map(|server| format!("{remote_root}/{server}/{date}/{app}/*"))
        .collect();
    format!("ls {}", globs.join(" "))
}

#[async_trait]
impl<C: Connector> RemoteSource for ShellSource<C> {
    async fn list(
        &self,
        app: &str,
        servers: &[String],
        date: &str,
    ) -> Result<Vec<String>, SourceError> {
        let command = listing_command(&self.remote_root, app, servers, date);
        debug!("Listing: {}", command);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = self
            .shell
            .run(&command, &mut tokio::io::empty(), &mut stdout, &mut stderr)
            .await;

        let paths: Vec<String> = String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        match result {
            Ok(()) => Ok(paths),
            // ls exits non-zero when one of several globs matched nothing.
            Err(TransportError::ExitStatus(status)) if !paths.is_empty() => {
                warn!(
                    "Listing for {} exited with {}: {}",
                    app,
                    status,
                    String::from_utf8_lossy(&stderr).trim()
                );
                Ok(paths)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, SourceError> {
        Ok(self.fetcher.fetch(remote_path, local_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_command_covers_every_server() {
        let servers = vec!["web1".to_string(), "web2".to_string()];
        assert_eq!(
            listing_command("/var/log/remote", "billing", &servers, "20240101"),
            "ls /var/log/remote/web1/20240101/billing/* /var/log/remote/web2/20240101/billing/*"
        );
    }

    #[test]
    fn test_listing_command_wildcard_server() {
        assert_eq!(
            listing_command("/var/log/remote", "api", &["*".to_string()], "20240101"),
            "ls /var/log/remote/*/20240101/api/*"
        );
    }
}
