// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use crate::pipeline::RunRequest;

#[derive(Debug, Parser)]
#[command(name = "logcollector", version, about = "Collects application logs from the syslog host")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download one day of logs and ship them to the selected backend.
    Collect(CollectArgs),
}

#[derive(Debug, Clone, Args)]
pub struct CollectArgs {
    /// Application to collect, repeatable. Defaults to LC_APPS.
    #[arg(long = "app", value_name = "APP")]
    pub apps: Vec<String>,

    /// Server name or glob, repeatable.
    #[arg(long = "server", value_name = "SERVER", default_value = "*")]
    pub servers: Vec<String>,

    /// Skip listed files until the first one of this server.
    #[arg(long, value_name = "SERVER")]
    pub from_server: Option<String>,

    /// Start the LC_APPS list at this application.
    #[arg(long, value_name = "APP")]
    pub from_app: Option<String>,

    /// Day to collect as YYYYMMDD, yesterday by default.
    #[arg(long, value_name = "YYYYMMDD", value_parser = parse_date)]
    pub date: Option<NaiveDate>,

    #[arg(long)]
    pub drop_db: bool,

    #[arg(long)]
    pub drop_measurement: bool,

    /// Ship to Loki instead of InfluxDB.
    #[arg(long)]
    pub loki: bool,
}

pub fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y%m%d").map_err(|e| format!("expected YYYYMMDD: {e}"))
}

impl CollectArgs {
    /// Explicit `--app`s win; otherwise `known_apps` from `--from-app` onwards.
    #[must_use]
    pub fn resolve_apps(&self, known_apps: &[String]) -> Vec<String> {
        if !self.apps.is_empty() {
            return self.apps.clone();
        }
        let apps: Vec<String> = match &self.from_app {
            None => known_apps.to_vec(),
            Some(from) => known_apps
                .iter()
                .skip_while(|app| *app != from)
                .cloned()
                .collect(),
        };
        if apps.is_empty() {
            warn!("No applications to collect, set --app or LC_APPS");
        }
        apps
    }

    #[must_use]
    pub fn into_request(self, known_apps: &[String], today: NaiveDate) -> RunRequest {
        let apps = self.resolve_apps(known_apps);
        RunRequest {
            apps,
            servers: self.servers,
            date: self
                .date
                .unwrap_or_else(|| today.pred_opt().unwrap_or(today)),
            from_server: self.from_server,
            drop_database: self.drop_db,
            drop_measurement: self.drop_measurement,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CollectArgs {
        let cli = Cli::try_parse_from(
            std::iter::once("logcollector")
                .chain(std::iter::once("collect"))
                .chain(args.iter().copied()),
        )
        .unwrap();
        match cli.command {
            Command::Collect(args) => args,
        }
    }

    fn known() -> Vec<String> {
        vec!["api".into(), "billing".into(), "go-queue".into()]
    }

    #[test]
    fn test_defaults() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let request = parse(&[]).into_request(&known(), today);
        assert_eq!(request.apps, known());
        assert_eq!(request.servers, vec!["*"]);
        assert_eq!(request.date, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert!(!request.drop_database);
        assert!(request.from_server.is_none());
    }

    #[test]
    fn test_explicit_values() {
        let args = parse(&[
            "--app",
            "billing",
            "--server",
            "web1",
            "--server",
            "web2",
            "--from-server",
            "web2",
            "--date",
            "20240115",
            "--drop-db",
            "--loki",
        ]);
        assert!(args.loki);
        let request = args.into_request(&known(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(request.apps, vec!["billing"]);
        assert_eq!(request.servers, vec!["web1", "web2"]);
        assert_eq!(request.from_server.as_deref(), Some("web2"));
        assert_eq!(request.date, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert!(request.drop_database);
    }

    #[test]
    fn test_from_app_resumes_known_list() {
        let args = parse(&["--from-app", "billing"]);
        assert_eq!(args.resolve_apps(&known()), vec!["billing", "go-queue"]);
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        let result = Cli::try_parse_from(["logcollector", "collect", "--date", "2024-01-15"]);
        assert!(result.is_err());
    }
}
