// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Local;
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use log_shipper::constants::{
    BATCH_WAIT, ENTRY_BUFFER_SIZE, INFLUXDB_MAX_BATCH_BYTES, LOKI_MAX_BATCH_BYTES,
};
use log_shipper::influxdb::InfluxDbBackend;
use log_shipper::loki::LokiBackend;
use log_shipper::{BatchClient, BatchSettings, Storage};
use logcollector::cli::{Cli, CollectArgs, Command};
use logcollector::config::Config;
use logcollector::normalizer::Normalizer;
use logcollector::pipeline::{Pipeline, PipelineSettings};
use logcollector::source::ShellSource;
use remote_shell::ssh::SshConnector;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = env::var("LC_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,reqwest=off,russh=off,rustls=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).context("could not parse LC_LOG_LEVEL")?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");

    let config = Config::new()?;
    match cli.command {
        Command::Collect(args) => collect(config, args).await,
    }
}

async fn collect(config: Config, args: CollectArgs) -> anyhow::Result<()> {
    let settings = BatchSettings {
        buffer: ENTRY_BUFFER_SIZE,
        max_size_bytes: if args.loki {
            LOKI_MAX_BATCH_BYTES
        } else {
            INFLUXDB_MAX_BATCH_BYTES
        },
        max_wait: BATCH_WAIT,
    };
    let storage: Arc<dyn Storage> = if args.loki {
        info!("Shipping to Loki at {}", config.loki_url);
        Arc::new(BatchClient::start(LokiBackend::new(&config.loki_url)?, settings))
    } else {
        info!("Shipping to InfluxDB at {}", config.influxdb.url);
        Arc::new(BatchClient::start(
            InfluxDbBackend::new(config.influxdb.clone())?,
            settings,
        ))
    };

    let source = ShellSource::new(
        SshConnector::new(config.ssh.clone()),
        config.remote_root.clone(),
        config.fetch_idle_timeout,
    );
    source
        .connect()
        .await
        .with_context(|| format!("unable to reach {}:{}", config.ssh.host, config.ssh.port))?;

    let pipeline = Pipeline::new(
        Arc::new(source),
        Arc::clone(&storage),
        Normalizer::new(config.queue_monitor_apps.clone()),
        PipelineSettings {
            remote_root: config.remote_root.clone(),
            work_dir: config.work_dir.clone(),
            download_workers: config.download_workers,
            parse_workers: config.parse_workers,
            line_workers: config.line_workers,
            retry_strategy: config.retry_strategy,
        },
    );

    let request = args.into_request(&config.apps, Local::now().date_naive());
    info!(
        "Collecting {} for {} from {:?}",
        request.apps.join(","),
        request.date,
        request.servers
    );
    let result = pipeline.run(request).await;

    if let Err(e) = storage.stop().await {
        error!("Unable to stop storage: {}", e);
    }
    info!("Already sent: {}", storage.already_sent());

    let report = result?;
    if !report.dead_letters.is_empty() {
        error!("{} jobs were abandoned", report.dead_letters.len());
    }
    Ok(())
}
