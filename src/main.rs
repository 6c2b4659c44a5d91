//! Command-line entry point.
//!
//! ```text
//! streamweave-relay [config.json] < input.log
//! ```
//!
//! Loads and validates the configuration, then deploys the relay. In local
//! mode, lines piped on stdin are appended round-robin to the partitions of
//! an in-process log before the run starts; the run stops after `run_for`
//! or on Ctrl-C and prints its report as JSON.

use std::io::{BufRead, IsTerminal};
use std::sync::Arc;
use streamweave_relay::config::{ConfigError, DeployMode, RelayConfig, StorageBackend};
use streamweave_relay::deploy::{DeployOutcome, DeploymentTarget, LocalTarget, target_for};
use streamweave_relay::events::TracingReporter;
use streamweave_relay::log_client::MemoryLog;
use streamweave_relay::record::PartitionId;
use streamweave_relay::storage::{DurableStorage, LocalFsStorage, MemoryStorage};
use tokio_util::sync::CancellationToken;
use tracing::info;

fn seed_from_stdin(log: &MemoryLog, config: &RelayConfig) -> std::io::Result<usize> {
  let partitions = config.topology.reader.tasks.max(1) as u32;
  log.create_stream(&config.source.stream, partitions);
  let stdin = std::io::stdin();
  if stdin.is_terminal() {
    return Ok(0);
  }
  let mut count = 0;
  for line in stdin.lock().lines() {
    let partition = PartitionId(count as u32 % partitions);
    log.append(&config.source.stream, partition, line?);
    count += 1;
  }
  Ok(count)
}

fn storage_for(config: &RelayConfig) -> Result<Arc<dyn DurableStorage>, ConfigError> {
  Ok(match (config.sink.backend()?, &config.deploy) {
    (StorageBackend::Local(root), _) => Arc::new(LocalFsStorage::with_root(root)),
    (StorageBackend::Memory, _) => Arc::new(MemoryStorage::new()),
    // Cluster workers write the segments; this process only submits.
    (StorageBackend::Hdfs(_), DeployMode::Cluster { .. }) => Arc::new(MemoryStorage::new()),
    (StorageBackend::Hdfs(url), DeployMode::Local { .. }) => {
      return Err(ConfigError::UnsupportedStorage(format!(
        "{url} (local runs write to file:// or memory://)"
      )));
    }
  })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt::init();

  let config = match std::env::args().nth(1) {
    Some(path) => RelayConfig::from_file(path)?,
    None => RelayConfig::default(),
  };
  let storage = storage_for(&config)?;

  let log = Arc::new(MemoryLog::new());
  let target: Box<dyn DeploymentTarget> = match &config.deploy {
    DeployMode::Local {
      run_for,
      max_task_parallelism,
    } => {
      let seeded = seed_from_stdin(&log, &config)?;
      info!(records = seeded, stream = %config.source.stream, "Seeded local log");

      let cancel = CancellationToken::new();
      let on_signal = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          info!("Interrupted, draining");
          on_signal.cancel();
        }
      });
      Box::new(LocalTarget::new(*run_for, *max_task_parallelism).with_cancel(cancel))
    }
    mode => target_for(mode),
  };

  let pipeline = config.build_pipeline(log, storage, TracingReporter::shared())?;
  match target.deploy(pipeline).await? {
    DeployOutcome::Completed(report) => {
      println!("{}", serde_json::to_string_pretty(&report)?);
    }
    DeployOutcome::Submitted { name } => {
      info!(pipeline = %name, "Topology submitted");
    }
  }
  Ok(())
}
