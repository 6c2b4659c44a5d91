//! # Deployment
//!
//! Two ways of running a [`Pipeline`]:
//!
//! - [`LocalTarget`] runs it in this process with a cap on task instances,
//!   stops it after a fixed duration and drains it.
//! - [`ClusterTarget`] validates its [`TopologyDefinition`] and submits it to
//!   a remote coordinator through a [`CoordinatorClient`]. The default client,
//!   [`HttpCoordinatorClient`], POSTs the definition as JSON.
//!
//! A topology name can only be active once per target: submitting a name the
//! coordinator already runs fails with [`DeployError::AlreadyRunning`], and a
//! definition it rejects fails with [`DeployError::InvalidTopology`].

use crate::config::DeployMode;
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, TopologyDefinition};
use crate::runtime::{PipelineReport, cancel_after};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors raised while deploying a pipeline.
#[derive(Error, Debug)]
pub enum DeployError {
  /// A topology with this name is already running.
  #[error("topology {0} is already running")]
  AlreadyRunning(String),
  /// The topology definition was rejected.
  #[error("invalid topology: {0}")]
  InvalidTopology(String),
  /// The coordinator could not be reached or failed the request.
  #[error("submission failed: {0}")]
  Submit(String),
  /// The pipeline failed while running locally.
  #[error(transparent)]
  Run(#[from] PipelineError),
}

/// Result type for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// What a deployment produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployOutcome {
  /// The pipeline ran locally and drained.
  Completed(PipelineReport),
  /// The definition was accepted by a remote coordinator.
  Submitted {
    /// Topology name.
    name: String,
  },
}

/// Somewhere a pipeline can be deployed.
#[async_trait]
pub trait DeploymentTarget: Send + Sync + Debug {
  /// Deploys `pipeline`.
  async fn deploy(&self, pipeline: Pipeline) -> DeployResult<DeployOutcome>;
}

fn validated(definition: &TopologyDefinition) -> DeployResult<()> {
  definition.validate().map_err(|e| match e {
    PipelineError::InvalidDefinition(reason) => DeployError::InvalidTopology(reason),
    other => DeployError::Run(other),
  })
}

/// Runs pipelines in this process for a bounded time.
#[derive(Debug, Clone)]
pub struct LocalTarget {
  run_for: Duration,
  max_task_parallelism: usize,
  cancel: CancellationToken,
  running: Arc<Mutex<HashSet<String>>>,
}

impl LocalTarget {
  /// Creates a target that stops each pipeline after `run_for`.
  pub fn new(run_for: Duration, max_task_parallelism: usize) -> Self {
    Self {
      run_for,
      max_task_parallelism: max_task_parallelism.max(1),
      cancel: CancellationToken::new(),
      running: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// Stops running pipelines early when `token` is cancelled.
  #[must_use]
  pub fn with_cancel(mut self, token: CancellationToken) -> Self {
    self.cancel = token;
    self
  }

  /// Token that stops every pipeline run by this target.
  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  fn claim(&self, name: &str) -> DeployResult<Claim> {
    let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
    if !running.insert(name.to_string()) {
      return Err(DeployError::AlreadyRunning(name.to_string()));
    }
    Ok(Claim {
      running: Arc::clone(&self.running),
      name: name.to_string(),
    })
  }
}

/// Reserves a pipeline name on a [`LocalTarget`] until dropped, including
/// when the deploy future itself is dropped mid-run.
struct Claim {
  running: Arc<Mutex<HashSet<String>>>,
  name: String,
}

impl Drop for Claim {
  fn drop(&mut self) {
    self
      .running
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.name);
  }
}

#[async_trait]
impl DeploymentTarget for LocalTarget {
  async fn deploy(&self, pipeline: Pipeline) -> DeployResult<DeployOutcome> {
    let pipeline = pipeline.with_max_task_parallelism(self.max_task_parallelism);
    validated(&pipeline.definition())?;
    let name = pipeline.name().to_string();
    let _claim = self.claim(&name)?;

    info!(pipeline = %name, run_for_ms = self.run_for.as_millis() as u64, "Running locally");
    let cancel = self.cancel.child_token();
    // Drains the spawned tasks if this future is dropped before they finish.
    let _stop = cancel.clone().drop_guard();
    let timer = cancel_after(cancel.clone(), self.run_for);
    let result = pipeline.run(cancel).await;
    timer.abort();
    Ok(DeployOutcome::Completed(result?))
  }
}

/// Submits topology definitions to a remote coordinator.
#[async_trait]
pub trait CoordinatorClient: Send + Sync + Debug {
  /// Submits `definition`. The coordinator takes over from here.
  async fn submit(&self, definition: &TopologyDefinition) -> DeployResult<()>;
}

/// Deploys pipelines to a cluster.
#[derive(Debug, Clone)]
pub struct ClusterTarget {
  client: Arc<dyn CoordinatorClient>,
  workers: usize,
}

impl ClusterTarget {
  /// Creates a target requesting `workers` worker processes.
  pub fn new(client: Arc<dyn CoordinatorClient>, workers: usize) -> Self {
    Self { client, workers }
  }
}

#[async_trait]
impl DeploymentTarget for ClusterTarget {
  async fn deploy(&self, pipeline: Pipeline) -> DeployResult<DeployOutcome> {
    let definition = pipeline.with_workers(self.workers).definition();
    validated(&definition)?;
    match self.client.submit(&definition).await {
      Ok(()) => {
        info!(pipeline = %definition.name, workers = self.workers, "Topology submitted");
        Ok(DeployOutcome::Submitted {
          name: definition.name,
        })
      }
      Err(e) => {
        warn!(pipeline = %definition.name, error = %e, "Topology submission failed");
        Err(e)
      }
    }
  }
}

/// Submits definitions with `POST {endpoint}/topologies`.
///
/// Status mapping: 2xx accepted, 409 already running, 400 and 422 invalid
/// topology, anything else a submission failure.
#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
  endpoint: String,
  client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpCoordinatorClient {
  /// Creates a client for the coordinator at `endpoint` (`http://host:port`).
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      client: Client::builder(TokioExecutor::new()).build_http(),
    }
  }

  /// Coordinator base URL.
  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
  async fn submit(&self, definition: &TopologyDefinition) -> DeployResult<()> {
    let body = serde_json::to_vec(definition).map_err(|e| DeployError::Submit(e.to_string()))?;
    let uri = format!("{}/topologies", self.endpoint.trim_end_matches('/'));
    let request = Request::builder()
      .method(Method::POST)
      .uri(uri)
      .header(CONTENT_TYPE, "application/json")
      .body(Full::new(Bytes::from(body)))
      .map_err(|e| DeployError::Submit(e.to_string()))?;

    let response = self
      .client
      .request(request)
      .await
      .map_err(|e| DeployError::Submit(e.to_string()))?;
    let status = response.status();
    let body = response
      .into_body()
      .collect()
      .await
      .map(|collected| collected.to_bytes())
      .unwrap_or_default();
    let message = String::from_utf8_lossy(&body).trim().to_string();

    match status {
      s if s.is_success() => Ok(()),
      StatusCode::CONFLICT => Err(DeployError::AlreadyRunning(definition.name.clone())),
      StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
        Err(DeployError::InvalidTopology(message))
      }
      other => Err(DeployError::Submit(format!(
        "coordinator returned {other}: {message}"
      ))),
    }
  }
}

/// Target selected by the deployment section of the configuration.
pub fn target_for(mode: &DeployMode) -> Box<dyn DeploymentTarget> {
  match mode {
    DeployMode::Local {
      run_for,
      max_task_parallelism,
    } => Box::new(LocalTarget::new(*run_for, *max_task_parallelism)),
    DeployMode::Cluster {
      coordinator_url,
      workers,
    } => Box::new(ClusterTarget::new(
      Arc::new(HttpCoordinatorClient::new(coordinator_url.clone())),
      *workers,
    )),
  }
}
