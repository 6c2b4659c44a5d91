//! Supervision of pipeline task instances.
//!
//! Defines what the coordinator does when a task instance fails fatally
//! (a sink exhausting its storage retries, or a reader losing its log or
//! offset store): restart it with fresh state, or escalate and abort the
//! pipeline. A panicking task is not restarted; the run fails with
//! `PipelineError::Join`.

use crate::error::ComponentInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Report of a task failure sent to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct FailureReport {
  /// Task that failed.
  pub component: ComponentInfo,
  /// Error description (from the task's error or the panic message).
  pub error: String,
}

/// Action to take when a supervised task fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
  /// Restart the task with fresh state, limited by `max_restarts`.
  #[default]
  Restart,
  /// Abort the pipeline.
  Escalate,
}

/// Policy for supervising a task instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SupervisionPolicy {
  /// Action to take on failure.
  pub on_failure: FailureAction,
  /// Maximum restarts before escalating. None = unbounded.
  pub max_restarts: Option<u32>,
  /// Delay before each restart.
  #[serde(with = "crate::backoff::millis")]
  pub restart_backoff: Duration,
}

impl SupervisionPolicy {
  /// Creates a new policy with the given action and defaults.
  pub fn new(on_failure: FailureAction) -> Self {
    Self {
      on_failure,
      ..Self::default()
    }
  }

  /// Sets max restarts (None = unbounded).
  #[must_use]
  pub fn with_max_restarts(mut self, n: Option<u32>) -> Self {
    self.max_restarts = n;
    self
  }

  /// Sets restart backoff.
  #[must_use]
  pub fn with_restart_backoff(mut self, d: Duration) -> Self {
    self.restart_backoff = d;
    self
  }
}

impl Default for SupervisionPolicy {
  fn default() -> Self {
    Self {
      on_failure: FailureAction::Restart,
      max_restarts: Some(3),
      restart_backoff: Duration::from_secs(1),
    }
  }
}

/// What the coordinator should do about a failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupervisionDecision {
  /// Restart after the given delay. `restarts` counts this restart.
  Restart {
    /// Delay before restarting.
    after: Duration,
    /// Restarts so far, including this one.
    restarts: u32,
  },
  /// Stop the pipeline.
  Escalate {
    /// Restarts performed before giving up.
    restarts: u32,
  },
}

/// Applies a [`SupervisionPolicy`] to the failures of one task instance.
#[derive(Clone, Debug)]
pub struct Supervisor {
  policy: SupervisionPolicy,
  restarts: u32,
}

impl Supervisor {
  /// Creates a supervisor for one task instance.
  pub fn new(policy: SupervisionPolicy) -> Self {
    Self {
      policy,
      restarts: 0,
    }
  }

  /// Decides what to do about a failure and counts the restart if any.
  pub fn on_failure(&mut self, _report: &FailureReport) -> SupervisionDecision {
    let budget_left = self.policy.max_restarts.is_none_or(|max| self.restarts < max);
    match self.policy.on_failure {
      FailureAction::Restart if budget_left => {
        self.restarts += 1;
        SupervisionDecision::Restart {
          after: self.policy.restart_backoff,
          restarts: self.restarts,
        }
      }
      _ => SupervisionDecision::Escalate {
        restarts: self.restarts,
      },
    }
  }

  /// Restarts performed so far.
  pub fn restarts(&self) -> u32 {
    self.restarts
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::PipelineStage;

  fn report() -> FailureReport {
    FailureReport {
      component: ComponentInfo::new("hdfs-bolt", PipelineStage::Sink, 1),
      error: "storage unavailable".to_string(),
    }
  }

  #[test]
  fn test_restarts_until_budget_exhausted() {
    let mut supervisor = Supervisor::new(
      SupervisionPolicy::default()
        .with_max_restarts(Some(2))
        .with_restart_backoff(Duration::from_millis(5)),
    );
    assert_eq!(
      supervisor.on_failure(&report()),
      SupervisionDecision::Restart {
        after: Duration::from_millis(5),
        restarts: 1
      }
    );
    assert!(matches!(
      supervisor.on_failure(&report()),
      SupervisionDecision::Restart { restarts: 2, .. }
    ));
    assert_eq!(
      supervisor.on_failure(&report()),
      SupervisionDecision::Escalate { restarts: 2 }
    );
  }

  #[test]
  fn test_unbounded_restarts() {
    let mut supervisor = Supervisor::new(SupervisionPolicy::default().with_max_restarts(None));
    for _ in 0..100 {
      assert!(matches!(
        supervisor.on_failure(&report()),
        SupervisionDecision::Restart { .. }
      ));
    }
    assert_eq!(supervisor.restarts(), 100);
  }

  #[test]
  fn test_escalate_never_restarts() {
    let mut supervisor = Supervisor::new(SupervisionPolicy::new(FailureAction::Escalate));
    assert_eq!(
      supervisor.on_failure(&report()),
      SupervisionDecision::Escalate { restarts: 0 }
    );
  }
}
