//! Per-user provisioning state machine.
//!
//! One machine exists per user per process. Transitions are restricted to a
//! fixed edge set; every successful transition stamps the time and notifies
//! waiters through a watch channel, which is also what
//! [`UserStateMachine::await_stable`] resolves on — no polling anywhere.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{LifecycleError, Result};

/// Provisioning state of one user's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No container and no provisioning in progress.
    NonExistent,
    /// Host resources and the engine container are being created.
    Creating,
    /// Container started; in-container bootstrap running.
    Starting,
    /// Waiting for the in-container readiness probe.
    HealthChecking,
    /// Container is up and usable.
    Ready,
    /// A critical provisioning step failed; see the stored error.
    Failed,
}

impl LifecycleState {
    /// Whether a provisioning sequence is currently in flight.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Creating | Self::Starting | Self::HealthChecking)
    }

    /// Whether the state is an endpoint callers can act on.
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NonExistent => "non_existent",
            Self::Creating => "creating",
            Self::Starting => "starting",
            Self::HealthChecking => "health_checking",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// The fixed transition table.
///
/// Forward chain NonExistent→Creating→Starting→HealthChecking→Ready; any
/// non-terminal state may fail; Ready falls back to NonExistent on
/// self-detected container loss; Failed resets to NonExistent on retry.
fn edge_allowed(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
        (from, to),
        (NonExistent, Creating)
            | (Creating, Starting)
            | (Starting, HealthChecking)
            | (HealthChecking, Ready)
            | (Ready, NonExistent)
            | (Failed, NonExistent)
            | (NonExistent, Failed)
            | (Creating, Failed)
            | (Starting, Failed)
            | (HealthChecking, Failed)
    )
}

/// Serialized form of a state machine, round-tripped through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMachine {
    pub user_id: String,
    pub container_name: String,
    pub state: LifecycleState,
    pub last_transition: DateTime<Utc>,
    pub creation_guard: bool,
    pub last_error: Option<String>,
}

/// Finite-state tracker for one user's container provisioning.
#[derive(Debug)]
pub struct UserStateMachine {
    user_id: String,
    container_name: String,
    state: LifecycleState,
    last_transition: DateTime<Utc>,
    /// Raised around an active creation sequence; recovery logic must not
    /// force-reset a machine while this is up.
    creation_guard: bool,
    last_error: Option<String>,
    notifier: watch::Sender<LifecycleState>,
}

impl UserStateMachine {
    /// Fresh machine at NonExistent.
    pub fn new(user_id: impl Into<String>, container_name: impl Into<String>) -> Self {
        let (notifier, _) = watch::channel(LifecycleState::NonExistent);
        Self {
            user_id: user_id.into(),
            container_name: container_name.into(),
            state: LifecycleState::NonExistent,
            last_transition: Utc::now(),
            creation_guard: false,
            last_error: None,
            notifier,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is(&self, state: LifecycleState) -> bool {
        self.state == state
    }

    pub fn last_transition(&self) -> DateTime<Utc> {
        self.last_transition
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_protected(&self) -> bool {
        self.creation_guard
    }

    /// Whether the machine has sat in its current state longer than
    /// `threshold`.
    pub fn is_older_than(&self, threshold: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_transition);
        age.num_milliseconds() > threshold.as_millis() as i64
    }

    /// Raises the protection flag for the duration of a creation sequence.
    pub fn begin_creation(&mut self) {
        self.creation_guard = true;
    }

    /// Lowers the protection flag once the sequence leaves an in-flight
    /// state.
    pub fn end_creation(&mut self) {
        self.creation_guard = false;
    }

    /// Takes a validated edge, stamping the transition time and notifying
    /// waiters.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] and leaves the state
    /// unchanged if the edge is not in the table.
    pub fn transition_to(&mut self, to: LifecycleState) -> Result<()> {
        if !edge_allowed(self.state, to) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(
            user_id = %self.user_id,
            from = %self.state,
            to = %to,
            "lifecycle transition"
        );
        self.state = to;
        self.last_transition = Utc::now();
        if to != LifecycleState::Failed {
            self.last_error = None;
        }
        let _ = self.notifier.send(to);
        Ok(())
    }

    /// Transitions to Failed recording the triggering error.
    pub fn set_failed(&mut self, error: impl std::fmt::Display) -> Result<()> {
        self.transition_to(LifecycleState::Failed)?;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Resets to NonExistent from any state, bypassing edge validation.
    ///
    /// Reserved for crash-recovery paths that have already established the
    /// engine holds no matching container and the protection flag is down.
    pub fn force_reset(&mut self) {
        tracing::debug!(
            user_id = %self.user_id,
            from = %self.state,
            "force reset to non_existent"
        );
        self.state = LifecycleState::NonExistent;
        self.last_transition = Utc::now();
        self.creation_guard = false;
        self.last_error = None;
        let _ = self.notifier.send(LifecycleState::NonExistent);
    }

    /// Subscribes to state-change notifications.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.notifier.subscribe()
    }

    /// Suspends until the machine reaches Ready or Failed, or the timeout
    /// expires. Resolved by the change notification, not by polling; the
    /// receiver must come from [`Self::subscribe`] so the wait does not hold
    /// any lock on the machine.
    pub async fn await_stable(
        mut rx: watch::Receiver<LifecycleState>,
        timeout: Duration,
    ) -> Result<LifecycleState> {
        match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_stable())).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(LifecycleError::Timeout {
                operation: "state notifications (machine dropped)".to_string(),
                seconds: timeout.as_secs(),
            }),
            Err(_) => Err(LifecycleError::Timeout {
                operation: "stable container state".to_string(),
                seconds: timeout.as_secs(),
            }),
        }
    }

    /// Serializes every field to a JSON document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&PersistedMachine {
            user_id: self.user_id.clone(),
            container_name: self.container_name.clone(),
            state: self.state,
            last_transition: self.last_transition,
            creation_guard: self.creation_guard,
            last_error: self.last_error.clone(),
        })
    }

    /// Rebuilds a machine from a JSON document, reproducing every field
    /// including the protection flag and stored error.
    pub fn from_json(doc: &str) -> serde_json::Result<Self> {
        let persisted: PersistedMachine = serde_json::from_str(doc)?;
        let (notifier, _) = watch::channel(persisted.state);
        Ok(Self {
            user_id: persisted.user_id,
            container_name: persisted.container_name,
            state: persisted.state,
            last_transition: persisted.last_transition,
            creation_guard: persisted.creation_guard,
            last_error: persisted.last_error,
            notifier,
        })
    }
}
