//! Container liveness and readiness probing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{ContainerEngine, ExecSpec};
use crate::error::{LifecycleError, Result};

const INITIAL_DELAY_MS: u64 = 120;
const MAX_DELAY_MS: u64 = 1200;

/// Polls a container for liveness and readiness.
pub struct HealthMonitor {
    engine: Arc<dyn ContainerEngine>,
}

impl HealthMonitor {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Engine-reported status string, or "unknown" for containers the
    /// engine does not know.
    pub async fn container_status(&self, id: &str) -> Result<String> {
        Ok(self
            .engine
            .inspect_container(id)
            .await?
            .map(|status| status.status)
            .unwrap_or_else(|| "unknown".to_string()))
    }

    /// Resolves once a trivial probe command succeeds inside the container,
    /// or errors when `timeout` expires.
    ///
    /// A freshly started container can take a moment before its exec
    /// machinery answers, so probe failures (including transport errors)
    /// are retried with geometric backoff until the deadline.
    pub async fn wait_for_container_ready(&self, id: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut delay_ms = INITIAL_DELAY_MS;
        let probe = ExecSpec {
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), "echo ready".to_string()],
            ..Default::default()
        };

        loop {
            match self.engine.exec(id, &probe).await {
                Ok(output) if output.success() => {
                    tracing::debug!(container = id, "readiness probe succeeded");
                    return Ok(());
                }
                Ok(output) => {
                    tracing::trace!(
                        container = id,
                        exit_code = ?output.exit_code,
                        "readiness probe exited nonzero"
                    );
                }
                Err(e) => {
                    tracing::trace!(container = id, error = %e, "readiness probe failed");
                }
            }

            if Instant::now() + Duration::from_millis(delay_ms) >= deadline {
                return Err(LifecycleError::Timeout {
                    operation: format!("readiness of container {id}"),
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 3 / 2).min(MAX_DELAY_MS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;

    #[tokio::test]
    async fn ready_after_transient_probe_failures() {
        let engine = Arc::new(MockEngine::new());
        let id = engine.seed_running_container("claude-user-42", "42").await;
        engine.fail_probes(2);

        let monitor = HealthMonitor::new(engine.clone());
        monitor
            .wait_for_container_ready(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(engine.remaining_probe_failures(), 0);
    }

    #[tokio::test]
    async fn times_out_when_probe_never_succeeds() {
        let engine = Arc::new(MockEngine::new());
        let id = engine.seed_running_container("claude-user-42", "42").await;
        engine.fail_probes(usize::MAX);

        let monitor = HealthMonitor::new(engine);
        let err = monitor
            .wait_for_container_ready(&id, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Timeout { .. }));
    }

    #[tokio::test]
    async fn status_of_unknown_container_is_unknown() {
        let engine = Arc::new(MockEngine::new());
        let monitor = HealthMonitor::new(engine);
        assert_eq!(monitor.container_status("ghost").await.unwrap(), "unknown");
    }
}
