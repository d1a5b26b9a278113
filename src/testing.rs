//! In-memory engine double for unit tests.
//!
//! Emulates just enough Docker behavior for the orchestrator: named
//! containers with running flags, volumes with a seeded marker, probe
//! failure injection, and an operation log tests assert ordering against.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerStatus, ExecOutput, ExecSpec, ShellStream,
};
use crate::error::EngineError;

struct MockContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
}

/// Scriptable [`ContainerEngine`] double.
pub struct MockEngine {
    containers: Mutex<HashMap<String, MockContainer>>,
    volumes: StdMutex<HashMap<String, HashMap<String, String>>>,
    seeded_volumes: StdMutex<HashSet<String>>,
    seed_copy_count: AtomicUsize,
    probe_failures: AtomicUsize,
    fail_start: AtomicBool,
    start_delay: StdMutex<Option<Duration>>,
    ops: StdMutex<Vec<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            volumes: StdMutex::new(HashMap::new()),
            seeded_volumes: StdMutex::new(HashSet::new()),
            seed_copy_count: AtomicUsize::new(0),
            probe_failures: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            start_delay: StdMutex::new(None),
            ops: StdMutex::new(Vec::new()),
        }
    }

    fn log(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    /// Recorded operations, in order.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// Number of create calls for a container name.
    pub fn create_calls_for(&self, name: &str) -> usize {
        let op = format!("create:{name}");
        self.ops.lock().unwrap().iter().filter(|o| **o == op).count()
    }

    /// Makes the next `n` readiness probes exit nonzero.
    pub fn fail_probes(&self, n: usize) {
        self.probe_failures.store(n, Ordering::SeqCst);
    }

    pub fn remaining_probe_failures(&self) -> usize {
        self.probe_failures.load(Ordering::SeqCst)
    }

    /// Makes every container start fail until cleared.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Delays container starts, widening the in-flight window.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
    }

    /// Number of times a seeding copy actually ran.
    pub fn seed_copies(&self) -> usize {
        self.seed_copy_count.load(Ordering::SeqCst)
    }

    /// Pre-marks a volume as seeded.
    pub fn mark_volume_seeded(&self, volume: &str) {
        self.volumes
            .lock()
            .unwrap()
            .entry(volume.to_string())
            .or_default();
        self.seeded_volumes.lock().unwrap().insert(volume.to_string());
    }

    /// Inserts a running container directly, returning its id.
    pub async fn seed_running_container(&self, name: &str, user_id: &str) -> String {
        let id = format!("mock-{}", uuid::Uuid::new_v4().simple());
        let spec = ContainerSpec {
            name: name.to_string(),
            labels: [("berth.user".to_string(), user_id.to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        self.containers.lock().await.insert(
            name.to_string(),
            MockContainer {
                id: id.clone(),
                spec,
                running: true,
            },
        );
        id
    }

    /// Deletes a container out-of-band, as an external `docker rm -f` would.
    pub async fn remove_out_of_band(&self, name: &str) {
        self.containers.lock().await.remove(name);
    }

    /// Marks a container stopped out-of-band.
    pub async fn stop_out_of_band(&self, name: &str) {
        if let Some(container) = self.containers.lock().await.get_mut(name) {
            container.running = false;
        }
    }

    pub async fn live_container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    /// Looks a container up by name or id, applying `f`.
    async fn with_container<R>(
        &self,
        name_or_id: &str,
        f: impl FnOnce(&mut MockContainer) -> R,
    ) -> Option<R> {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(name_or_id) {
            return Some(f(container));
        }
        containers
            .values_mut()
            .find(|c| c.id == name_or_id)
            .map(f)
    }

    /// Exit code a seeding helper would produce, updating seed bookkeeping.
    fn helper_exit_code(&self, spec: &ContainerSpec) -> i64 {
        let script = spec.cmd.join(" ");
        let volume = spec
            .binds
            .iter()
            .find(|b| b.contains(":/seed-target"))
            .and_then(|b| b.split(':').next())
            .unwrap_or_default()
            .to_string();

        if script.contains("test -d /seed-target") {
            if self.seeded_volumes.lock().unwrap().contains(&volume) {
                0
            } else {
                1
            }
        } else if script.contains("cp -a /seed-source") {
            self.seeded_volumes.lock().unwrap().insert(volume);
            self.seed_copy_count.fetch_add(1, Ordering::SeqCst);
            0
        } else {
            0
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.log(format!("create:{}", spec.name));
        let mut containers = self.containers.lock().await;
        if containers.contains_key(&spec.name) {
            return Err(EngineError::Other(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        let id = format!("mock-{}", uuid::Uuid::new_v4().simple());
        containers.insert(
            spec.name.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Other("injected start failure".to_string()));
        }
        let name = self
            .with_container(id, |c| {
                c.running = true;
                c.spec.name.clone()
            })
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        self.log(format!("start:{name}"));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace_secs: i64) -> Result<(), EngineError> {
        let name = self
            .with_container(id, |c| {
                c.running = false;
                c.spec.name.clone()
            })
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        self.log(format!("stop:{name}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), EngineError> {
        let mut containers = self.containers.lock().await;
        let key = containers
            .iter()
            .find(|(name, c)| *name == id || c.id == id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        containers.remove(&key);
        drop(containers);
        self.log(format!("remove:{key}"));
        Ok(())
    }

    async fn inspect_container(
        &self,
        name_or_id: &str,
    ) -> Result<Option<ContainerStatus>, EngineError> {
        Ok(self
            .with_container(name_or_id, |c| ContainerStatus {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                status: if c.running { "running" } else { "exited" }.to_string(),
                running: c.running,
            })
            .await)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let spec = self
            .with_container(id, |c| {
                c.running = false;
                c.spec.clone()
            })
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(self.helper_exit_code(&spec))
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput, EngineError> {
        let script = spec.cmd.join(" ");
        self.with_container(id, |_| ())
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        self.log(format!("exec:{script}"));

        if script.contains("echo ready") {
            let remaining = self.probe_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != usize::MAX {
                    self.probe_failures.store(remaining - 1, Ordering::SeqCst);
                }
                return Ok(ExecOutput {
                    exit_code: Some(1),
                    ..Default::default()
                });
            }
            return Ok(ExecOutput {
                exit_code: Some(0),
                stdout: "ready\n".to_string(),
                ..Default::default()
            });
        }

        Ok(ExecOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    async fn attach_shell(
        &self,
        id: &str,
        _replay_logs: bool,
    ) -> Result<ShellStream, EngineError> {
        let running = self
            .with_container(id, |c| c.running)
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !running {
            return Err(EngineError::Other("container is not running".to_string()));
        }
        Ok(ShellStream {
            output: Box::pin(futures_util::stream::empty()),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        self.volumes
            .lock()
            .unwrap()
            .insert(name.to_string(), labels.clone());
        self.log(format!("create-volume:{name}"));
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.volumes.lock().unwrap().contains_key(name))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        if self.volumes.lock().unwrap().remove(name).is_none() {
            return Err(EngineError::NotFound(name.to_string()));
        }
        self.seeded_volumes.lock().unwrap().remove(name);
        self.log(format!("remove-volume:{name}"));
        Ok(())
    }

    async fn upload_archive(
        &self,
        id: &str,
        dest_path: &str,
        _archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        self.with_container(id, |_| ())
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        self.log(format!("upload:{dest_path}"));
        Ok(())
    }

    async fn container_logs(&self, id: &str, _tail: usize) -> Result<String, EngineError> {
        self.with_container(id, |_| ())
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(String::new())
    }
}
