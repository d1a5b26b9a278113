//! Lifecycle orchestration core.
//!
//! One manager per process owns every user's container. Mutual exclusion
//! for provisioning is carried by the state machines, not a lock: the first
//! caller claims the sequence by transitioning NonExistent→Creating under
//! the machine's own mutex, so a concurrent caller always observes an
//! in-flight state and waits (or fails fast) instead of starting a second
//! sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};

use crate::config::{Config, UserConfig};
use crate::engine::{ContainerEngine, ExecOutput, ShellStream};
use crate::error::{LifecycleError, Result};

use super::health::HealthMonitor;
use super::spec::{
    container_name_for, ExecOptions, SpecBuilder, EXTENSIONS_DIR, WORKSPACE_DIR,
};
use super::state::{LifecycleState, UserStateMachine};
use super::store::{ContainerRecord, StateStore};
use super::volume::{workspace_volume_name, VolumeInitializer};
use super::workspace::{self, HOOK_SCRIPT_GLOB, WELCOME_TEXT};

/// Upper bound on the get-or-create evaluation loop: the initial pass, one
/// reset after an observed failure, and one fallthrough after self-detected
/// container loss.
const MAX_PROVISION_ATTEMPTS: usize = 3;
const ORPHAN_REMOVAL_TIMEOUT: Duration = Duration::from_secs(15);
const ORPHAN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const BOOTSTRAP_DIR_ATTEMPTS: u64 = 3;

const STATUS_RUNNING: &str = "running";
const STATUS_STOPPED: &str = "stopped";

/// Options for [`LifecycleManager::get_or_create_container`].
#[derive(Debug, Clone)]
pub struct GetOrCreateOptions {
    /// Block on an in-flight provisioning sequence instead of failing fast
    /// with [`LifecycleError::NotReady`].
    pub wait: bool,
    /// Deadline for waiting; defaults to the configured provision timeout.
    pub timeout: Option<Duration>,
}

impl Default for GetOrCreateOptions {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: None,
        }
    }
}

/// Options for [`LifecycleManager::attach_to_container_shell`].
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Replay buffered container output before live data.
    pub replay_logs: bool,
}

enum Evaluation {
    /// Machine is Ready; verify the handle against the engine.
    VerifyReady,
    /// Another caller is provisioning; wait for a stable state.
    AwaitStable(watch::Receiver<LifecycleState>),
    /// This caller claimed the creation sequence.
    Create,
    /// State was reset; evaluate again.
    Reevaluate,
}

/// Orchestrates per-user container lifecycles against the engine.
pub struct LifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    store: Arc<StateStore>,
    health: HealthMonitor,
    volumes: VolumeInitializer,
    builder: SpecBuilder,
    config: Config,
    /// In-memory mirror of container records, keyed by user id.
    records: RwLock<HashMap<String, ContainerRecord>>,
}

impl LifecycleManager {
    /// Builds the manager and starts the state-cache sweeper.
    ///
    /// Must be called from within the async runtime. Construct one instance
    /// at process start and share it; consumers receive it by dependency
    /// injection.
    pub fn new(engine: Arc<dyn ContainerEngine>, store: Arc<StateStore>, config: Config) -> Self {
        let _ = store.spawn_sweeper();
        Self {
            health: HealthMonitor::new(Arc::clone(&engine)),
            volumes: VolumeInitializer::new(Arc::clone(&engine), &config),
            builder: SpecBuilder::new(&config),
            engine,
            store,
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the user's ready container, driving or joining a
    /// provisioning sequence as needed.
    ///
    /// Within one process, concurrent callers for the same user trigger at
    /// most one engine create: the sequence is claimed under the machine
    /// lock before any engine call, so later callers observe an in-flight
    /// state.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotReady`] when `opts.wait` is false and
    /// provisioning is in flight; [`LifecycleError::CreationFailed`] when a
    /// critical provisioning step fails; [`LifecycleError::Timeout`] when
    /// the wait deadline expires.
    pub async fn get_or_create_container(
        &self,
        user_id: &str,
        user: &UserConfig,
        opts: &GetOrCreateOptions,
    ) -> Result<ContainerRecord> {
        let container_name = container_name_for(user_id);
        let timeout = opts.timeout.unwrap_or(self.config.provision_timeout);

        for _attempt in 0..MAX_PROVISION_ATTEMPTS {
            let machine = self.store.get_or_create(user_id, &container_name).await?;

            let evaluation = {
                let mut m = machine.lock().await;
                match m.state() {
                    LifecycleState::Ready => Evaluation::VerifyReady,
                    state @ (LifecycleState::Creating
                    | LifecycleState::Starting
                    | LifecycleState::HealthChecking) => {
                        if !opts.wait {
                            return Err(LifecycleError::NotReady {
                                user_id: user_id.to_string(),
                                state,
                            });
                        }
                        Evaluation::AwaitStable(m.subscribe())
                    }
                    LifecycleState::Failed => {
                        tracing::info!(
                            user_id,
                            error = ?m.last_error(),
                            "resetting failed container state"
                        );
                        m.transition_to(LifecycleState::NonExistent)?;
                        self.store.save(&m).await?;
                        Evaluation::Reevaluate
                    }
                    LifecycleState::NonExistent => {
                        // Claim the sequence before releasing the lock so a
                        // second caller never observes NonExistent.
                        m.begin_creation();
                        m.transition_to(LifecycleState::Creating)?;
                        self.store.save(&m).await?;
                        Evaluation::Create
                    }
                }
            };

            match evaluation {
                Evaluation::VerifyReady => {
                    if let Some(record) = self.verify_ready(user_id, &machine).await? {
                        return Ok(record);
                    }
                    // Engine lost the container; next pass recreates it.
                }
                Evaluation::AwaitStable(rx) => {
                    let state = UserStateMachine::await_stable(rx, timeout).await?;
                    tracing::debug!(user_id, state = %state, "in-flight provisioning settled");
                }
                Evaluation::Reevaluate => {}
                Evaluation::Create => {
                    let result = self.run_creation_sequence(user_id, &machine, user).await;
                    {
                        let mut m = machine.lock().await;
                        m.end_creation();
                        self.store.save(&m).await?;
                    }
                    return result;
                }
            }
        }

        Err(LifecycleError::CreationFailed {
            user_id: user_id.to_string(),
            reason: format!("no stable container after {MAX_PROVISION_ATTEMPTS} attempts"),
        })
    }

    /// Confirms a Ready machine still has its container running, refreshing
    /// last-active. Returns `None` after transitioning to NonExistent when
    /// the engine no longer has it.
    async fn verify_ready(
        &self,
        user_id: &str,
        machine: &Arc<Mutex<UserStateMachine>>,
    ) -> Result<Option<ContainerRecord>> {
        if let Some(mut record) = self.lookup_record(user_id).await? {
            if let Some(status) = self.engine.inspect_container(&record.container_id).await? {
                if status.running {
                    record.status = STATUS_RUNNING.to_string();
                    record.last_active = Utc::now();
                    self.store.touch_record(user_id, record.last_active).await?;
                    self.records
                        .write()
                        .await
                        .insert(user_id.to_string(), record.clone());
                    return Ok(Some(record));
                }
            }
        }

        tracing::warn!(user_id, "ready container is gone from the engine, recreating");
        {
            let mut m = machine.lock().await;
            if m.is(LifecycleState::Ready) {
                m.transition_to(LifecycleState::NonExistent)?;
                self.store.save(&m).await?;
            }
        }
        self.records.write().await.remove(user_id);
        Ok(None)
    }

    /// Drives the creation sequence, mapping any critical failure onto the
    /// machine (Failed + stored error) and a user-identified error.
    async fn run_creation_sequence(
        &self,
        user_id: &str,
        machine: &Arc<Mutex<UserStateMachine>>,
        user: &UserConfig,
    ) -> Result<ContainerRecord> {
        match self.provision(user_id, machine, user).await {
            Ok(record) => {
                tracing::info!(
                    user_id,
                    container = %record.container_id,
                    tier = %user.tier,
                    "container provisioned and ready"
                );
                Ok(record)
            }
            Err(e) => {
                let mut m = machine.lock().await;
                if m.state().is_in_flight() {
                    let _ = m.set_failed(&e);
                }
                if let Err(save_err) = self.store.save(&m).await {
                    tracing::error!(user_id, error = %save_err, "failed to persist failed state");
                }
                Err(LifecycleError::CreationFailed {
                    user_id: user_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// The provisioning pipeline. Critical steps propagate errors;
    /// best-effort bootstrap steps log and continue. The machine is already
    /// in Creating when this runs.
    async fn provision(
        &self,
        user_id: &str,
        machine: &Arc<Mutex<UserStateMachine>>,
        user: &UserConfig,
    ) -> Result<ContainerRecord> {
        // Creating: host bookkeeping dir (critical).
        let host_dir = workspace::user_workspace_dir(&self.config.workspace_root, user_id);
        tokio::fs::create_dir_all(&host_dir).await?;

        // Creating: durable workspace volume, seeded once (critical).
        let volume = self.volumes.ensure_workspace_volume(user_id).await?;

        // Creating: free our deterministic name (critical).
        let name = container_name_for(user_id);
        self.remove_orphaned_container(&name).await?;

        // Creating: create + start (critical).
        let spec = self.builder.build_container_spec(&name, &volume, user_id, user);
        let container_id = self.engine.create_container(&spec).await?;
        self.engine.start_container(&container_id).await?;

        self.transition_and_save(machine, LifecycleState::Starting).await?;

        // Starting: in-container bootstrap (best-effort).
        self.bootstrap_container(user_id, &container_id).await;

        self.transition_and_save(machine, LifecycleState::HealthChecking)
            .await?;

        // HealthChecking: readiness probe (critical).
        self.health
            .wait_for_container_ready(&container_id, self.config.health_timeout)
            .await?;

        let now = Utc::now();
        let record = ContainerRecord {
            user_id: user_id.to_string(),
            container_id,
            name,
            status: STATUS_RUNNING.to_string(),
            created_at: now,
            last_active: now,
        };
        self.store.upsert_record(&record).await?;
        self.records
            .write()
            .await
            .insert(user_id.to_string(), record.clone());

        self.transition_and_save(machine, LifecycleState::Ready).await?;
        Ok(record)
    }

    async fn transition_and_save(
        &self,
        machine: &Arc<Mutex<UserStateMachine>>,
        to: LifecycleState,
    ) -> Result<()> {
        let mut m = machine.lock().await;
        m.transition_to(to)?;
        self.store.save(&m).await
    }

    /// Stops and removes any container already holding `name`, then polls
    /// until the engine confirms the name is free.
    async fn remove_orphaned_container(&self, name: &str) -> Result<()> {
        let Some(orphan) = self.engine.inspect_container(name).await? else {
            return Ok(());
        };
        tracing::warn!(container = name, status = %orphan.status, "removing orphaned container");

        if let Err(e) = self
            .engine
            .stop_container(&orphan.id, self.config.stop_grace_secs)
            .await
        {
            tracing::warn!(container = name, error = %e, "orphan stop failed, forcing removal");
        }
        if let Err(e) = self.engine.remove_container(&orphan.id, true).await {
            tracing::warn!(container = name, error = %e, "orphan removal reported an error");
        }

        let deadline = Instant::now() + ORPHAN_REMOVAL_TIMEOUT;
        while self.engine.inspect_container(name).await?.is_some() {
            if Instant::now() >= deadline {
                return Err(LifecycleError::Timeout {
                    operation: format!("removal of orphaned container {name}"),
                    seconds: ORPHAN_REMOVAL_TIMEOUT.as_secs(),
                });
            }
            tokio::time::sleep(ORPHAN_POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Post-start bootstrap inside the running container.
    ///
    /// Every step here is routed through [`best_effort`]: a failure leaves a
    /// degraded workspace, never a failed provisioning. The critical steps
    /// all live in [`Self::provision`] and propagate with `?`.
    async fn bootstrap_container(&self, user_id: &str, container_id: &str) {
        best_effort(
            user_id,
            "workspace directories",
            self.create_default_dirs(container_id).await,
        );
        best_effort(
            user_id,
            "extension payload",
            self.upload_extension_payload(container_id).await,
        );

        let chmod = format!("chmod +x {EXTENSIONS_DIR}/{HOOK_SCRIPT_GLOB}");
        best_effort(
            user_id,
            "hook permissions",
            self.exec_raw(container_id, &chmod).await,
        );

        let welcome = format!("cat > {WORKSPACE_DIR}/WELCOME.md <<'EOF'\n{WELCOME_TEXT}EOF");
        best_effort(
            user_id,
            "welcome file",
            self.exec_raw(container_id, &welcome).await,
        );
    }

    /// Creates the default workspace directories, retrying a few times for
    /// a still-settling container.
    async fn create_default_dirs(&self, container_id: &str) -> Result<()> {
        let mkdir = format!("mkdir -p {WORKSPACE_DIR}/projects {EXTENSIONS_DIR}");
        let mut last_exit = None;
        for attempt in 1..=BOOTSTRAP_DIR_ATTEMPTS {
            match self.exec_raw(container_id, &mkdir).await {
                Ok(output) if output.success() => return Ok(()),
                Ok(output) => {
                    last_exit = output.exit_code;
                    tracing::trace!(attempt, exit_code = ?output.exit_code, "mkdir retry");
                }
                Err(e) => {
                    tracing::trace!(attempt, error = %e, "mkdir retry");
                }
            }
            tokio::time::sleep(Duration::from_millis(200 * attempt)).await;
        }
        Err(crate::error::EngineError::Other(format!(
            "mkdir kept failing (last exit code {last_exit:?})"
        ))
        .into())
    }

    async fn upload_extension_payload(&self, container_id: &str) -> Result<()> {
        let archive = workspace::default_extension_archive()?;
        self.engine
            .upload_archive(container_id, EXTENSIONS_DIR, archive)
            .await?;
        Ok(())
    }

    async fn exec_raw(&self, container_id: &str, command: &str) -> Result<ExecOutput> {
        Ok(self
            .engine
            .exec(
                container_id,
                &SpecBuilder::build_exec_spec(command, &ExecOptions::default()),
            )
            .await?)
    }

    /// Stops the user's container. Already-stopped containers are fine.
    pub async fn stop_container(&self, user_id: &str) -> Result<()> {
        let record = self.require_record(user_id).await?;
        self.engine
            .stop_container(&record.container_id, self.config.stop_grace_secs)
            .await?;
        self.set_record_status(user_id, STATUS_STOPPED).await?;
        tracing::info!(user_id, "stopped container");
        Ok(())
    }

    /// Starts the user's container and re-runs the readiness wait before
    /// declaring success.
    pub async fn start_container(&self, user_id: &str) -> Result<()> {
        let record = self.require_record(user_id).await?;
        self.engine.start_container(&record.container_id).await?;
        self.health
            .wait_for_container_ready(&record.container_id, self.config.health_timeout)
            .await?;
        self.set_record_status(user_id, STATUS_RUNNING).await?;
        self.store.touch_record(user_id, Utc::now()).await?;
        tracing::info!(user_id, "started container");
        Ok(())
    }

    /// Stop followed by start with a fresh readiness wait.
    pub async fn restart_container(&self, user_id: &str) -> Result<()> {
        self.stop_container(user_id).await?;
        self.start_container(user_id).await
    }

    /// Tears the user's container down: best-effort stop, forced removal,
    /// cache eviction, durable row deletion, state reset. The workspace
    /// volume (and the host bookkeeping dir) are only removed when
    /// `remove_volume` is set — a volume is never deleted implicitly.
    pub async fn destroy_container(&self, user_id: &str, remove_volume: bool) -> Result<()> {
        if let Some(record) = self.lookup_record(user_id).await? {
            if let Err(e) = self
                .engine
                .stop_container(&record.container_id, self.config.stop_grace_secs)
                .await
            {
                tracing::warn!(user_id, error = %e, "stop before destroy failed");
            }
            if let Err(e) = self.engine.remove_container(&record.container_id, true).await {
                tracing::warn!(user_id, error = %e, "container removal reported an error");
            }
        }

        self.records.write().await.remove(user_id);
        self.store.delete_record(user_id).await?;

        if let Some(machine) = self.store.load(user_id).await? {
            let mut m = machine.lock().await;
            m.force_reset();
            self.store.save(&m).await?;
        }

        if remove_volume {
            let volume = workspace_volume_name(user_id);
            if let Err(e) = self.engine.remove_volume(&volume).await {
                tracing::warn!(user_id, volume = %volume, error = %e, "volume removal failed");
            }
            let host_dir = workspace::user_workspace_dir(&self.config.workspace_root, user_id);
            if let Err(e) = tokio::fs::remove_dir_all(&host_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(user_id, error = %e, "bookkeeping dir removal failed");
                }
            }
        }

        tracing::info!(user_id, remove_volume, "destroyed container");
        Ok(())
    }

    /// Runs a one-shot command in the user's container, provisioning it
    /// first if needed.
    pub async fn exec_in_container(
        &self,
        user_id: &str,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecOutput> {
        let record = self
            .get_or_create_container(user_id, &UserConfig::default(), &GetOrCreateOptions::default())
            .await?;
        Ok(self
            .engine
            .exec(
                &record.container_id,
                &SpecBuilder::build_exec_spec(command, opts),
            )
            .await?)
    }

    /// Attaches to the container's primary TTY, yielding the raw duplex
    /// stream an interactive terminal session needs. Provisions the
    /// container first if needed.
    pub async fn attach_to_container_shell(
        &self,
        user_id: &str,
        opts: &AttachOptions,
    ) -> Result<ShellStream> {
        let record = self
            .get_or_create_container(user_id, &UserConfig::default(), &GetOrCreateOptions::default())
            .await?;
        Ok(self
            .engine
            .attach_shell(&record.container_id, opts.replay_logs)
            .await?)
    }

    /// Recent output of the user's container.
    pub async fn container_logs(&self, user_id: &str, tail: usize) -> Result<String> {
        let record = self.require_record(user_id).await?;
        Ok(self.engine.container_logs(&record.container_id, tail).await?)
    }

    /// All containers currently mirrored in memory.
    pub async fn get_all_containers(&self) -> Vec<ContainerRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// The user's container record, if any.
    pub async fn get_container_by_user_id(
        &self,
        user_id: &str,
    ) -> Result<Option<ContainerRecord>> {
        self.lookup_record(user_id).await
    }

    /// Startup recovery: reconcile every durable row marked active against
    /// the engine, trusting engine state over a possibly-stale durable
    /// status, then sweep stuck intermediate states.
    ///
    /// Running containers repopulate the in-memory cache; stopped ones get
    /// their durable status corrected and their state machine reset;
    /// containers unknown to the engine (crash mid-create, external
    /// deletion) lose their row entirely.
    pub async fn load_containers_from_database(&self) -> Result<()> {
        let mut restored = 0usize;
        for record in self.store.list_active_records().await? {
            let user_id = record.user_id.clone();
            match self.engine.inspect_container(&record.container_id).await? {
                Some(status) if status.running => {
                    self.records
                        .write()
                        .await
                        .insert(user_id.clone(), record.clone());
                    restored += 1;
                    tracing::debug!(user_id, container = %record.container_id, "restored running container");
                }
                Some(_) => {
                    self.store
                        .update_record_status(&user_id, STATUS_STOPPED)
                        .await?;
                    self.reset_user_state(&user_id).await?;
                    tracing::info!(user_id, "container stopped while the process was down");
                }
                None => {
                    self.store.delete_record(&user_id).await?;
                    self.reset_user_state(&user_id).await?;
                    tracing::info!(user_id, "dropped record for container unknown to the engine");
                }
            }
        }

        self.recover_stuck_states().await?;
        tracing::info!(restored, "container recovery complete");
        Ok(())
    }

    /// Force-resets intermediate states that have outlived the staleness
    /// threshold with no matching engine container. Protected machines (an
    /// active creation in this process) and young states are left alone.
    pub async fn recover_stuck_states(&self) -> Result<()> {
        for state in [
            LifecycleState::Creating,
            LifecycleState::Starting,
            LifecycleState::HealthChecking,
        ] {
            for user_id in self.store.users_in_state(state).await? {
                let Some(machine) = self.store.load(&user_id).await? else {
                    continue;
                };
                let mut m = machine.lock().await;
                if m.is_protected() || !m.state().is_in_flight() {
                    continue;
                }
                if !m.is_older_than(self.config.stale_state_threshold) {
                    // An active creation may legitimately still be running.
                    continue;
                }
                if self
                    .engine
                    .inspect_container(m.container_name())
                    .await?
                    .is_some()
                {
                    continue;
                }
                tracing::warn!(
                    user_id,
                    state = %m.state(),
                    "force-resetting stuck provisioning state"
                );
                m.force_reset();
                self.store.save(&m).await?;
            }
        }
        Ok(())
    }

    async fn reset_user_state(&self, user_id: &str) -> Result<()> {
        if let Some(machine) = self.store.load(user_id).await? {
            let mut m = machine.lock().await;
            if m.is_protected() {
                tracing::debug!(user_id, "skipping reset of protected machine");
                return Ok(());
            }
            m.force_reset();
            self.store.save(&m).await?;
        }
        Ok(())
    }

    /// Record from the in-memory mirror, falling back to the durable store.
    async fn lookup_record(&self, user_id: &str) -> Result<Option<ContainerRecord>> {
        if let Some(record) = self.records.read().await.get(user_id) {
            return Ok(Some(record.clone()));
        }
        let record = self.store.get_record(user_id).await?;
        if let Some(ref record) = record {
            self.records
                .write()
                .await
                .insert(user_id.to_string(), record.clone());
        }
        Ok(record)
    }

    async fn require_record(&self, user_id: &str) -> Result<ContainerRecord> {
        self.lookup_record(user_id)
            .await?
            .ok_or_else(|| LifecycleError::NoContainer {
                user_id: user_id.to_string(),
            })
    }

    async fn set_record_status(&self, user_id: &str, status: &str) -> Result<()> {
        self.store.update_record_status(user_id, status).await?;
        if let Some(record) = self.records.write().await.get_mut(user_id) {
            record.status = status.to_string();
        }
        Ok(())
    }
}

/// Marks a bootstrap step best-effort: failures are logged and swallowed so
/// they never fail an otherwise-successful provisioning.
fn best_effort<T>(user_id: &str, step: &'static str, result: Result<T>) {
    if let Err(e) = result {
        tracing::warn!(user_id, step, error = %e, "best-effort bootstrap step failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;
    use tempfile::TempDir;

    async fn manager_with(engine: Arc<MockEngine>) -> (Arc<LifecycleManager>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            workspace_root: tmp.path().join("workspaces"),
            state_db_path: tmp.path().join("state.db"),
            health_timeout: Duration::from_secs(2),
            provision_timeout: Duration::from_secs(5),
            stale_state_threshold: Duration::from_millis(50),
            ..Config::default()
        };
        let store = Arc::new(
            StateStore::open(&config.state_db_path, config.state_cache_ttl).unwrap(),
        );
        (
            Arc::new(LifecycleManager::new(engine, store, config)),
            tmp,
        )
    }

    fn seeded_config(tmp: &TempDir, seed: &std::path::Path) -> Config {
        Config {
            workspace_root: tmp.path().join("workspaces"),
            state_db_path: tmp.path().join("state.db"),
            health_timeout: Duration::from_secs(2),
            provision_timeout: Duration::from_secs(5),
            seed_source: Some(seed.to_path_buf()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn provisions_fresh_user_to_ready() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        let record = manager
            .get_or_create_container("42", &UserConfig::for_tier("pro"), &Default::default())
            .await
            .unwrap();

        assert_eq!(record.name, "claude-user-42");
        assert_eq!(record.status, "running");
        assert!(engine
            .volume_exists("claude-user-42-workspace")
            .await
            .unwrap());

        // The persisted machine settled at ready.
        let ready = manager
            .store
            .users_in_state(LifecycleState::Ready)
            .await
            .unwrap();
        assert_eq!(ready, vec!["42".to_string()]);

        // Creation preceded start, bootstrap preceded the readiness probe.
        let ops = engine.ops();
        let pos = |needle: &str| ops.iter().position(|o| o.contains(needle)).unwrap();
        assert!(pos("create:claude-user-42") < pos("start:claude-user-42"));
        assert!(pos("start:claude-user-42") < pos("upload:/home/user/.claude"));
        assert!(pos("upload:/home/user/.claude") < pos("echo ready"));
    }

    #[tokio::test]
    async fn concurrent_callers_create_exactly_once() {
        let engine = Arc::new(MockEngine::new());
        engine.set_start_delay(Duration::from_millis(100));
        let (manager, _tmp) = manager_with(engine.clone()).await;

        let a = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .get_or_create_container("42", &UserConfig::default(), &Default::default())
                    .await
            })
        };
        let b = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .get_or_create_container("42", &UserConfig::default(), &Default::default())
                    .await
            })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.container_id, b.container_id);
        assert_eq!(engine.create_calls_for("claude-user-42"), 1);
    }

    #[tokio::test]
    async fn no_wait_fails_fast_naming_the_state() {
        let engine = Arc::new(MockEngine::new());
        engine.set_start_delay(Duration::from_millis(200));
        let (manager, _tmp) = manager_with(engine.clone()).await;

        let background = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .get_or_create_container("42", &UserConfig::default(), &Default::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;

        let err = manager
            .get_or_create_container(
                "42",
                &UserConfig::default(),
                &GetOrCreateOptions {
                    wait: false,
                    timeout: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("creating"));

        background.await.unwrap().unwrap();
        assert_eq!(engine.create_calls_for("claude-user-42"), 1);
    }

    #[tokio::test]
    async fn out_of_band_loss_is_detected_and_recreated() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();
        engine.remove_out_of_band("claude-user-42").await;

        let record = manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();
        assert_eq!(record.status, "running");
        assert_eq!(engine.create_calls_for("claude-user-42"), 2);
    }

    #[tokio::test]
    async fn failed_state_is_reset_and_retried() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        let machine = manager
            .store
            .get_or_create("42", "claude-user-42")
            .await
            .unwrap();
        {
            let mut m = machine.lock().await;
            m.transition_to(LifecycleState::Creating).unwrap();
            m.set_failed("previous attempt exploded").unwrap();
            manager.store.save(&m).await.unwrap();
        }

        let record = manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();
        assert_eq!(record.status, "running");
    }

    #[tokio::test]
    async fn critical_failure_sets_failed_with_error() {
        let engine = Arc::new(MockEngine::new());
        engine.set_fail_start(true);
        let (manager, _tmp) = manager_with(engine.clone()).await;

        let err = manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::CreationFailed { .. }));

        let machine = manager.store.load("42").await.unwrap().unwrap();
        {
            let m = machine.lock().await;
            assert!(m.is(LifecycleState::Failed));
            assert!(m.last_error().unwrap().contains("injected start failure"));
            assert!(!m.is_protected());
        }

        // Clearing the fault lets the normal reset-and-retry path recover.
        engine.set_fail_start(false);
        let record = manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();
        assert_eq!(record.status, "running");
    }

    #[tokio::test]
    async fn destroy_preserves_volume_unless_requested() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();

        manager.destroy_container("42", false).await.unwrap();
        assert!(engine
            .inspect_container("claude-user-42")
            .await
            .unwrap()
            .is_none());
        assert!(manager.store.get_record("42").await.unwrap().is_none());
        // The workspace volume outlives the container.
        assert!(engine
            .volume_exists("claude-user-42-workspace")
            .await
            .unwrap());

        // Recreate, then destroy with volume removal.
        manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();
        manager.destroy_container("42", true).await.unwrap();
        assert!(!engine
            .volume_exists("claude-user-42-workspace")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn startup_recovery_trusts_the_engine() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;
        let now = Utc::now();

        // Row whose container is still running.
        let running_id = engine.seed_running_container("claude-user-1", "1").await;
        manager
            .store
            .upsert_record(&ContainerRecord {
                user_id: "1".to_string(),
                container_id: running_id,
                name: "claude-user-1".to_string(),
                status: "running".to_string(),
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();

        // Row whose container stopped while the process was down.
        let stopped_id = engine.seed_running_container("claude-user-2", "2").await;
        engine.stop_out_of_band("claude-user-2").await;
        manager
            .store
            .upsert_record(&ContainerRecord {
                user_id: "2".to_string(),
                container_id: stopped_id,
                name: "claude-user-2".to_string(),
                status: "running".to_string(),
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();

        // Row pointing at a container the engine has never heard of.
        manager
            .store
            .upsert_record(&ContainerRecord {
                user_id: "3".to_string(),
                container_id: "mock-phantom".to_string(),
                name: "claude-user-3".to_string(),
                status: "running".to_string(),
                created_at: now,
                last_active: now,
            })
            .await
            .unwrap();
        let phantom_machine = manager
            .store
            .get_or_create("3", "claude-user-3")
            .await
            .unwrap();
        {
            let mut m = phantom_machine.lock().await;
            m.transition_to(LifecycleState::Creating).unwrap();
            manager.store.save(&m).await.unwrap();
        }

        manager.load_containers_from_database().await.unwrap();

        // Running container repopulated the cache.
        let all = manager.get_all_containers().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].user_id, "1");

        // Stopped container: durable status corrected, machine reset.
        let stopped = manager.store.get_record("2").await.unwrap().unwrap();
        assert_eq!(stopped.status, "stopped");

        // Phantom container: row deleted, machine at NonExistent.
        assert!(manager.store.get_record("3").await.unwrap().is_none());
        assert!(phantom_machine
            .lock()
            .await
            .is(LifecycleState::NonExistent));
    }

    #[tokio::test]
    async fn stuck_state_recovery_respects_guard_age_and_engine() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        // Stale, unprotected, no engine container: reset.
        let stuck = manager
            .store
            .get_or_create("stuck", "claude-user-stuck")
            .await
            .unwrap();
        {
            let mut m = stuck.lock().await;
            m.transition_to(LifecycleState::Creating).unwrap();
            manager.store.save(&m).await.unwrap();
        }

        // Stale but protected: an active creation in this process.
        let active = manager
            .store
            .get_or_create("active", "claude-user-active")
            .await
            .unwrap();
        {
            let mut m = active.lock().await;
            m.begin_creation();
            m.transition_to(LifecycleState::Creating).unwrap();
            manager.store.save(&m).await.unwrap();
        }

        // Stale but the engine still has the container: leave alone.
        engine.seed_running_container("claude-user-slow", "slow").await;
        let slow = manager
            .store
            .get_or_create("slow", "claude-user-slow")
            .await
            .unwrap();
        {
            let mut m = slow.lock().await;
            m.transition_to(LifecycleState::Creating).unwrap();
            manager.store.save(&m).await.unwrap();
        }

        // Let everything age past the 50ms test threshold.
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.recover_stuck_states().await.unwrap();

        assert!(stuck.lock().await.is(LifecycleState::NonExistent));
        assert!(active.lock().await.is(LifecycleState::Creating));
        assert!(slow.lock().await.is(LifecycleState::Creating));
    }

    #[tokio::test]
    async fn young_intermediate_state_is_left_alone() {
        let engine = Arc::new(MockEngine::new());
        let tmp = TempDir::new().unwrap();
        let config = Config {
            workspace_root: tmp.path().join("workspaces"),
            state_db_path: tmp.path().join("state.db"),
            // Real threshold: everything here is younger than it.
            stale_state_threshold: Duration::from_secs(30),
            ..Config::default()
        };
        let store = Arc::new(
            StateStore::open(&config.state_db_path, config.state_cache_ttl).unwrap(),
        );
        let manager = LifecycleManager::new(engine, store, config);

        let machine = manager
            .store
            .get_or_create("young", "claude-user-young")
            .await
            .unwrap();
        {
            let mut m = machine.lock().await;
            m.transition_to(LifecycleState::Creating).unwrap();
            manager.store.save(&m).await.unwrap();
        }

        manager.recover_stuck_states().await.unwrap();
        assert!(machine.lock().await.is(LifecycleState::Creating));
    }

    #[tokio::test]
    async fn exec_auto_creates_the_container() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        let output = manager
            .exec_in_container("9", "echo hi", &ExecOptions::default())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(engine.create_calls_for("claude-user-9"), 1);

        // A second exec reuses the ready container.
        manager
            .exec_in_container("9", "true", &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.create_calls_for("claude-user-9"), 1);
    }

    #[tokio::test]
    async fn attach_yields_a_duplex_stream() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        let shell = manager
            .attach_to_container_shell("42", &AttachOptions::default())
            .await
            .unwrap();
        drop(shell.input);
        drop(shell.output);
    }

    #[tokio::test]
    async fn stop_and_start_round_trip() {
        let engine = Arc::new(MockEngine::new());
        let (manager, _tmp) = manager_with(engine.clone()).await;

        manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();

        manager.stop_container("42").await.unwrap();
        let record = manager.store.get_record("42").await.unwrap().unwrap();
        assert_eq!(record.status, "stopped");

        manager.start_container("42").await.unwrap();
        let record = manager.store.get_record("42").await.unwrap().unwrap();
        assert_eq!(record.status, "running");
    }

    #[tokio::test]
    async fn provisioning_seeds_the_workspace_volume_once() {
        let engine = Arc::new(MockEngine::new());
        let tmp = TempDir::new().unwrap();
        let seed_dir = tmp.path().join("seed");
        std::fs::create_dir_all(&seed_dir).unwrap();

        let config = seeded_config(&tmp, &seed_dir);
        let store = Arc::new(
            StateStore::open(&config.state_db_path, config.state_cache_ttl).unwrap(),
        );
        let manager = LifecycleManager::new(engine.clone(), store, config);

        manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();
        assert_eq!(engine.seed_copies(), 1);

        // Destroy without volume removal, recreate: no second copy.
        manager.destroy_container("42", false).await.unwrap();
        manager
            .get_or_create_container("42", &UserConfig::default(), &Default::default())
            .await
            .unwrap();
        assert_eq!(engine.seed_copies(), 1);
    }
}
