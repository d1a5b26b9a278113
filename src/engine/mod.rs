//! Container engine seam.
//!
//! The orchestrator talks to the engine through the [`ContainerEngine`]
//! trait so tests can substitute an in-memory implementation. The spec
//! types here are engine-agnostic plain data; the bollard translation lives
//! in [`docker`].

mod docker;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncWrite;

use crate::error::EngineError;

pub use docker::{connect, DockerEngine};

/// Engine container-creation spec.
///
/// Produced by the pure spec builder, consumed by the engine. Field names
/// track the Docker API shapes they map onto.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ContainerSpec {
    /// Deterministic container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint; empty means image default.
    pub entrypoint: Vec<String>,
    /// Command; empty means image default.
    pub cmd: Vec<String>,
    /// Environment entries (KEY=VALUE).
    pub env: Vec<String>,
    /// uid:gid or user name to run as.
    pub user: Option<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Allocate a TTY on the primary process.
    pub tty: bool,
    /// Keep stdin of the primary process open.
    pub open_stdin: bool,
    /// Volume/bind mounts (`source:target[:mode]`).
    pub binds: Vec<String>,
    /// Hard memory cap in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU quota in microseconds per period.
    pub cpu_quota: Option<i64>,
    /// CPU period in microseconds.
    pub cpu_period: Option<i64>,
    /// Docker network mode.
    pub network_mode: Option<String>,
    /// Security options (seccomp, apparmor, no-new-privileges).
    pub security_opt: Vec<String>,
    /// json-file log driver rotation: max size per file (e.g. "10m").
    pub log_max_size: Option<String>,
    /// json-file log driver rotation: file count.
    pub log_max_file: Option<String>,
    /// Identification labels for grouping and bulk cleanup.
    pub labels: HashMap<String, String>,
    /// Remove the container automatically once it exits.
    pub auto_remove: bool,
}

/// One-shot exec spec.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExecSpec {
    /// Command argv.
    pub cmd: Vec<String>,
    /// Environment entries (KEY=VALUE).
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Allocate a TTY for the exec process.
    pub tty: bool,
    /// Attach stdin to the exec process.
    pub attach_stdin: bool,
    /// User to run as, overriding the container default.
    pub user: Option<String>,
}

/// Collected result of a one-shot exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code, if the engine reported one.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Engine-reported container status.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    /// Engine container id.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Engine status string ("created", "running", "exited", ...).
    pub status: String,
    /// Whether the primary process is currently running.
    pub running: bool,
}

/// Raw duplex stream obtained by hijacking a container attach.
///
/// Unlike an exec's read side, both halves are live: bytes written to
/// `input` reach the container's primary TTY, and `output` carries
/// everything it emits. This is what an interactive terminal session runs
/// over.
pub struct ShellStream {
    /// Bytes emitted by the container's primary TTY.
    pub output: Pin<Box<dyn Stream<Item = Result<Bytes, EngineError>> + Send>>,
    /// Write half feeding the container's primary TTY.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for ShellStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellStream").finish_non_exhaustive()
    }
}

/// Container engine operations the orchestrator consumes.
///
/// Implementations must be safe to share behind an `Arc` across tasks.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Verifies the engine is reachable.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Creates a container, returning its engine id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stops a container with a grace period. Stopping an already-stopped
    /// container is not an error.
    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), EngineError>;

    /// Removes a container.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Inspects a container by id or name. Returns `None` when the engine
    /// does not know it.
    async fn inspect_container(
        &self,
        name_or_id: &str,
    ) -> Result<Option<ContainerStatus>, EngineError>;

    /// Blocks until a container exits, returning its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Runs a one-shot exec and collects its output.
    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput, EngineError>;

    /// Hijacks an attach to the container's primary TTY, yielding a raw
    /// duplex stream. `replay_logs` prepends buffered output.
    async fn attach_shell(&self, id: &str, replay_logs: bool)
        -> Result<ShellStream, EngineError>;

    /// Creates a named volume. Creating an existing volume is not an error.
    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError>;

    /// Whether a named volume exists.
    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError>;

    /// Removes a named volume.
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Uploads a (optionally gzipped) tar archive into a running
    /// container's filesystem at `dest_path`.
    async fn upload_archive(
        &self,
        id: &str,
        dest_path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError>;

    /// Fetches up to `tail` lines of container output.
    async fn container_logs(&self, id: &str, tail: usize) -> Result<String, EngineError>;
}
