//! Docker-backed engine implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, HostConfigLogConfig};
use bollard::volume::CreateVolumeOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;

use crate::error::EngineError;

use super::{ContainerEngine, ContainerSpec, ContainerStatus, ExecOutput, ExecSpec, ShellStream};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Opens and verifies a handle to the container engine.
///
/// `None` auto-detects via the standard environment (`DOCKER_HOST` or the
/// platform socket). Explicit endpoints select the transport by scheme:
/// `unix://` socket, `tcp://`/`http://` plain TCP, `https://` TLS (requires
/// the `engine-tls` feature and `DOCKER_CERT_PATH`).
///
/// # Errors
///
/// Returns an error if the endpoint is malformed, the transport is not
/// compiled in, or the engine does not answer a ping.
pub async fn connect(endpoint: Option<&str>) -> Result<DockerEngine, EngineError> {
    let docker = match endpoint {
        None => Docker::connect_with_local_defaults()?,
        Some(ep) if ep.starts_with("unix://") => {
            Docker::connect_with_socket(ep, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        }
        Some(ep) if ep.starts_with("tcp://") || ep.starts_with("http://") => {
            Docker::connect_with_http(ep, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        }
        #[cfg(feature = "engine-tls")]
        Some(ep) if ep.starts_with("https://") => {
            let cert_dir = std::env::var("DOCKER_CERT_PATH").map_err(|_| {
                EngineError::Endpoint(
                    "TLS endpoint requires DOCKER_CERT_PATH to locate key.pem/cert.pem/ca.pem"
                        .to_string(),
                )
            })?;
            let cert_dir = std::path::Path::new(&cert_dir);
            Docker::connect_with_ssl(
                ep,
                &cert_dir.join("key.pem"),
                &cert_dir.join("cert.pem"),
                &cert_dir.join("ca.pem"),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?
        }
        #[cfg(not(feature = "engine-tls"))]
        Some(ep) if ep.starts_with("https://") => {
            return Err(EngineError::Unsupported(
                "TLS endpoints require the engine-tls feature",
            ));
        }
        Some(other) => return Err(EngineError::Endpoint(other.to_string())),
    };

    docker.ping().await?;
    tracing::debug!("connected to container engine");
    Ok(DockerEngine::new(docker))
}

/// [`ContainerEngine`] backed by a Docker-compatible API.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Wraps an already-connected client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
    let mut log_opts = HashMap::new();
    if let Some(ref size) = spec.log_max_size {
        log_opts.insert("max-size".to_string(), size.clone());
    }
    if let Some(ref count) = spec.log_max_file {
        log_opts.insert("max-file".to_string(), count.clone());
    }

    let host_config = HostConfig {
        binds: if spec.binds.is_empty() {
            None
        } else {
            Some(spec.binds.clone())
        },
        memory: spec.memory_bytes,
        cpu_quota: spec.cpu_quota,
        cpu_period: spec.cpu_period,
        network_mode: spec.network_mode.clone(),
        security_opt: if spec.security_opt.is_empty() {
            None
        } else {
            Some(spec.security_opt.clone())
        },
        log_config: if log_opts.is_empty() {
            None
        } else {
            Some(HostConfigLogConfig {
                typ: Some("json-file".to_string()),
                config: Some(log_opts),
            })
        },
        auto_remove: Some(spec.auto_remove),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        entrypoint: if spec.entrypoint.is_empty() {
            None
        } else {
            Some(spec.entrypoint.clone())
        },
        cmd: if spec.cmd.is_empty() {
            None
        } else {
            Some(spec.cmd.clone())
        },
        env: if spec.env.is_empty() {
            None
        } else {
            Some(spec.env.clone())
        },
        user: spec.user.clone(),
        working_dir: spec.working_dir.clone(),
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        stdin_once: Some(false),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), to_bollard_config(spec))
            .await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker.start_container::<String>(id, None).await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // Desired state already reached.
            Err(ref e) if is_not_modified(e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn inspect_container(
        &self,
        name_or_id: &str,
    ) -> Result<Option<ContainerStatus>, EngineError> {
        let response = match self
            .docker
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(ref e) if is_not_found(e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = response.state.unwrap_or_default();
        let status = state
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Some(ContainerStatus {
            id: response.id.unwrap_or_default(),
            name: response
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running: state.running.unwrap_or(false),
            status,
        }))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecOutput, EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions::<String> {
                    cmd: Some(spec.cmd.clone()),
                    env: if spec.env.is_empty() {
                        None
                    } else {
                        Some(spec.env.clone())
                    },
                    working_dir: spec.working_dir.clone(),
                    user: spec.user.clone(),
                    tty: Some(spec.tty),
                    attach_stdin: Some(spec.attach_stdin),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut collected = ExecOutput::default();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        collected.stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        collected.stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        collected.exit_code = inspect.exit_code;
        Ok(collected)
    }

    async fn attach_shell(
        &self,
        id: &str,
        replay_logs: bool,
    ) -> Result<ShellStream, EngineError> {
        let results = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(replay_logs),
                    detach_keys: None,
                }),
            )
            .await?;

        Ok(ShellStream {
            output: Box::pin(
                results
                    .output
                    .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(EngineError::from)),
            ),
            input: results.input,
        })
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        self.docker
            .create_volume(CreateVolumeOptions::<String> {
                name: name.to_string(),
                driver: "local".to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(ref e) if is_not_found(e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker.remove_volume(name, None).await?;
        Ok(())
    }

    async fn upload_archive(
        &self,
        id: &str,
        dest_path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: dest_path.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    async fn container_logs(&self, id: &str, tail: usize) -> Result<String, EngineError> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut collected = String::new();
        while let Some(chunk) = stream.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }
        Ok(collected)
    }
}
