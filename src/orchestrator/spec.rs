//! Pure builders for engine container and exec specs.
//!
//! Everything here is data transformation: no engine calls, no environment
//! reads, and deterministic output for identical inputs aside from the
//! created-at label.

use std::collections::HashMap;

use crate::config::tiers::limits_for_tier;
use crate::config::{Config, UserConfig};
use crate::engine::{ContainerSpec, ExecSpec};

/// Mount point of the durable workspace volume inside the container.
pub const WORKSPACE_DIR: &str = "/workspace";
/// Directory receiving the default extension payload.
pub const EXTENSIONS_DIR: &str = "/home/user/.claude";
/// uid:gid sandbox containers run as.
const SANDBOX_USER: &str = "1000:1000";

/// Label marking containers and volumes this orchestrator owns, for
/// grouping and bulk cleanup queries.
pub const LABEL_MANAGED: &str = "berth.managed";
/// Label carrying the owning user id.
pub const LABEL_USER: &str = "berth.user";
/// Label carrying the creation timestamp.
pub const LABEL_CREATED_AT: &str = "berth.created-at";

const LOG_MAX_SIZE: &str = "10m";
const LOG_MAX_FILE: &str = "3";

/// Deterministic container name for a user.
pub fn container_name_for(user_id: &str) -> String {
    format!("claude-user-{user_id}")
}

/// Options for a one-shot exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Allocate a TTY for the exec process.
    pub tty: bool,
    /// Attach stdin to the exec process.
    pub attach_stdin: bool,
    /// Working directory; defaults to the workspace mount.
    pub working_dir: Option<String>,
    /// Extra environment entries (KEY=VALUE).
    pub env: Vec<String>,
    /// User override.
    pub user: Option<String>,
}

/// Builds engine specs from orchestrator configuration.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    image: String,
    network_mode: String,
    seccomp_profile: Option<String>,
    apparmor_profile: Option<String>,
    forwarded_env: Vec<String>,
}

impl SpecBuilder {
    /// Captures the spec-relevant slice of the orchestrator config.
    pub fn new(config: &Config) -> Self {
        Self {
            image: config.sandbox_image.clone(),
            network_mode: config.network_mode.clone(),
            seccomp_profile: config.seccomp_profile.clone(),
            apparmor_profile: config.apparmor_profile.clone(),
            forwarded_env: config.forwarded_env.clone(),
        }
    }

    /// Builds the creation spec for a user's sandbox container.
    ///
    /// The entrypoint is a long-lived interactive shell with TTY and stdin
    /// attached: attaching to it later yields a genuine bidirectional
    /// stream, where a one-shot exec would only ever give a read side.
    pub fn build_container_spec(
        &self,
        name: &str,
        volume_name: &str,
        user_id: &str,
        user: &UserConfig,
    ) -> ContainerSpec {
        let limits = limits_for_tier(&user.tier);

        let mut env = vec![
            format!("BERTH_USER_ID={user_id}"),
            format!("BERTH_TIER={}", user.tier),
            format!("BERTH_WORKSPACE={WORKSPACE_DIR}"),
            format!("CLAUDE_CONFIG_DIR={EXTENSIONS_DIR}"),
        ];
        env.extend(self.forwarded_env.iter().cloned());
        env.extend(user.extra_env.iter().cloned());

        let mut security_opt = vec!["no-new-privileges:true".to_string()];
        if let Some(ref profile) = self.seccomp_profile {
            security_opt.push(format!("seccomp={profile}"));
        }
        if let Some(ref profile) = self.apparmor_profile {
            security_opt.push(format!("apparmor={profile}"));
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_USER.to_string(), user_id.to_string());
        labels.insert(
            LABEL_CREATED_AT.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );

        ContainerSpec {
            name: name.to_string(),
            image: self.image.clone(),
            entrypoint: vec!["/bin/bash".to_string()],
            cmd: Vec::new(),
            env,
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            tty: true,
            open_stdin: true,
            binds: vec![format!("{volume_name}:{WORKSPACE_DIR}")],
            memory_bytes: Some(limits.memory_bytes),
            cpu_quota: Some(limits.cpu_quota),
            cpu_period: Some(limits.cpu_period),
            network_mode: Some(self.network_mode.clone()),
            security_opt,
            log_max_size: Some(LOG_MAX_SIZE.to_string()),
            log_max_file: Some(LOG_MAX_FILE.to_string()),
            labels,
            auto_remove: false,
        }
    }

    /// Builds a shell-wrapped one-shot exec spec.
    pub fn build_exec_spec(command: &str, opts: &ExecOptions) -> ExecSpec {
        ExecSpec {
            cmd: vec![
                "/bin/sh".to_string(),
                "-lc".to_string(),
                command.to_string(),
            ],
            env: opts.env.clone(),
            working_dir: opts
                .working_dir
                .clone()
                .or_else(|| Some(WORKSPACE_DIR.to_string())),
            tty: opts.tty,
            attach_stdin: opts.attach_stdin,
            user: opts.user.clone(),
        }
    }
}
