//! Environment-resolved orchestrator configuration.
//!
//! Everything the orchestrator needs at construction time is captured here
//! once, at process start. Nothing below this module reads the environment;
//! in particular the container spec builder stays a pure function of its
//! inputs.

pub(crate) mod helpers;
pub mod tiers;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

use self::helpers::{optional_env, parse_optional_env, parse_string_env};

/// Upstream credential variables forwarded into user containers when (and
/// only when) they are present in the host process environment.
const FORWARDED_CREDENTIAL_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
];

/// Per-user configuration supplied by the caller of
/// [`crate::orchestrator::LifecycleManager::get_or_create_container`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UserConfig {
    /// Subscription tier; unknown values fall back to the free tier limits.
    pub tier: String,
    /// Extra environment entries for the user's container (KEY=VALUE).
    pub extra_env: Vec<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            tier: "free".to_string(),
            extra_env: Vec::new(),
        }
    }
}

impl UserConfig {
    /// Config for a given tier with no extra environment.
    pub fn for_tier(tier: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            ..Self::default()
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine endpoint (`unix://...`, `tcp://...`); `None` auto-detects.
    pub engine_endpoint: Option<String>,
    /// Image for user sandbox containers.
    pub sandbox_image: String,
    /// Small utility image for disposable volume-seeding helpers.
    pub helper_image: String,
    /// Docker network mode for sandbox containers.
    pub network_mode: String,
    /// Host directory holding per-user bookkeeping directories.
    pub workspace_root: PathBuf,
    /// Path of the SQLite state database.
    pub state_db_path: PathBuf,
    /// Host directory to seed fresh workspace volumes from, if any.
    pub seed_source: Option<PathBuf>,
    /// Seccomp profile JSON loaded from disk at resolve time. `None` means
    /// the profile was not configured or was unreadable; the engine default
    /// applies in both cases.
    pub seccomp_profile: Option<String>,
    /// AppArmor profile name to reference, if any.
    pub apparmor_profile: Option<String>,
    /// Grace period handed to the engine when stopping containers.
    pub stop_grace_secs: i64,
    /// Deadline for the in-container readiness probe.
    pub health_timeout: Duration,
    /// Default deadline callers wait for an in-flight provisioning sequence.
    pub provision_timeout: Duration,
    /// Age past which a persisted intermediate state with no matching engine
    /// container is considered stuck and force-reset.
    pub stale_state_threshold: Duration,
    /// TTL of the in-process state machine cache.
    pub state_cache_ttl: Duration,
    /// Credential env entries (KEY=VALUE) captured from the host process.
    pub forwarded_env: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".berth");
        Self {
            engine_endpoint: None,
            sandbox_image: "berth-sandbox:latest".to_string(),
            helper_image: "busybox:stable".to_string(),
            network_mode: "bridge".to_string(),
            workspace_root: data_dir.join("workspaces"),
            state_db_path: data_dir.join("state.db"),
            seed_source: None,
            seccomp_profile: None,
            apparmor_profile: None,
            stop_grace_secs: 10,
            health_timeout: Duration::from_secs(60),
            provision_timeout: Duration::from_secs(120),
            stale_state_threshold: Duration::from_secs(30),
            state_cache_ttl: Duration::from_secs(300),
            forwarded_env: Vec::new(),
        }
    }
}

impl Config {
    /// Resolves configuration from `BERTH_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// The seccomp profile is read from disk here; an unreadable file fails
    /// open to the engine default with a warning rather than blocking
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns an error if a set variable holds an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let seccomp_path = optional_env("BERTH_SECCOMP_PROFILE")?.map(PathBuf::from);
        let seccomp_profile = seccomp_path
            .as_ref()
            .and_then(|path| match std::fs::read_to_string(path) {
                Ok(json) => Some(json),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "seccomp profile unreadable, falling back to engine default"
                    );
                    None
                }
            });

        Ok(Self {
            engine_endpoint: optional_env("BERTH_ENGINE_ENDPOINT")?,
            sandbox_image: parse_string_env("BERTH_SANDBOX_IMAGE", &defaults.sandbox_image)?,
            helper_image: parse_string_env("BERTH_HELPER_IMAGE", &defaults.helper_image)?,
            network_mode: parse_string_env("BERTH_NETWORK_MODE", &defaults.network_mode)?,
            workspace_root: optional_env("BERTH_WORKSPACE_ROOT")?
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            state_db_path: optional_env("BERTH_STATE_DB")?
                .map(PathBuf::from)
                .unwrap_or(defaults.state_db_path),
            seed_source: optional_env("BERTH_SEED_SOURCE")?.map(PathBuf::from),
            seccomp_profile,
            apparmor_profile: optional_env("BERTH_APPARMOR_PROFILE")?,
            stop_grace_secs: parse_optional_env("BERTH_STOP_GRACE_SECS", defaults.stop_grace_secs)?,
            health_timeout: Duration::from_secs(parse_optional_env(
                "BERTH_HEALTH_TIMEOUT_SECS",
                defaults.health_timeout.as_secs(),
            )?),
            provision_timeout: Duration::from_secs(parse_optional_env(
                "BERTH_PROVISION_TIMEOUT_SECS",
                defaults.provision_timeout.as_secs(),
            )?),
            stale_state_threshold: Duration::from_secs(parse_optional_env(
                "BERTH_STALE_STATE_SECS",
                defaults.stale_state_threshold.as_secs(),
            )?),
            state_cache_ttl: Duration::from_secs(parse_optional_env(
                "BERTH_STATE_CACHE_TTL_SECS",
                defaults.state_cache_ttl.as_secs(),
            )?),
            forwarded_env: capture_forwarded_env(),
        })
    }
}

/// Collects forwardable credential variables present in the host process
/// environment as ready-to-use KEY=VALUE entries.
fn capture_forwarded_env() -> Vec<String> {
    FORWARDED_CREDENTIAL_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok().map(|v| format!("{}={}", var, v)))
        .collect()
}
