//! Durable workspace volume provisioning and seeding.
//!
//! Volumes are engine-managed and outlive containers; nothing here ever
//! deletes one. Seeding copies host data into a fresh volume exactly once,
//! using disposable helper containers so the orchestrator itself never
//! mounts anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::engine::{ContainerEngine, ContainerSpec};
use crate::error::{LifecycleError, Result};

use super::spec::{container_name_for, LABEL_MANAGED, LABEL_USER};

/// Marker directory proving a volume has been seeded.
const SEED_MARKER: &str = ".seeded";

/// Deterministic workspace volume name for a user.
pub fn workspace_volume_name(user_id: &str) -> String {
    format!("{}-workspace", container_name_for(user_id))
}

/// Ensures per-user workspace volumes exist and are seeded.
pub struct VolumeInitializer {
    engine: Arc<dyn ContainerEngine>,
    helper_image: String,
    seed_source: Option<PathBuf>,
}

impl VolumeInitializer {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &Config) -> Self {
        Self {
            engine,
            helper_image: config.helper_image.clone(),
            seed_source: config.seed_source.clone(),
        }
    }

    /// Ensures the user's workspace volume exists and, when a seed source
    /// is configured, has been seeded exactly once. Returns the volume
    /// name.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot create the volume or a seeding
    /// helper fails.
    pub async fn ensure_workspace_volume(&self, user_id: &str) -> Result<String> {
        let name = workspace_volume_name(user_id);

        if !self.engine.volume_exists(&name).await? {
            let mut labels = HashMap::new();
            labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
            labels.insert(LABEL_USER.to_string(), user_id.to_string());
            self.engine.create_volume(&name, &labels).await?;
            tracing::info!(user_id, volume = %name, "created workspace volume");
        }

        if let Some(source) = self.seed_source.clone() {
            self.seed_volume(user_id, &name, &source).await?;
        }

        Ok(name)
    }

    /// Seeds the volume from the host directory unless the marker directory
    /// already exists. Existing seeded data is never overwritten.
    async fn seed_volume(&self, user_id: &str, volume: &str, source: &Path) -> Result<()> {
        let check = format!("test -d /seed-target/{SEED_MARKER}");
        if self.run_helper(volume, source, &check).await? == 0 {
            tracing::debug!(volume, "workspace volume already seeded");
            return Ok(());
        }

        let copy = format!("cp -a /seed-source/. /seed-target/ && mkdir -p /seed-target/{SEED_MARKER}");
        let code = self.run_helper(volume, source, &copy).await?;
        if code != 0 {
            return Err(LifecycleError::CreationFailed {
                user_id: user_id.to_string(),
                reason: format!("volume seeding helper exited with code {code}"),
            });
        }
        tracing::info!(volume, source = %source.display(), "seeded workspace volume");
        Ok(())
    }

    /// Runs a disposable helper container against the volume and returns
    /// its exit code. The helper is removed in all paths.
    async fn run_helper(&self, volume: &str, source: &Path, script: &str) -> Result<i64> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let spec = ContainerSpec {
            name: format!("berth-seed-{}", &suffix[..12]),
            image: self.helper_image.clone(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            binds: vec![
                format!("{volume}:/seed-target"),
                format!("{}:/seed-source:ro", source.display()),
            ],
            labels,
            ..Default::default()
        };

        let id = self.engine.create_container(&spec).await?;
        let result = async {
            self.engine.start_container(&id).await?;
            self.engine.wait_container(&id).await
        }
        .await;

        if let Err(e) = self.engine.remove_container(&id, true).await {
            tracing::warn!(helper = %spec.name, error = %e, "failed to remove seeding helper");
        }

        Ok(result?)
    }
}
