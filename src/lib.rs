//! Per-user sandbox container lifecycle orchestration.
//!
//! `berth` provisions, monitors, and tears down one isolated execution
//! container per end user on a Docker-compatible engine. It is the backend
//! core behind a hosted coding-agent product: route handlers ask it for "the
//! container for user U" and get back a ready handle, an in-flight signal,
//! or a user-identified failure.
//!
//! The crate is organized into three layers:
//!
//! - [`engine`]: the container-engine seam — a [`engine::ContainerEngine`]
//!   trait plus a bollard-backed [`engine::DockerEngine`] implementation.
//! - [`config`]: environment-resolved configuration and the subscription
//!   tier resource-limit table.
//! - [`orchestrator`]: the lifecycle core — per-user state machines, the
//!   durable state store, health probing, volume seeding, and the
//!   [`orchestrator::LifecycleManager`] that drives them.
//!
//! Provisioning is race-free within a process: concurrent callers for the
//! same user are serialized through the user's state machine, never through
//! a lock around the whole creation sequence. Every state transition is
//! persisted synchronously, so a crashed process restarts into an
//! inspectable state that [`orchestrator::LifecycleManager::load_containers_from_database`]
//! reconciles against the engine.
//!
//! The orchestrator is constructed once at process start and handed to
//! consumers by dependency injection:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use berth::config::Config;
//! use berth::engine;
//! use berth::orchestrator::{LifecycleManager, StateStore};
//!
//! # async fn bootstrap() -> Result<(), berth::error::LifecycleError> {
//! let config = Config::from_env()?;
//! let docker = engine::connect(config.engine_endpoint.as_deref()).await?;
//! let store = Arc::new(StateStore::open(&config.state_db_path, config.state_cache_ttl)?);
//! let manager = Arc::new(LifecycleManager::new(Arc::new(docker), store, config));
//! manager.load_containers_from_database().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{EngineError, LifecycleError};
pub use orchestrator::{ContainerRecord, LifecycleManager, LifecycleState, StateStore};
