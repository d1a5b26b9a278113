//! Per-user container lifecycle orchestration.
//!
//! The orchestrator runs in the main backend process and provides:
//! - Get-or-create provisioning that is idempotent and race-free per user
//! - Durable state machines that survive process restarts
//! - Self-healing for orphaned containers and stuck provisioning state
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               LifecycleManager                  │
//! │    get_or_create_container() -> ready handle    │
//! │    exec_in_container() / attach shell           │
//! │    stop / start / restart / destroy             │
//! │    load_containers_from_database()              │
//! │                                                 │
//! │  StateStore                                     │
//! │    per-user state machines (SQLite + cache)     │
//! │    container records (durable + mirrored)       │
//! │                                                 │
//! │  HealthMonitor · VolumeInitializer · SpecBuilder│
//! └─────────────────────────────────────────────────┘
//! ```

pub mod health;
pub mod manager;
pub mod spec;
pub mod state;
pub mod store;
pub mod volume;
pub mod workspace;

pub use health::HealthMonitor;
pub use manager::{AttachOptions, GetOrCreateOptions, LifecycleManager};
pub use spec::{container_name_for, ExecOptions, SpecBuilder};
pub use state::{LifecycleState, PersistedMachine, UserStateMachine};
pub use store::{ContainerRecord, StateStore};
pub use volume::{workspace_volume_name, VolumeInitializer};
