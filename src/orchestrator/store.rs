//! Durable persistence and cache for per-user lifecycle state.
//!
//! SQLite is the source of truth; a read-through cache keeps the single live
//! [`UserStateMachine`] object per user per process. A corrupt persisted
//! document is treated exactly like an absent one so a fresh machine can be
//! created instead of propagating a fatal error.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, RwLock};

use crate::error::{LifecycleError, Result};

use super::state::{LifecycleState, UserStateMachine};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Durable record of a provisioned container.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContainerRecord {
    pub user_id: String,
    /// Engine container id.
    pub container_id: String,
    /// Deterministic container name.
    pub name: String,
    /// Last known status ("running", "stopped").
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

struct CacheEntry {
    machine: Arc<Mutex<UserStateMachine>>,
    refreshed_at: Instant,
}

/// Durable state store with a TTL'd in-process cache.
pub struct StateStore {
    conn: StdMutex<Connection>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl StateStore {
    /// Opens (creating if needed) the state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: StdMutex::new(conn),
            cache: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory(ttl: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: StdMutex::new(conn),
            cache: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_states (
                user_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                doc TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS container_records (
                user_id TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Connection mutex is only held across short synchronous statements.
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Serializes and upserts the machine, refreshing its cache slot.
    ///
    /// Called after every transition so the durable record never lags the
    /// in-memory machine by more than one transition.
    pub async fn save(&self, machine: &UserStateMachine) -> Result<()> {
        let doc = machine.to_json()?;
        {
            let conn = self.lock_conn();
            conn.execute(
                "INSERT INTO user_states (user_id, state, doc, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                     state = excluded.state,
                     doc = excluded.doc,
                     updated_at = excluded.updated_at",
                params![
                    machine.user_id(),
                    machine.state().to_string(),
                    doc,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }

        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get_mut(machine.user_id()) {
            entry.refreshed_at = Instant::now();
        }
        Ok(())
    }

    /// Loads the user's machine: live cache object if present, else the
    /// durable row. Returns `None` for users with no state — including rows
    /// whose document no longer parses, which are logged and treated as if
    /// they never existed.
    pub async fn load(&self, user_id: &str) -> Result<Option<Arc<Mutex<UserStateMachine>>>> {
        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get(user_id) {
            return Ok(Some(Arc::clone(&entry.machine)));
        }

        match self.load_row(user_id)? {
            Some(machine) => {
                let machine = Arc::new(Mutex::new(machine));
                cache.insert(
                    user_id.to_string(),
                    CacheEntry {
                        machine: Arc::clone(&machine),
                        refreshed_at: Instant::now(),
                    },
                );
                Ok(Some(machine))
            }
            None => Ok(None),
        }
    }

    /// Loads the user's machine or constructs a fresh one at NonExistent,
    /// persisting it immediately.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        container_name: &str,
    ) -> Result<Arc<Mutex<UserStateMachine>>> {
        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get(user_id) {
            return Ok(Arc::clone(&entry.machine));
        }

        let machine = match self.load_row(user_id)? {
            Some(machine) => machine,
            None => {
                let fresh = UserStateMachine::new(user_id, container_name);
                let doc = fresh.to_json()?;
                let conn = self.lock_conn();
                conn.execute(
                    "INSERT INTO user_states (user_id, state, doc, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                         state = excluded.state,
                         doc = excluded.doc,
                         updated_at = excluded.updated_at",
                    params![
                        user_id,
                        fresh.state().to_string(),
                        doc,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                fresh
            }
        };

        let machine = Arc::new(Mutex::new(machine));
        cache.insert(
            user_id.to_string(),
            CacheEntry {
                machine: Arc::clone(&machine),
                refreshed_at: Instant::now(),
            },
        );
        Ok(machine)
    }

    /// Reads and deserializes a durable row without touching the cache.
    fn load_row(&self, user_id: &str) -> Result<Option<UserStateMachine>> {
        let doc: Option<String> = {
            let conn = self.lock_conn();
            conn.query_row(
                "SELECT doc FROM user_states WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(doc) = doc else {
            return Ok(None);
        };

        match UserStateMachine::from_json(&doc) {
            Ok(mut machine) => {
                // A guard persisted by a dead process protects nothing; no
                // creation task from that process can still be running.
                if machine.is_protected() {
                    tracing::debug!(user_id, "lowering stale creation guard from durable row");
                    machine.end_creation();
                }
                Ok(Some(machine))
            }
            Err(e) => {
                let err = LifecycleError::CorruptedState {
                    user_id: user_id.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(user_id, error = %err, "treating corrupted state row as absent");
                Ok(None)
            }
        }
    }

    /// Users whose persisted state matches `state`, for reconciliation.
    pub async fn users_in_state(&self, state: LifecycleState) -> Result<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT user_id FROM user_states WHERE state = ?1")?;
        let rows = stmt.query_map(params![state.to_string()], |row| row.get(0))?;
        let mut users = Vec::new();
        for user in rows {
            users.push(user?);
        }
        Ok(users)
    }

    /// Deletes the user's persisted state row and cache slot.
    pub async fn delete_state(&self, user_id: &str) -> Result<()> {
        {
            let conn = self.lock_conn();
            conn.execute("DELETE FROM user_states WHERE user_id = ?1", params![user_id])?;
        }
        self.cache.write().await.remove(user_id);
        Ok(())
    }

    /// Upserts a container record.
    pub async fn upsert_record(&self, record: &ContainerRecord) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO container_records
                 (user_id, container_id, name, status, created_at, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                 container_id = excluded.container_id,
                 name = excluded.name,
                 status = excluded.status,
                 created_at = excluded.created_at,
                 last_active = excluded.last_active",
            params![
                record.user_id,
                record.container_id,
                record.name,
                record.status,
                record.created_at.to_rfc3339(),
                record.last_active.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetches the container record for a user.
    pub async fn get_record(&self, user_id: &str) -> Result<Option<ContainerRecord>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT user_id, container_id, name, status, created_at, last_active
             FROM container_records WHERE user_id = ?1",
            params![user_id],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Records marked running, used by startup recovery.
    pub async fn list_active_records(&self) -> Result<Vec<ContainerRecord>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT user_id, container_id, name, status, created_at, last_active
             FROM container_records WHERE status = 'running'",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    /// Updates the durable status of a container record.
    pub async fn update_record_status(&self, user_id: &str, status: &str) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE container_records SET status = ?2 WHERE user_id = ?1",
            params![user_id, status],
        )?;
        Ok(())
    }

    /// Refreshes the durable last-active timestamp.
    pub async fn touch_record(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE container_records SET last_active = ?2 WHERE user_id = ?1",
            params![user_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Deletes the container record for a user.
    pub async fn delete_record(&self, user_id: &str) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM container_records WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Evicts cache entries older than the TTL, returning the count.
    ///
    /// Machines that are currently locked, protected, or in flight are kept:
    /// evicting one would orphan the live object its waiters hold.
    pub async fn evict_stale(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, entry| {
            if entry.refreshed_at.elapsed() < ttl {
                return true;
            }
            match entry.machine.try_lock() {
                Ok(machine) => machine.is_protected() || machine.state().is_in_flight(),
                // Locked right now means in use.
                Err(_) => true,
            }
        });
        before - cache.len()
    }

    /// Spawns the background cache sweep. The task exits when the store is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.evict_stale().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted stale state machines from cache");
                }
            }
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerRecord> {
    let created_at: String = row.get(4)?;
    let last_active: String = row.get(5)?;
    Ok(ContainerRecord {
        user_id: row.get(0)?,
        container_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        created_at: parse_timestamp(&created_at),
        last_active: parse_timestamp(&last_active),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
