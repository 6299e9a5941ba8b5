//! Session to sandbox-database registry.
//!
//! Lock discipline:
//! - `records` is held only for map mutations and never across database I/O.
//! - Each session has a gate (an async mutex) held for the whole of
//!   `get_or_create_session` and `cleanup_session`, so two calls for the same
//!   session run one after the other while other sessions proceed.
//! - While a session is being (re)provisioned its record is absent from
//!   `records`, so the sweeper cannot evict it and its fresh record is only
//!   inserted once the database is fully built.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::SandboxError;
use crate::identity::DatabaseName;
use crate::provisioner::{provision, Provisioner};
use crate::sweeper::{self, SweeperHandle};

/// Upper bound on databases kept for drop retries.
const MAX_ORPHANS: usize = 1024;

/// One live sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRecord {
    pub database: DatabaseName,
    pub last_activity: Instant,
}

/// Owns every session's sandbox record and the sweeper that expires them.
pub struct SandboxRegistry {
    records: RwLock<HashMap<String, SandboxRecord>>,
    gates: Mutex<HashMap<String, Weak<Mutex<()>>>>,
    // Databases whose drop failed; retried on each sweep.
    orphans: Mutex<Vec<DatabaseName>>,
    provisioner: Arc<dyn Provisioner>,
    session_timeout: Duration,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl SandboxRegistry {
    /// A registry without a background sweeper.
    pub fn new(provisioner: Arc<dyn Provisioner>, session_timeout: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
            provisioner,
            session_timeout,
            sweeper: Mutex::new(None),
        }
    }

    /// A registry whose sweeper runs every `sweep_interval` until
    /// [`shutdown`](Self::shutdown) or until the registry is dropped.
    pub fn start(
        provisioner: Arc<dyn Provisioner>,
        session_timeout: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let mut registry = Self::new(provisioner, session_timeout);
            registry.sweeper = Mutex::new(Some(sweeper::spawn(weak.clone(), sweep_interval)));
            registry
        })
    }

    /// Provision a fresh sandbox for `session_id`, dropping the one it had.
    ///
    /// On failure the session is left without a record and the half-built
    /// database has already been dropped.
    pub async fn get_or_create_session(&self, session_id: &str) -> Result<DatabaseName, SandboxError> {
        let _gate = self.gate(session_id).await;

        let previous = self.records.write().await.remove(session_id);
        if let Some(old) = previous {
            info!(session_id, database = %old.database, "replacing sandbox");
            self.drop_or_quarantine(old.database).await;
        }

        let database = DatabaseName::generate();
        if let Err(e) = provision(self.provisioner.as_ref(), &database).await {
            error!(session_id, database = %database, error = %e, "failed to provision sandbox");
            return Err(e);
        }

        self.records.write().await.insert(
            session_id.to_string(),
            SandboxRecord {
                database: database.clone(),
                last_activity: Instant::now(),
            },
        );
        info!(session_id, database = %database, "sandbox ready");
        Ok(database)
    }

    /// Refresh the session's last-activity time. Unknown sessions are ignored.
    pub async fn update_activity(&self, session_id: &str) {
        if let Some(record) = self.records.write().await.get_mut(session_id) {
            record.last_activity = Instant::now();
        }
    }

    pub async fn lookup_database(&self, session_id: &str) -> Option<DatabaseName> {
        self.records
            .read()
            .await
            .get(session_id)
            .map(|r| r.database.clone())
    }

    /// Drop the session's sandbox and forget the session.
    ///
    /// Returns whether the session existed. A failed drop is logged and the
    /// database queued for retry; the session is removed either way.
    pub async fn cleanup_session(&self, session_id: &str) -> bool {
        let _gate = self.gate(session_id).await;

        let Some(record) = self.records.write().await.remove(session_id) else {
            return false;
        };
        info!(session_id, database = %record.database, "cleaning up session");
        self.drop_or_quarantine(record.database).await;
        true
    }

    /// Evict every session idle for longer than the session timeout and
    /// retry queued drops. Returns the number of sessions evicted.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<(String, DatabaseName)> = {
            let mut records = self.records.write().await;
            let now = Instant::now();
            let ids: Vec<String> = records
                .iter()
                .filter(|(_, r)| now.duration_since(r.last_activity) > self.session_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| records.remove(&id).map(|r| (id, r.database)))
                .collect()
        };

        for (session_id, database) in &expired {
            info!(session_id = %session_id, database = %database, "evicting idle session");
            self.drop_or_quarantine(database.clone()).await;
        }
        self.retry_orphans().await;
        self.prune_gates().await;
        expired.len()
    }

    /// Stop the sweeper. With `drop_all`, also drop every registered sandbox
    /// and any other `sandbox_` database left on the server.
    ///
    /// Provisioning calls still in flight are not waited for.
    pub async fn shutdown(&self, drop_all: bool) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.stop().await;
        }
        if !drop_all {
            return;
        }

        let records: Vec<(String, SandboxRecord)> = self.records.write().await.drain().collect();
        for (session_id, record) in records {
            info!(session_id = %session_id, database = %record.database, "dropping sandbox at shutdown");
            self.drop_or_quarantine(record.database).await;
        }

        // Covers queued orphans and databases from earlier runs.
        match self.provisioner.list_sandbox_databases().await {
            Ok(leftovers) => {
                for database in leftovers {
                    if let Err(e) = self.provisioner.drop_database(&database).await {
                        warn!(database = %database, error = %e, "failed to drop leftover sandbox");
                    }
                }
                self.orphans.lock().await.clear();
            }
            Err(e) => {
                warn!(error = %e, "could not list leftover sandboxes");
                self.retry_orphans().await;
            }
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn orphan_count(&self) -> usize {
        self.orphans.lock().await.len()
    }

    pub fn provisioner(&self) -> &dyn Provisioner {
        self.provisioner.as_ref()
    }

    async fn gate(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().await;
            match gates.get(session_id).and_then(Weak::upgrade) {
                Some(gate) => gate,
                None => {
                    let gate = Arc::new(Mutex::new(()));
                    gates.insert(session_id.to_string(), Arc::downgrade(&gate));
                    gate
                }
            }
        };
        gate.lock_owned().await
    }

    // Dead gates are overwritten on the next lookup of the same session;
    // the rest are cleared here, once per sweep.
    async fn prune_gates(&self) {
        self.gates.lock().await.retain(|_, g| g.strong_count() > 0);
    }

    async fn drop_or_quarantine(&self, database: DatabaseName) {
        if let Err(e) = self.provisioner.drop_database(&database).await {
            warn!(database = %database, error = %e, "drop failed, queued for retry");
            let mut orphans = self.orphans.lock().await;
            if orphans.len() < MAX_ORPHANS {
                orphans.push(database);
            } else {
                error!(database = %database, "orphan queue full, sandbox leaked");
            }
        }
    }

    async fn retry_orphans(&self) {
        let pending = std::mem::take(&mut *self.orphans.lock().await);
        for database in pending {
            match self.provisioner.drop_database(&database).await {
                Ok(()) => info!(database = %database, "reclaimed orphaned sandbox"),
                Err(e) => {
                    warn!(database = %database, error = %e, "orphan drop failed again");
                    self.orphans.lock().await.push(database);
                }
            }
        }
    }
}
