//! Storage pool reconciliation
//!
//! Desired pools come from the `storagepools` collection, assignments from
//! this node's document. A single engine task owns the tracked-pool map and
//! brings the hypervisor in line with both. Worker audit timers never touch
//! the map themselves: they post an `AuditDue` event back to the engine, so
//! every mutation and every audit is serialized on one task.

pub mod audit;

use crate::config::PoolSettings;
use crate::hypervisor::{HypervisorError, Virsh};
use crate::model::{Node, StoragePool};
use crate::store::{DocumentStore, Snapshot};
use audit::AuditPolicy;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum PoolEvent {
    /// One `storagepools/{id}` document changed (or disappeared)
    Desired(Snapshot),
    /// This node's assignment maps, as last seen in its document
    Assignments {
        pools: BTreeMap<String, bool>,
        workers: BTreeMap<String, bool>,
    },
    /// A worker timer fired for the pool
    AuditDue(String),
    /// Provisioning failed earlier and is due for another attempt
    Retry,
}

/// Delay before a failed provisioning pass is attempted again
const PROVISION_RETRY: Duration = Duration::from_secs(30);

/// Periodic audit trigger, stopped when dropped
struct AuditTimer(JoinHandle<()>);

impl Drop for AuditTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Local bookkeeping for one pool assigned to this node
pub struct PoolRuntimeState {
    pub pool: StoragePool,
    pub is_worker: bool,
    secret_key: String,
    refresh: Option<AuditTimer>,
}

impl PoolRuntimeState {
    fn new(pool: StoragePool) -> Self {
        Self {
            secret_key: pool.secret_key.clone(),
            pool,
            is_worker: false,
            refresh: None,
        }
    }

    /// Stop the periodic audit, if any
    pub fn cancel(&mut self) {
        self.refresh = None;
    }

    pub fn has_timer(&self) -> bool {
        self.refresh.is_some()
    }
}

/// Cheap handle used by the orchestrator to feed the engine
#[derive(Clone)]
pub struct PoolHandle {
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl PoolHandle {
    pub fn desired(&self, snapshot: Snapshot) {
        self.send(PoolEvent::Desired(snapshot));
    }

    pub fn assignments(&self, node: &Node) {
        self.send(PoolEvent::Assignments {
            pools: node.pool_assignments.clone(),
            workers: node.pool_worker_assignments.clone(),
        });
    }

    fn send(&self, event: PoolEvent) {
        if self.events.send(event).is_err() {
            debug!("Pool engine is gone, dropping event");
        }
    }
}

pub struct PoolEngine {
    virsh: Virsh,
    store: Arc<dyn DocumentStore>,
    policy: AuditPolicy,
    audit_interval: Duration,
    events: mpsc::UnboundedSender<PoolEvent>,
    desired: BTreeMap<String, StoragePool>,
    assignments: BTreeMap<String, bool>,
    workers: BTreeMap<String, bool>,
    tracked: BTreeMap<String, PoolRuntimeState>,
    /// Set while newly assigned pools could not be provisioned
    provision_pending: bool,
    retry: Option<AuditTimer>,
}

impl PoolEngine {
    pub fn new(
        virsh: Virsh,
        store: Arc<dyn DocumentStore>,
        settings: &PoolSettings,
    ) -> (Self, mpsc::UnboundedReceiver<PoolEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            virsh,
            store,
            policy: AuditPolicy::from_settings(settings),
            audit_interval: Duration::from_secs(settings.audit_interval_secs.max(1)),
            events,
            desired: BTreeMap::new(),
            assignments: BTreeMap::new(),
            workers: BTreeMap::new(),
            tracked: BTreeMap::new(),
            provision_pending: false,
            retry: None,
        };
        (engine, rx)
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            events: self.events.clone(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolEvent>) {
        info!("Pool engine started (audit every {}s)", self.audit_interval.as_secs());
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
    }

    pub fn is_tracked(&self, pool_id: &str) -> bool {
        self.tracked.contains_key(pool_id)
    }

    /// Pools currently holding an audit timer
    pub fn worker_registrations(&self) -> usize {
        self.tracked.values().filter(|s| s.has_timer()).count()
    }

    pub async fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Desired(snapshot) => {
                let id = snapshot.id().to_string();
                let changed = if snapshot.exists {
                    let pool = StoragePool::from_document(&id, &snapshot.data);
                    if self.desired.get(&id) == Some(&pool) && !self.provision_pending {
                        false
                    } else {
                        self.desired.insert(id, pool);
                        true
                    }
                } else {
                    self.desired.remove(&id).is_some()
                };
                if changed {
                    self.reconcile().await;
                }
            }
            PoolEvent::Assignments { pools, workers } => {
                if pools == self.assignments && workers == self.workers && !self.provision_pending {
                    return;
                }
                self.assignments = pools;
                self.workers = workers;
                self.reconcile().await;
            }
            PoolEvent::AuditDue(pool_id) => self.audit(&pool_id).await,
            PoolEvent::Retry => {
                self.retry = None;
                if self.provision_pending {
                    debug!("Retrying pool provisioning");
                    self.reconcile().await;
                }
            }
        }
    }

    /// Bring tracked pools and the hypervisor in line with desired state
    pub async fn reconcile(&mut self) {
        let received: BTreeMap<String, StoragePool> = self
            .desired
            .iter()
            .filter(|(id, _)| self.assignments.get(*id).copied().unwrap_or(false))
            .map(|(id, pool)| (id.clone(), pool.clone()))
            .collect();

        let revoked: Vec<String> = self
            .tracked
            .keys()
            .filter(|id| !received.contains_key(*id))
            .cloned()
            .collect();
        for id in revoked {
            if let Some(mut state) = self.tracked.remove(&id) {
                state.cancel();
                info!("Pool {} no longer assigned, stopped tracking", id);
            }
        }

        let extra: Vec<String> = received
            .keys()
            .filter(|id| !self.tracked.contains_key(*id))
            .cloned()
            .collect();
        if !extra.is_empty() {
            for id in &extra {
                self.tracked.insert(id.clone(), PoolRuntimeState::new(received[id].clone()));
            }
            match self.provision(&extra).await {
                Ok(()) => self.provision_pending = false,
                Err(e) => {
                    warn!("Cannot inspect hypervisor, will retry {:?}: {}", extra, e);
                    for id in &extra {
                        self.tracked.remove(id);
                    }
                    self.provision_pending = true;
                    if self.retry.is_none() {
                        self.retry = Some(self.schedule_retry());
                    }
                }
            }
        } else {
            self.provision_pending = false;
        }

        let mut redefined = BTreeSet::new();
        for (id, state) in self.tracked.iter_mut() {
            let Some(pool) = received.get(id) else { continue };

            if state.secret_key != pool.secret_key {
                info!("Secret key of pool {} rotated", id);
                state.secret_key = pool.secret_key.clone();
                if let Err(e) = self.virsh.set_secret_value(&pool.secret_uuid, &pool.secret_key).await {
                    warn!("Failed to rotate secret of pool {}: {}", id, e);
                }
            }

            if !state.pool.same_definition(pool) {
                redefined.insert(id.clone());
            }
            state.pool = pool.clone();
        }

        for state in self.tracked.values() {
            let name = state.pool.hypervisor_name();
            if let Err(e) = self.virsh.autostart(name).await {
                debug!("pool-autostart {}: {}", name, e);
            }
            if let Err(e) = self.virsh.start(name).await {
                debug!("pool-start {}: {}", name, e);
            }
        }

        let mut audit_now = Vec::new();
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        for id in ids {
            let is_worker = self.workers.get(&id).copied().unwrap_or(false);
            let timer = if is_worker && !self.tracked.get(&id).is_some_and(|s| s.has_timer()) {
                Some(self.schedule(&id))
            } else {
                None
            };
            let Some(state) = self.tracked.get_mut(&id) else { continue };
            state.is_worker = is_worker;

            if !is_worker {
                if state.has_timer() {
                    info!("No longer auditing pool {}", id);
                }
                state.cancel();
            } else if let Some(timer) = timer {
                info!("Auditing pool {} every {}s", id, self.audit_interval.as_secs());
                state.refresh = Some(timer);
                audit_now.push(id);
            } else if redefined.contains(&id) {
                audit_now.push(id);
            }
        }

        for id in audit_now {
            self.audit(&id).await;
        }
    }

    /// Define secrets and pools missing from the hypervisor for newly tracked pools
    async fn provision(&self, extra: &[String]) -> Result<(), HypervisorError> {
        let secrets = self.virsh.secrets().await?;
        let defined_pools = self.virsh.pools().await?;

        let mut defined_secrets: BTreeSet<String> = secrets.into_keys().collect();
        for (id, state) in &self.tracked {
            let uuid = &state.pool.secret_uuid;
            if uuid.is_empty() || defined_secrets.contains(uuid) {
                continue;
            }
            match self.virsh.define_secret(&state.pool).await {
                Ok(()) => {
                    info!("Defined secret {} for pool {}", uuid, id);
                    defined_secrets.insert(uuid.clone());
                }
                Err(e) => warn!("Failed to define secret for pool {}: {}", id, e),
            }
        }

        for id in extra {
            let Some(state) = self.tracked.get(id) else { continue };
            let pool = &state.pool;

            if !pool.secret_uuid.is_empty() && !pool.secret_key.is_empty() {
                if let Err(e) = self.virsh.set_secret_value(&pool.secret_uuid, &pool.secret_key).await {
                    warn!("Failed to set secret of pool {}: {}", id, e);
                }
            }

            if !defined_pools.contains_key(pool.hypervisor_name()) {
                match self.virsh.define_pool(pool).await {
                    Ok(()) => info!("Defined pool {} as {}", id, pool.hypervisor_name()),
                    Err(e) => warn!("Failed to define pool {}: {}", id, e),
                }
            }
        }
        Ok(())
    }

    fn schedule(&self, pool_id: &str) -> AuditTimer {
        let events = self.events.clone();
        let pool_id = pool_id.to_string();
        let period = self.audit_interval;

        AuditTimer(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if events.send(PoolEvent::AuditDue(pool_id.clone())).is_err() {
                    break;
                }
            }
        }))
    }

    fn schedule_retry(&self) -> AuditTimer {
        let events = self.events.clone();
        AuditTimer(tokio::spawn(async move {
            tokio::time::sleep(PROVISION_RETRY).await;
            let _ = events.send(PoolEvent::Retry);
        }))
    }

    async fn audit(&self, pool_id: &str) {
        let Some(state) = self.tracked.get(pool_id) else {
            debug!("Skipping audit of untracked pool {}", pool_id);
            return;
        };
        if !state.is_worker {
            return;
        }

        match audit::run(&self.virsh, self.store.as_ref(), pool_id, &state.pool, &self.policy, Utc::now()).await {
            Ok(report) => info!(
                "Audited pool {}: {} added, {} removed, {} refreshed",
                pool_id, report.added, report.removed, report.refreshed
            ),
            Err(e) => warn!("Audit of pool {} failed: {}", pool_id, e),
        }
    }
}
