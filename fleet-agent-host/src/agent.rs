//! Agent orchestrator
//!
//! Owns the node identity and wires the components to the control store:
//! every snapshot of `nodes/{id}` fans out to the command executor, the pool
//! engine and the console bridge; `storagepools/*` feeds the pool engine; a
//! heartbeat keeps the node document fresh.

use crate::config::{NodeIdentity, Settings};
use crate::console::transport::PeerTransport;
use crate::console::ConsoleBridge;
use crate::execution::shell::Shell;
use crate::execution::CommandExecutor;
use crate::hypervisor::Virsh;
use crate::inventory::{Inventory, LoadSample};
use crate::model::Node;
use crate::pools::{PoolEngine, PoolHandle};
use crate::store::{paths, DocumentStore, Patch, Snapshot};
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What the agent knows about its own node document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    /// The node document does not exist (yet)
    pub is_new_node: bool,
    /// At least one snapshot of the node document arrived
    pub node_received: bool,
}

impl Presence {
    pub fn registered(&self) -> bool {
        self.node_received && !self.is_new_node
    }
}

/// External collaborators the agent drives
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    /// Runs operator commands
    pub command_shell: Arc<dyn Shell>,
    /// Runs hypervisor CLI calls
    pub hypervisor_shell: Arc<dyn Shell>,
    pub transport: Arc<dyn PeerTransport>,
}

pub struct Agent {
    store: Arc<dyn DocumentStore>,
    identity: NodeIdentity,
    inventory: Inventory,
    node_path: String,
    executor: Arc<CommandExecutor>,
    pools: PoolHandle,
    console: Arc<ConsoleBridge>,
    heartbeat_interval: Duration,
    presence: watch::Sender<Presence>,
    candidate_sent: bool,
    described: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    /// Build the components and start the pool engine
    pub fn new(identity: NodeIdentity, inventory: Inventory, settings: &Settings, with: Collaborators) -> Self {
        let node_path = paths::node(&identity.id);

        let virsh = Virsh::new(with.hypervisor_shell, &settings.pools);
        let (engine, events) = PoolEngine::new(virsh, Arc::clone(&with.store), &settings.pools);
        let pools = engine.handle();
        let engine_task = tokio::spawn(engine.run(events));

        let executor = CommandExecutor::new(Arc::clone(&with.store), with.command_shell, node_path.clone());
        let console = ConsoleBridge::new(
            Arc::clone(&with.store),
            with.transport,
            node_path.clone(),
            &settings.console,
            &settings.agent.shell,
        );

        let (presence, _) = watch::channel(Presence::default());
        Self {
            store: with.store,
            identity,
            inventory,
            node_path,
            executor,
            pools,
            console,
            heartbeat_interval: Duration::from_secs(settings.agent.heartbeat_interval_secs.max(1)),
            presence,
            candidate_sent: false,
            described: false,
            tasks: vec![engine_task],
        }
    }

    pub fn presence(&self) -> watch::Receiver<Presence> {
        self.presence.subscribe()
    }

    /// Run until the control store goes away
    pub async fn run(mut self) -> Result<()> {
        info!("Starting agent for node {}", self.identity.id);

        let mut desired = self
            .store
            .watch_collection(paths::STORAGE_POOLS)
            .await
            .context("Failed to watch storage pools")?;
        let pools = self.pools.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(snapshot) = desired.next().await {
                pools.desired(snapshot);
            }
            warn!("Storage pool watch ended");
        }));

        self.tasks.push(tokio::spawn(heartbeat(
            Arc::clone(&self.store),
            self.node_path.clone(),
            self.presence.subscribe(),
            self.heartbeat_interval,
        )));

        let mut node = self
            .store
            .watch(&self.node_path)
            .await
            .with_context(|| format!("Failed to watch {}", self.node_path))?;
        info!("Watching {}", self.node_path);

        while let Some(snapshot) = node.next().await {
            self.on_snapshot(snapshot).await;
        }

        error!("Node document watch ended");
        anyhow::bail!("control store closed the node watch")
    }

    async fn on_snapshot(&mut self, snapshot: Snapshot) {
        self.presence.send_replace(Presence {
            is_new_node: !snapshot.exists,
            node_received: true,
        });

        if !snapshot.exists {
            if self.identity.created {
                debug!("Fresh node id, no document yet");
            }
            self.register_candidate().await;
            return;
        }

        if !self.described {
            self.describe().await;
        }

        let node = Node::from_document(&snapshot.data);
        self.executor.on_node_change(&node).await;
        self.pools.assignments(&node);
        self.console.on_node_change(&node);
    }

    /// Offer this host for registration, once per process
    async fn register_candidate(&mut self) {
        if self.candidate_sent {
            return;
        }
        let candidate = match serde_json::to_value(self.inventory.candidate(&self.identity.id)) {
            Ok(candidate) => candidate,
            Err(e) => {
                error!("Cannot encode node candidate: {}", e);
                return;
            }
        };
        let patch = Patch::new().array_union("items", vec![candidate]);
        match self.store.update(paths::NODE_CANDIDATES, patch).await {
            Ok(()) => {
                info!("Node {} is not registered yet - offered as candidate", self.identity.id);
                self.candidate_sent = true;
            }
            Err(e) => warn!("Failed to publish node candidate: {} - will retry", e),
        }
    }

    /// Write the inventory snapshot into the node document, once
    async fn describe(&mut self) {
        match self.store.update(&self.node_path, self.inventory.descriptor_patch()).await {
            Ok(()) => {
                info!("Node {} identified as {}", self.identity.id, self.inventory.hostname);
                self.described = true;
            }
            Err(e) => warn!("Failed to publish node description: {} - will retry", e),
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn heartbeat_patch(sample: &LoadSample, connected: bool) -> Patch {
    Patch::new().set(
        "heartbeat",
        json!({
            "at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "uptimeSeconds": sample.uptime_seconds,
            "load1": sample.load1,
            "memoryUsedMb": sample.memory_used_mb,
            "storeConnected": connected,
        }),
    )
}

/// Patch the heartbeat into the node document while it is registered
async fn heartbeat(
    store: Arc<dyn DocumentStore>,
    node_path: String,
    presence: watch::Receiver<Presence>,
    every: Duration,
) {
    let mut sys = System::new();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !presence.borrow().registered() {
            continue;
        }
        let sample = LoadSample::collect(&mut sys);
        let patch = heartbeat_patch(&sample, store.is_connected());
        match store.update(&node_path, patch).await {
            Ok(()) => debug!("Heartbeat sent"),
            Err(e) => warn!("Failed to send heartbeat: {}", e),
        }
    }
}
