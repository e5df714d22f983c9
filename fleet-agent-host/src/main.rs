//! Fleet Agent Host - per-host agent for the virtualization/storage fleet
//!
//! This agent keeps one host in line with the control store:
//! - Self-registration and heartbeat through the MQTT document gateway
//! - Strictly ordered remote command execution (console, reboot, shutdown)
//! - Ceph/RBD storage pool reconciliation against libvirt, with volume audits
//! - Remote console bridged over a peer data channel to a local shell

mod agent;
mod config;
mod console;
mod execution;
mod hypervisor;
mod inventory;
mod model;
mod pools;
mod store;
mod tabular;

#[cfg(test)]
mod testing;

use agent::{Agent, Collaborators};
use anyhow::{Context, Result};
use config::{Credentials, NodeIdentity, Settings};
use console::transport::PeerTransport;
use execution::shell::{Shell, SystemShell};
use inventory::Inventory;
use std::sync::Arc;
use std::time::Duration;
use store::mqtt::MqttStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "webrtc")]
fn peer_transport() -> Arc<dyn PeerTransport> {
    Arc::new(console::webrtc::WebRtcTransport::new())
}

#[cfg(not(feature = "webrtc"))]
fn peer_transport() -> Arc<dyn PeerTransport> {
    tracing::warn!("Built without a peer transport - console offers will be declined");
    Arc::new(console::transport::UnsupportedTransport)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // fine when there is no .env

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleet_agent_host=info")),
        )
        .init();

    info!("Fleet Agent Host v{} starting...", env!("CARGO_PKG_VERSION"));

    let credentials = Credentials::from_env().context("Control store credentials are not configured")?;

    let home = config::agent_home()?;
    let settings = Settings::wait_and_load(&home.join(config::SETTINGS_FILE))
        .await
        .context("Failed to load agent settings")?;
    let identity = NodeIdentity::load_or_create(&home.join(config::NODE_ID_FILE))
        .await
        .context("Failed to establish node identity")?;
    info!("Node id: {}{}", identity.id, if identity.created { " (new)" } else { "" });

    let inventory = tokio::task::spawn_blocking(Inventory::collect)
        .await
        .context("Inventory collection panicked")?;

    let store = Arc::new(MqttStore::connect(&settings.store, &credentials, &identity.id));
    let shell: Arc<dyn Shell> = Arc::new(SystemShell::new(
        settings.agent.shell.clone(),
        Duration::from_secs(settings.agent.command_timeout_secs),
    ));

    let agent = Agent::new(
        identity,
        inventory,
        &settings,
        Collaborators {
            store,
            command_shell: Arc::clone(&shell),
            hypervisor_shell: shell,
            transport: peer_transport(),
        },
    );

    agent.run().await.context("Agent execution failed")
}
