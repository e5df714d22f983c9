//! Operator command queue
//!
//! Every node document change moves at most one pending command from the
//! remote `commands` set into a local FIFO. A single drain task runs the FIFO
//! one command at a time and reports progress through `currentCommand`,
//! `lastCommand` and `lastCommandResult`.

pub mod shell;

use crate::model::{Command, CommandType, Node};
use crate::store::{field_path, DocumentStore, Patch};
use parking_lot::Mutex;
use shell::Shell;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many recently claimed ids are remembered to suppress re-delivery
const CLAIM_MEMORY: usize = 256;

#[cfg(target_os = "windows")]
const REBOOT_COMMAND: &str = "shutdown /r /t 0";
#[cfg(target_os = "windows")]
const SHUTDOWN_COMMAND: &str = "shutdown /s /t 0";
#[cfg(not(target_os = "windows"))]
const REBOOT_COMMAND: &str = "shutdown -r now";
#[cfg(not(target_os = "windows"))]
const SHUTDOWN_COMMAND: &str = "shutdown -h now";

#[derive(Default)]
struct QueueState {
    queue: VecDeque<Command>,
    running: Option<String>,
    draining: bool,
    claimed: VecDeque<String>,
}

impl QueueState {
    fn is_claimed(&self, id: &str) -> bool {
        self.claimed.iter().any(|claimed| claimed == id)
    }

    fn claim(&mut self, id: &str) {
        if self.claimed.len() == CLAIM_MEMORY {
            self.claimed.pop_front();
        }
        self.claimed.push_back(id.to_string());
    }

    fn release(&mut self, id: &str) {
        self.claimed.retain(|claimed| claimed != id);
    }
}

pub struct CommandExecutor {
    store: Arc<dyn DocumentStore>,
    shell: Arc<dyn Shell>,
    node_path: String,
    state: Mutex<QueueState>,
}

impl CommandExecutor {
    pub fn new(store: Arc<dyn DocumentStore>, shell: Arc<dyn Shell>, node_path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store,
            shell,
            node_path: node_path.into(),
            state: Mutex::new(QueueState::default()),
        })
    }

    /// Take the oldest pending command out of the remote set and queue it
    pub async fn on_node_change(self: &Arc<Self>, node: &Node) {
        let command = {
            let mut state = self.state.lock();
            let Some(command) = node
                .commands
                .iter()
                .filter(|c| !state.is_claimed(&c.id))
                .min_by(|a, b| a.submission_order(b))
                .cloned()
            else {
                return;
            };
            state.claim(&command.id);
            command
        };

        let removal = match &command.key {
            Some(key) => Patch::new().delete(field_path(&["commands", key])),
            None => Patch::new().array_remove("commands", vec![command.raw.clone()]),
        };
        if let Err(e) = self.store.update(&self.node_path, removal).await {
            warn!("Failed to dequeue command {}: {} - will retry on next change", command.id, e);
            self.state.lock().release(&command.id);
            return;
        }

        debug!("Queued command {} ({})", command.id, command.type_name);
        let start_drain = {
            let mut state = self.state.lock();
            state.queue.push_back(command);
            !std::mem::replace(&mut state.draining, true)
        };
        if start_drain {
            let executor = Arc::clone(self);
            tokio::spawn(async move { executor.drain().await });
        }
    }

    /// True when nothing is queued or running
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.draining && state.queue.is_empty() && state.running.is_none()
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let command = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(command) => {
                        state.running = Some(command.id.clone());
                        command
                    }
                    None => {
                        state.running = None;
                        state.draining = false;
                        return;
                    }
                }
            };
            self.execute(&command).await;
            self.state.lock().running = None;
        }
    }

    async fn execute(&self, command: &Command) {
        let text = effective_text(command);
        info!("Executing command {} ({}): {}", command.id, command.type_name, text);

        self.report(Patch::new().set("currentCommand", text.clone())).await;

        let result = match command.command_type {
            Some(_) => self.invoke(&text).await,
            None => format!("Unsupported command type: {}", command.type_name),
        };

        self.report(
            Patch::new()
                .set("currentCommand", "")
                .set("lastCommand", text)
                .set("lastCommandResult", result),
        )
        .await;
    }

    async fn invoke(&self, text: &str) -> String {
        match self.shell.execute(text).await {
            Ok(output) if output.success() => {
                debug!("Command finished in {}ms", output.execution_time_ms);
                output.combined()
            }
            Ok(output) => {
                warn!("Command `{}` exited with code {}", text, output.exit_code);
                format!("Exit code {}\n{}", output.exit_code, output.combined())
            }
            Err(e) => {
                warn!("Command `{}` failed: {}", text, e);
                e.to_string()
            }
        }
    }

    async fn report(&self, patch: Patch) {
        if let Err(e) = self.store.update(&self.node_path, patch).await {
            warn!("Failed to report command state: {}", e);
        }
    }
}

/// Text actually handed to the shell; power commands ignore the operator text
pub fn effective_text(command: &Command) -> String {
    match command.command_type {
        Some(CommandType::Reboot) => REBOOT_COMMAND.to_string(),
        Some(CommandType::Shutdown) => SHUTDOWN_COMMAND.to_string(),
        _ => command.command.clone(),
    }
}
