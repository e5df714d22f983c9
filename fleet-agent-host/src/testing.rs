//! Test doubles shared by the module tests

use crate::execution::shell::{Shell, ShellError, ShellOutput};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Responder = Box<dyn Fn(&str) -> ShellOutput + Send + Sync>;

pub fn ok(stdout: &str) -> ShellOutput {
    ShellOutput {
        stdout: stdout.to_string(),
        ..ShellOutput::default()
    }
}

pub fn failed(code: i32, stderr: &str) -> ShellOutput {
    ShellOutput {
        stderr: stderr.to_string(),
        exit_code: code,
        ..ShellOutput::default()
    }
}

/// Records every invocation and tracks how many ran concurrently
pub struct RecordingShell {
    calls: Mutex<Vec<String>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    responder: Responder,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            responder: Box::new(|command| ok(&format!("ran {}", command))),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn responding(mut self, responder: impl Fn(&str) -> ShellOutput + Send + Sync + 'static) -> Self {
        self.responder = Box::new(responder);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Shell for RecordingShell {
    async fn execute(&self, command: &str) -> Result<ShellOutput, ShellError> {
        self.calls.lock().push(command.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let output = (self.responder)(command);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(output)
    }
}

/// Volume as the fake hypervisor reports it
#[derive(Debug, Clone)]
pub struct FakeVolume {
    pub name: String,
    pub capacity: &'static str,
    pub allocation: &'static str,
    pub provisioned: u64,
    pub used: u64,
}

impl FakeVolume {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capacity: "20.00 GiB",
            allocation: "20.00 GiB",
            provisioned: 21_474_836_480,
            used: 1_073_741_824,
        }
    }
}

#[derive(Default)]
struct HypervisorState {
    secrets: BTreeSet<String>,
    secret_values: BTreeMap<String, String>,
    pools: BTreeSet<String>,
    volumes: BTreeMap<String, Vec<FakeVolume>>,
    calls: Vec<String>,
    definitions: Vec<String>,
}

/// Stateful stand-in for virsh and rbd
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(self, uuid: &str) -> Self {
        self.state.lock().secrets.insert(uuid.to_string());
        self
    }

    pub fn with_pool(self, name: &str) -> Self {
        self.state.lock().pools.insert(name.to_string());
        self
    }

    pub fn set_volumes(&self, pool: &str, volumes: Vec<FakeVolume>) {
        self.state.lock().volumes.insert(pool.to_string(), volumes);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Calls that change hypervisor state
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains("secret-define") || c.contains("secret-set-value") || c.contains("pool-define"))
            .collect()
    }

    /// XML documents handed to the define commands
    pub fn definitions(&self) -> Vec<String> {
        self.state.lock().definitions.clone()
    }

    pub fn secret_value(&self, uuid: &str) -> Option<String> {
        self.state.lock().secret_values.get(uuid).cloned()
    }

    fn respond(&self, command: &str) -> ShellOutput {
        let args: Vec<&str> = command.split_whitespace().collect();
        let position = |flag: &str| args.iter().position(|a| *a == flag);
        let after = |flag: &str| position(flag).and_then(|i| args.get(i + 1)).map(|s| s.trim_matches('\'').to_string());

        let mut state = self.state.lock();
        state.calls.push(command.to_string());

        if command.contains("secret-list") {
            let mut out = String::from(" UUID                                   Usage\n-----------------------------------------------------------\n");
            for uuid in &state.secrets {
                out.push_str(&format!(" {}   ceph client secret\n", uuid));
            }
            return ok(&out);
        }
        if command.contains("pool-list") {
            let mut out = String::from(" Name          State     Autostart\n------------------------------------\n");
            for pool in &state.pools {
                out.push_str(&format!(" {:<13} running   yes\n", pool));
            }
            return ok(&out);
        }
        if command.contains("secret-define") || command.contains("pool-define") {
            let Some(path) = after("--file") else {
                return failed(1, "missing --file");
            };
            let xml = std::fs::read_to_string(&path).unwrap_or_default();
            if command.contains("secret-define") {
                if let Some(uuid) = between(&xml, "<uuid>", "</uuid>") {
                    state.secrets.insert(uuid);
                }
            } else if let Some(name) = between(&xml, "<name>", "</name>") {
                state.pools.insert(name);
            }
            state.definitions.push(xml);
            return ok("defined");
        }
        if command.contains("secret-set-value") {
            if let (Some(uuid), Some(value)) = (after("--secret"), after("--base64")) {
                state.secret_values.insert(uuid, value);
            }
            return ok("Secret value set");
        }
        if command.contains("vol-list") {
            let pool = after("--pool").unwrap_or_default();
            let mut out = String::from(" Name              Path                     Type      Capacity     Allocation\n---------------------------------------------------------------------------------\n");
            for volume in state.volumes.get(&pool).cloned().unwrap_or_default() {
                out.push_str(&format!(
                    " {:<17} {:<24} network   {:<12} {}\n",
                    volume.name,
                    format!("{}/{}", pool, volume.name),
                    volume.capacity,
                    volume.allocation
                ));
            }
            return ok(&out);
        }
        if command.starts_with("rbd du") {
            let image = args.last().map(|s| s.trim_matches('\'')).unwrap_or_default();
            let found = state
                .volumes
                .values()
                .flatten()
                .find(|v| v.name == image)
                .cloned();
            return match found {
                Some(v) => ok(&format!(
                    r#"{{"images":[{{"name":"{}","id":"1","provisioned_size":{},"used_size":{}}}],"total_provisioned_size":{},"total_used_size":{}}}"#,
                    v.name, v.provisioned, v.used, v.provisioned, v.used
                )),
                None => failed(2, "rbd: error opening image"),
            };
        }
        if command.contains("pool-start") {
            return failed(1, "error: Requested operation is not valid: storage pool is already active");
        }
        ok("")
    }
}

fn between(text: &str, open: &str, close: &str) -> Option<String> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(text[start..end].trim().to_string())
}

#[async_trait]
impl Shell for FakeHypervisor {
    async fn execute(&self, command: &str) -> Result<ShellOutput, ShellError> {
        Ok(self.respond(command))
    }
}

/// Poll `condition` until it holds or a second has passed
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
