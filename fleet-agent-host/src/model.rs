//! Documents exchanged with the control store
//!
//! Documents are written by operators and other nodes, so every decoder here
//! is lenient: a missing or mistyped field falls back to its default instead
//! of rejecting the whole document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Read `key` (or the first present alias) as `T`, default on absence or type mismatch
fn field<T: DeserializeOwned + Default>(doc: &Value, keys: &[&str]) -> T {
    keys.iter()
        .find_map(|key| doc.get(*key))
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

/// Collection fields may arrive as an array or as an id-keyed map
fn entries(value: Option<&Value>) -> Vec<(Option<String>, Value)> {
    match value {
        Some(Value::Array(items)) => items.iter().map(|item| (None, item.clone())).collect(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, item)| (Some(key.clone()), item.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// One managed host as seen in `nodes/{id}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub pool_assignments: BTreeMap<String, bool>,
    pub pool_worker_assignments: BTreeMap<String, bool>,
    pub commands: Vec<Command>,
    pub current_command: String,
    pub last_command: String,
    pub last_command_result: String,
    pub rtc: Option<SessionNegotiation>,
}

impl Node {
    pub fn from_document(doc: &Value) -> Self {
        let commands = entries(doc.get("commands"))
            .into_iter()
            .filter_map(|(key, raw)| Command::from_document(raw).map(|c| c.keyed(key)))
            .collect();

        let rtc = match doc.get("rtc") {
            Some(value) if value.is_object() => Some(SessionNegotiation::from_document(value)),
            _ => None,
        };

        Node {
            id: field(doc, &["id"]),
            name: field(doc, &["name"]),
            pool_assignments: field(doc, &["poolAssignments"]),
            pool_worker_assignments: field(doc, &["poolWorkerAssignments"]),
            commands,
            current_command: field(doc, &["currentCommand"]),
            last_command: field(doc, &["lastCommand"]),
            last_command_result: field(doc, &["lastCommandResult"]),
            rtc,
        }
    }

}

/// Command categories an operator can queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Console,
    Reboot,
    Shutdown,
}

impl CommandType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "console" => Some(CommandType::Console),
            "reboot" => Some(CommandType::Reboot),
            "shutdown" => Some(CommandType::Shutdown),
            _ => None,
        }
    }
}

/// Queued operator command. `raw` keeps the stored element verbatim so it can
/// be removed from the remote set by value. `key` is set when the queue is an
/// id-keyed map instead of an array.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub key: Option<String>,
    pub command_type: Option<CommandType>,
    pub type_name: String,
    pub command: String,
    pub raw: Value,
}

impl Command {
    pub fn from_document(raw: Value) -> Option<Self> {
        let id: String = field(&raw, &["id"]);
        if id.is_empty() {
            debug!("Skipping command without id: {}", raw);
            return None;
        }
        let type_name: String = field(&raw, &["commandType", "type"]);
        Some(Command {
            id,
            key: None,
            command_type: CommandType::parse(&type_name),
            type_name,
            command: field(&raw, &["command"]),
            raw,
        })
    }

    fn keyed(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    /// Creation time embedded in a time-ordered UUID (v1, v6 or v7)
    pub fn timestamp(&self) -> Option<(u64, u32)> {
        Uuid::parse_str(&self.id)
            .ok()
            .and_then(|uuid| uuid.get_timestamp())
            .map(|ts| ts.to_unix())
    }

    /// Submission order: embedded timestamp first, ids without one last
    pub fn submission_order(&self, other: &Self) -> Ordering {
        match (self.timestamp(), other.timestamp()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.id.cmp(&other.id)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.id.cmp(&other.id),
        }
    }
}

/// Mailbox for the out-of-band console session negotiation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionNegotiation {
    pub offer: Option<Value>,
    pub answer: Option<Value>,
    pub offer_ice_candidates: Vec<Value>,
    pub answer_ice_candidates: Vec<Value>,
}

impl SessionNegotiation {
    pub fn from_document(doc: &Value) -> Self {
        let present = |key: &str| doc.get(key).filter(|v| !v.is_null()).cloned();
        let list = |key: &str| entries(doc.get(key)).into_iter().map(|(_, v)| v).collect();
        SessionNegotiation {
            offer: present("offer"),
            answer: present("answer"),
            offer_ice_candidates: list("offerIceCandidates"),
            answer_ice_candidates: list("answerIceCandidates"),
        }
    }
}

/// Network storage pool declared in `storagepools/{id}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    pub rbd_source_name: String,
    pub datacenter: String,
    pub monitor_addresses: String,
    pub auth_user: String,
    pub secret_uuid: String,
    pub secret_key: String,
    pub files: BTreeMap<String, StoragePoolFile>,
}

impl StoragePool {
    pub fn from_document(id: &str, doc: &Value) -> Self {
        let files = entries(doc.get("files"))
            .into_iter()
            .filter_map(|(key, raw)| {
                let file = StoragePoolFile::from_document(key.as_deref(), &raw)?;
                Some((file.id.clone(), file))
            })
            .collect();

        let declared_id: String = field(doc, &["id"]);
        StoragePool {
            id: if declared_id.is_empty() { id.to_string() } else { declared_id },
            name: field(doc, &["name"]),
            rbd_source_name: field(doc, &["rbdSourceName", "rbdname"]),
            datacenter: field(doc, &["datacenter", "dc"]),
            monitor_addresses: field(doc, &["monitorAddresses", "monitors"]),
            auth_user: field(doc, &["authUser", "user"]),
            secret_uuid: field(doc, &["secretUUID", "secretuuid"]),
            secret_key: field(doc, &["secretKey", "key"]),
            files,
        }
    }

    /// Name of the pool inside the hypervisor
    pub fn hypervisor_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Everything except the volume ledger
    pub fn same_definition(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.rbd_source_name == other.rbd_source_name
            && self.datacenter == other.datacenter
            && self.monitor_addresses == other.monitor_addresses
            && self.auth_user == other.auth_user
            && self.secret_uuid == other.secret_uuid
            && self.secret_key == other.secret_key
    }
}

/// Ledger entry for one volume of a pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoragePoolFile {
    pub id: String,
    pub name: String,
    #[serde(rename = "Allocation", alias = "allocatedSize", skip_serializing_if = "Option::is_none")]
    pub allocation: Option<u64>,
    #[serde(rename = "Capacity", alias = "capacity", skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,
    #[serde(rename = "lastCheck", skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

impl StoragePoolFile {
    fn from_document(key: Option<&str>, doc: &Value) -> Option<Self> {
        if !doc.is_object() {
            return None;
        }
        let mut id: String = field(doc, &["id"]);
        if id.is_empty() {
            id = key?.to_string();
        }
        Some(StoragePoolFile {
            id,
            name: field(doc, &["name"]),
            allocation: field(doc, &["Allocation", "allocatedSize"]),
            capacity: field(doc, &["Capacity", "capacity"]),
            last_check: field(doc, &["lastCheck"]),
        })
    }
}

/// Descriptor appended to `nodecandidates/list` by a node nobody registered yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeCandidate {
    pub id: String,
    pub hostname: String,
    pub ostype: String,
    pub osplatform: String,
    pub osarch: String,
    pub osrelease: String,
}

/// `settings/rtc`: servers used to establish console sessions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtcSettings {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(default, deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl RtcSettings {
    pub fn from_document(doc: &Value) -> Self {
        RtcSettings {
            ice_servers: field(doc, &["iceServers"]),
        }
    }
}

/// `urls` is a string or a list of strings in browser RTC configurations
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}
