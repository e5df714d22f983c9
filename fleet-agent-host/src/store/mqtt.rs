//! MQTT transport for the control store
//!
//! The store is fronted by a document gateway on the broker:
//! - `{root}/docs/{path}`: retained snapshot envelope, republished on every change
//! - `{root}/get@v1`: read request, answered on `{root}/reply@v1/{client_id}`
//! - `{root}/patch@v1/{path}`: partial update carrying field operations
//!
//! A single background task drives the rumqttc event loop. Poll errors are
//! never fatal: the task waits `min(errors, 120)` seconds and polls again,
//! which makes rumqttc reconnect. Subscriptions are replayed on every ConnAck.

use super::backoff::ErrorBackoff;
use super::{DocStream, DocumentStore, Patch, Snapshot, StoreError};
use crate::config::{Credentials, StoreSettings};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Documents (node with its command queue, pools with their ledger) outgrow
/// the rumqttc default packet limit quickly
const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Topic layout of the document gateway
#[derive(Debug, Clone)]
struct Topics {
    root: String,
    reply: String,
}

impl Topics {
    fn new(root: &str, client_id: &str) -> Self {
        let root = root.trim_end_matches('/').to_string();
        let reply = format!("{}/reply@v1/{}", root, client_id);
        Self { root, reply }
    }

    fn doc(&self, path: &str) -> String {
        format!("{}/docs/{}", self.root, path)
    }

    fn collection(&self, collection: &str) -> String {
        format!("{}/docs/{}/+", self.root, collection)
    }

    fn get(&self) -> String {
        format!("{}/get@v1", self.root)
    }

    fn patch(&self, path: &str) -> String {
        format!("{}/patch@v1/{}", self.root, path)
    }

    /// Document path carried by a `docs` topic
    fn path_of<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix("/docs/"))
    }
}

/// Snapshot envelope published by the gateway
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Envelope {
    request_id: Option<String>,
    path: Option<String>,
    exists: Option<bool>,
    version: u64,
    data: Value,
}

impl Envelope {
    fn into_snapshot(self, path: String) -> Snapshot {
        let exists = self.exists.unwrap_or(!self.data.is_null());
        Snapshot {
            path,
            exists,
            version: self.version,
            data: self.data,
        }
    }
}

struct Watcher {
    filter: String,
    exact_path: Option<String>,
    tx: mpsc::UnboundedSender<Snapshot>,
    versions: HashMap<String, u64>,
}

impl Watcher {
    /// Forward unless the snapshot is older than the last one delivered for
    /// its path. Returns false once the receiving side is gone.
    fn offer(&mut self, snapshot: &Snapshot) -> bool {
        if let Some(&last) = self.versions.get(&snapshot.path) {
            let stale = snapshot.version < last || (snapshot.version == last && last > 0);
            if stale {
                return true;
            }
        }
        self.versions.insert(snapshot.path.clone(), snapshot.version);
        self.tx.send(snapshot.clone()).is_ok()
    }
}

#[derive(Default)]
struct Routes {
    watchers: Vec<Watcher>,
    pending: HashMap<String, oneshot::Sender<Snapshot>>,
}

impl Routes {
    fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.watchers.iter().map(|w| w.filter.clone()).collect();
        filters.sort();
        filters.dedup();
        filters
    }

    fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .watchers
            .iter()
            .filter_map(|w| w.exact_path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    fn deliver(&mut self, snapshot: &Snapshot, doc_topic: &str) {
        self.watchers.retain_mut(|watcher| {
            if !topic_matches(&watcher.filter, doc_topic) {
                return true;
            }
            watcher.offer(snapshot)
        });
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Control store reached through the MQTT document gateway
pub struct MqttStore {
    client: AsyncClient,
    topics: Topics,
    routes: Arc<Mutex<Routes>>,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl MqttStore {
    /// Configure the client and start the event loop task.
    /// The connection itself is established lazily by the event loop.
    pub fn connect(settings: &StoreSettings, credentials: &Credentials, node_id: &str) -> Self {
        let client_id = format!("fleet-agent-{}", node_id);

        let mut options = MqttOptions::new(&client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        options.set_clean_session(true);
        options.set_credentials(&credentials.user, &credentials.password);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, eventloop) = AsyncClient::new(options, 64);
        let topics = Topics::new(&settings.root_topic, &client_id);
        let routes = Arc::new(Mutex::new(Routes::default()));
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            topics.clone(),
            Arc::clone(&routes),
            Arc::clone(&connected),
        ));

        info!(
            "Control channel configured - broker: {}:{}, client: {}",
            settings.host, settings.port, client_id
        );

        Self {
            client,
            topics,
            routes,
            connected,
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
        }
    }

    fn get_request(&self, path: &str, request_id: &str) -> Vec<u8> {
        get_request(&self.topics, path, request_id)
    }

    async fn register_watcher(
        &self,
        filter: String,
        exact_path: Option<String>,
    ) -> Result<DocStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().watchers.push(Watcher {
            filter: filter.clone(),
            exact_path: exact_path.clone(),
            tx,
            versions: HashMap::new(),
        });

        self.client.subscribe(&filter, QoS::AtLeastOnce).await?;

        // Ask for the current state so an absent document shows up as such
        if let Some(path) = exact_path {
            let request_id = Uuid::new_v4().to_string();
            self.client
                .publish(self.topics.get(), QoS::AtLeastOnce, false, self.get_request(&path, &request_id))
                .await?;
        }

        debug!("Watching {}", filter);
        Ok(DocStream::new(rx))
    }
}

#[async_trait]
impl DocumentStore for MqttStore {
    async fn watch(&self, path: &str) -> Result<DocStream, StoreError> {
        self.register_watcher(self.topics.doc(path), Some(path.to_string()))
            .await
    }

    async fn watch_collection(&self, collection: &str) -> Result<DocStream, StoreError> {
        self.register_watcher(self.topics.collection(collection), None)
            .await
    }

    async fn get(&self, path: &str) -> Result<Snapshot, StoreError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.routes.lock().pending.insert(request_id.clone(), tx);

        let published = self
            .client
            .publish(self.topics.get(), QoS::AtLeastOnce, false, self.get_request(path, &request_id))
            .await;
        if let Err(e) = published {
            self.routes.lock().pending.remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => {
                self.routes.lock().pending.remove(&request_id);
                Err(StoreError::Timeout(path.to_string()))
            }
        }
    }

    async fn update(&self, path: &str, patch: Patch) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&json!({ "path": path, "ops": patch.ops }))?;
        self.client
            .publish(self.topics.patch(path), QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

fn get_request(topics: &Topics, path: &str, request_id: &str) -> Vec<u8> {
    json!({
        "requestId": request_id,
        "path": path,
        "replyTo": topics.reply,
    })
    .to_string()
    .into_bytes()
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    routes: Arc<Mutex<Routes>>,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = ErrorBackoff::default();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                connected.store(true, Ordering::Relaxed);
                info!("Control channel connected ({:?})", ack.code);
                replay_subscriptions(&client, &topics, &routes);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                backoff.reset();
                dispatch(&topics, &routes, &publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::Relaxed);
                let delay = backoff.record_error();
                warn!(
                    "Control channel error ({} in a row): {} - retrying in {}s",
                    backoff.consecutive(),
                    e,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Re-subscribe everything after a (re)connect. Runs inside the event loop
/// task, so only the non-blocking client calls are usable here.
fn replay_subscriptions(client: &AsyncClient, topics: &Topics, routes: &Mutex<Routes>) {
    let (filters, paths) = {
        let routes = routes.lock();
        (routes.filters(), routes.watched_paths())
    };

    if let Err(e) = client.try_subscribe(&topics.reply, QoS::AtLeastOnce) {
        warn!("Failed to subscribe to {}: {}", topics.reply, e);
    }
    for filter in &filters {
        if let Err(e) = client.try_subscribe(filter, QoS::AtLeastOnce) {
            warn!("Failed to subscribe to {}: {}", filter, e);
        }
    }
    for path in &paths {
        let request_id = Uuid::new_v4().to_string();
        if let Err(e) = client.try_publish(topics.get(), QoS::AtLeastOnce, false, get_request(topics, path, &request_id)) {
            warn!("Failed to request {}: {}", path, e);
        }
    }

    debug!("Replayed {} subscriptions", filters.len());
}

fn dispatch(topics: &Topics, routes: &Mutex<Routes>, topic: &str, payload: &[u8]) {
    let envelope: Envelope = if payload.is_empty() {
        Envelope::default()
    } else {
        match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring malformed document envelope on {}: {}", topic, e);
                return;
            }
        }
    };

    let path = if topic == topics.reply {
        match envelope.path.clone() {
            Some(path) => path,
            None => {
                warn!("Ignoring reply without document path");
                return;
            }
        }
    } else {
        match topics.path_of(topic) {
            Some(path) => path.to_string(),
            None => {
                debug!("Ignoring message on unrelated topic {}", topic);
                return;
            }
        }
    };

    let request_id = envelope.request_id.clone();
    let snapshot = envelope.into_snapshot(path);
    let doc_topic = topics.doc(&snapshot.path);

    let mut routes = routes.lock();
    if let Some(tx) = request_id.and_then(|id| routes.pending.remove(&id)) {
        let _ = tx.send(snapshot.clone());
    }
    routes.deliver(&snapshot, &doc_topic);
}
