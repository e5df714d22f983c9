//! Remote console over a peer data channel
//!
//! The operator drops a session offer into `rtc.offer` of the node document.
//! The bridge clears it, answers through the [`PeerTransport`], relays
//! candidates in both directions through the same document, and once the
//! console channel opens pipes a shell on a pseudo-terminal over it.

pub mod pty;
pub mod transport;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use crate::config::ConsoleSettings;
use crate::model::{Node, RtcSettings};
use crate::store::{paths, DocumentStore, Patch};
use parking_lot::Mutex;
use pty::{Output, Terminal, Utf8Chunks};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport::{ChannelSink, PeerConnection, PeerEvent, PeerTransport};

/// Frames sent to the operator
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutboundFrame {
    Data { payload: String },
    Exit { code: i32 },
}

/// Frames received from the operator
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InboundFrame {
    Key { payload: String },
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Clone)]
struct ConsoleOptions {
    label: String,
    shell: String,
    cols: u16,
    rows: u16,
}

struct ActiveSession {
    connection: Arc<dyn PeerConnection>,
    task: JoinHandle<()>,
}

impl ActiveSession {
    fn shutdown(self) {
        self.task.abort();
        let connection = self.connection;
        tokio::spawn(async move { connection.close().await });
    }
}

#[derive(Default)]
struct BridgeState {
    last_offer: Option<Value>,
    /// Bumped for every accepted offer; a negotiation only installs its
    /// session while it is still the latest one
    offers: u64,
    remote_candidates: Option<watch::Sender<Vec<Value>>>,
    session: Option<ActiveSession>,
}

pub struct ConsoleBridge {
    store: Arc<dyn DocumentStore>,
    transport: Arc<dyn PeerTransport>,
    node_path: String,
    options: ConsoleOptions,
    state: Mutex<BridgeState>,
}

impl ConsoleBridge {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        transport: Arc<dyn PeerTransport>,
        node_path: impl Into<String>,
        settings: &ConsoleSettings,
        default_shell: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            node_path: node_path.into(),
            options: ConsoleOptions {
                label: settings.channel_label.clone(),
                shell: settings.shell.clone().unwrap_or_else(|| default_shell.to_string()),
                cols: settings.cols,
                rows: settings.rows,
            },
            state: Mutex::new(BridgeState::default()),
        })
    }

    pub fn on_node_change(self: &Arc<Self>, node: &Node) {
        let Some(rtc) = &node.rtc else {
            self.state.lock().last_offer = None;
            return;
        };

        let mut state = self.state.lock();
        let fresh_offer = rtc
            .offer
            .as_ref()
            .filter(|offer| state.last_offer.as_ref() != Some(*offer));

        let Some(offer) = fresh_offer.cloned() else {
            if rtc.offer.is_none() {
                state.last_offer = None;
            }
            if let Some(relay) = &state.remote_candidates {
                relay.send_if_modified(|current| {
                    let changed = *current != rtc.offer_ice_candidates;
                    if changed {
                        *current = rtc.offer_ice_candidates.clone();
                    }
                    changed
                });
            }
            return;
        };

        info!("Console session offer received");
        state.last_offer = Some(offer.clone());
        state.offers += 1;
        let ticket = state.offers;
        let (relay, candidates) = watch::channel(rtc.offer_ice_candidates.clone());
        state.remote_candidates = Some(relay);
        drop(state);

        let bridge = Arc::clone(self);
        tokio::spawn(async move { bridge.negotiate(ticket, offer, candidates).await });
    }

    async fn negotiate(self: Arc<Self>, ticket: u64, offer: Value, candidates: watch::Receiver<Vec<Value>>) {
        let consumed = Patch::new()
            .delete("rtc.offer")
            .set("rtc.answerIceCandidates", Value::Array(Vec::new()));
        if let Err(e) = self.store.update(&self.node_path, consumed).await {
            warn!("Failed to clear console offer: {}", e);
        }

        let ice_servers = match self.store.get(paths::RTC_SETTINGS).await {
            Ok(snapshot) if snapshot.exists => RtcSettings::from_document(&snapshot.data).ice_servers,
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!("Cannot read {}: {} - negotiating without ICE servers", paths::RTC_SETTINGS, e);
                Vec::new()
            }
        };

        let session = match self.transport.accept(offer, &ice_servers).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Console session not established: {}", e);
                return;
            }
        };

        // a newer offer may have arrived while negotiating
        if self.state.lock().offers != ticket {
            debug!("Console offer superseded, dropping its session");
            session.connection.close().await;
            return;
        }

        if let Err(e) = self
            .store
            .update(&self.node_path, Patch::new().set("rtc.answer", session.answer.clone()))
            .await
        {
            warn!("Failed to publish console answer: {}", e);
            session.connection.close().await;
            return;
        }
        info!("Console session answered");

        let runner = SessionRunner {
            store: Arc::clone(&self.store),
            node_path: self.node_path.clone(),
            options: self.options.clone(),
            connection: Arc::clone(&session.connection),
        };

        let installed = {
            let mut state = self.state.lock();
            if state.offers == ticket {
                let task = tokio::spawn(runner.run(session.events, candidates));
                let active = ActiveSession {
                    connection: Arc::clone(&session.connection),
                    task,
                };
                Some(state.session.replace(active))
            } else {
                None
            }
        };
        match installed {
            Some(Some(previous)) => {
                debug!("Replacing previous console session");
                previous.shutdown();
            }
            Some(None) => {}
            None => {
                debug!("Console offer superseded, dropping its session");
                session.connection.close().await;
            }
        }
    }
}

enum TerminalEvent {
    Output { generation: u64, text: String },
    Exit { generation: u64, code: i32 },
}

/// The one live terminal of a session. Dropping it kills the shell.
struct LiveTerminal {
    generation: u64,
    terminal: Terminal,
    sink: Arc<dyn ChannelSink>,
    pump: JoinHandle<()>,
}

impl Drop for LiveTerminal {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct SessionRunner {
    store: Arc<dyn DocumentStore>,
    node_path: String,
    options: ConsoleOptions,
    connection: Arc<dyn PeerConnection>,
}

impl SessionRunner {
    async fn run(self, mut events: mpsc::UnboundedReceiver<PeerEvent>, mut candidates: watch::Receiver<Vec<Value>>) {
        let mut applied = 0;
        let initial = candidates.borrow_and_update().clone();
        self.apply_candidates(&initial, &mut applied).await;

        let mut relaying = true;
        let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel();
        let mut live: Option<LiveTerminal> = None;
        let mut generation = 0;

        loop {
            tokio::select! {
                changed = candidates.changed(), if relaying => match changed {
                    Ok(()) => {
                        let list = candidates.borrow_and_update().clone();
                        self.apply_candidates(&list, &mut applied).await;
                    }
                    Err(_) => relaying = false,
                },
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        PeerEvent::LocalCandidate(candidate) => self.publish_candidate(candidate).await,
                        PeerEvent::StateChanged(state) => {
                            debug!("Console peer state: {:?}", state);
                            if state.is_terminal() {
                                info!("Console peer connection {:?}, tearing down", state);
                                break;
                            }
                        }
                        PeerEvent::ChannelOpen { label, sink } if label == self.options.label => {
                            drop(live.take());
                            generation += 1;
                            live = self.open_terminal(generation, sink, &terminal_tx).await;
                        }
                        PeerEvent::Message { label, text } if label == self.options.label => {
                            if let Some(live) = live.as_mut() {
                                handle_frame(live, &text).await;
                            }
                        }
                        PeerEvent::ChannelClosed { label } if label == self.options.label => {
                            info!("Console channel closed");
                            live = None;
                        }
                        PeerEvent::ChannelOpen { label, .. }
                        | PeerEvent::Message { label, .. }
                        | PeerEvent::ChannelClosed { label } => {
                            debug!("Ignoring event on channel {}", label);
                        }
                    }
                },
                Some(event) = terminal_rx.recv() => match event {
                    TerminalEvent::Output { generation: g, text } if g == generation => {
                        if let Some(live) = &live {
                            send_frame(live.sink.as_ref(), &OutboundFrame::Data { payload: text }).await;
                        }
                    }
                    TerminalEvent::Exit { generation: g, code } if g == generation => {
                        info!("Console shell exited with code {}", code);
                        if let Some(live) = live.take() {
                            send_frame(live.sink.as_ref(), &OutboundFrame::Exit { code }).await;
                        }
                    }
                    _ => {}
                },
            }
        }

        drop(live);
        self.connection.close().await;
    }

    /// Apply candidates not seen yet, in list order
    async fn apply_candidates(&self, candidates: &[Value], applied: &mut usize) {
        for candidate in candidates.iter().skip(*applied) {
            if let Err(e) = self.connection.add_remote_candidate(candidate.clone()).await {
                warn!("Rejected remote candidate: {}", e);
            }
        }
        *applied = (*applied).max(candidates.len());
    }

    async fn publish_candidate(&self, candidate: Value) {
        let patch = Patch::new().array_union("rtc.answerIceCandidates", vec![candidate]);
        if let Err(e) = self.store.update(&self.node_path, patch).await {
            warn!("Failed to publish local candidate: {}", e);
        }
    }

    async fn open_terminal(
        &self,
        generation: u64,
        sink: Arc<dyn ChannelSink>,
        events: &mpsc::UnboundedSender<TerminalEvent>,
    ) -> Option<LiveTerminal> {
        let (terminal, mut output) = match Terminal::spawn(&self.options.shell, self.options.cols, self.options.rows) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!("Cannot start console shell: {}", e);
                send_frame(sink.as_ref(), &OutboundFrame::Exit { code: -1 }).await;
                return None;
            }
        };
        info!("Console shell {} started", self.options.shell);

        let events = events.clone();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut text = Utf8Chunks::default();
            loop {
                match output.next(&mut buf).await {
                    Output::Data(n) => {
                        let chunk = text.push(&buf[..n]);
                        if !chunk.is_empty() && events.send(TerminalEvent::Output { generation, text: chunk }).is_err() {
                            return;
                        }
                    }
                    Output::Exited(code) => {
                        let _ = events.send(TerminalEvent::Exit { generation, code });
                        return;
                    }
                }
            }
        });

        Some(LiveTerminal {
            generation,
            terminal,
            sink,
            pump,
        })
    }
}

async fn handle_frame(live: &mut LiveTerminal, text: &str) {
    match serde_json::from_str::<InboundFrame>(text) {
        Ok(InboundFrame::Key { payload }) => {
            if let Err(e) = live.terminal.write(payload.as_bytes()).await {
                warn!("Console input dropped: {}", e);
            }
        }
        Ok(InboundFrame::Resize { cols, rows }) => {
            debug!("Console {} resized to {}x{}", live.generation, cols, rows);
            if let Err(e) = live.terminal.resize(cols, rows) {
                warn!("Console resize failed: {}", e);
            }
        }
        Err(e) => debug!("Ignoring console frame {}: {}", text, e),
    }
}

async fn send_frame(sink: &dyn ChannelSink, frame: &OutboundFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            if let Err(e) = sink.send_text(text).await {
                debug!("Console frame not delivered: {}", e);
            }
        }
        Err(e) => warn!("Cannot encode console frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IceServer;
    use crate::store::memory::MemoryStore;
    use crate::testing::eventually;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use transport::{PeerSession, PeerState, TransportError, UnsupportedTransport};

    const NODE: &str = "nodes/n1";

    #[derive(Default)]
    struct FakeConnection {
        candidates: Mutex<Vec<Value>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransportError> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeSink {
        frames: Mutex<Vec<Value>>,
    }

    impl FakeSink {
        fn frames(&self) -> Vec<Value> {
            self.frames.lock().clone()
        }

        fn output(&self) -> String {
            self.frames()
                .iter()
                .filter(|f| f["type"] == "data")
                .filter_map(|f| f["payload"].as_str().map(String::from))
                .collect()
        }
    }

    #[async_trait]
    impl ChannelSink for FakeSink {
        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            let frame = serde_json::from_str(&text).map_err(|e| TransportError::Send(e.to_string()))?;
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    struct Accepted {
        ice_servers: Vec<IceServer>,
        connection: Arc<FakeConnection>,
        events: mpsc::UnboundedSender<PeerEvent>,
    }

    #[derive(Default)]
    struct FakeTransport {
        accepted: Mutex<Vec<Accepted>>,
    }

    impl FakeTransport {
        fn count(&self) -> usize {
            self.accepted.lock().len()
        }

        fn last(&self) -> (Arc<FakeConnection>, mpsc::UnboundedSender<PeerEvent>) {
            let accepted = self.accepted.lock();
            let last = accepted.last().unwrap();
            (last.connection.clone(), last.events.clone())
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn accept(&self, offer: Value, ice_servers: &[IceServer]) -> Result<PeerSession, TransportError> {
            let connection = Arc::new(FakeConnection::default());
            let (events, rx) = mpsc::unbounded_channel();
            self.accepted.lock().push(Accepted {
                ice_servers: ice_servers.to_vec(),
                connection: connection.clone(),
                events,
            });
            Ok(PeerSession {
                answer: json!({"type": "answer", "sdp": format!("answer to {}", offer["sdp"])}),
                connection,
                events: rx,
            })
        }
    }

    fn settings() -> ConsoleSettings {
        ConsoleSettings {
            channel_label: "console".into(),
            cols: 80,
            rows: 30,
            shell: Some("sh".into()),
        }
    }

    fn setup(offer_candidates: Value) -> (MemoryStore, Arc<FakeTransport>, Arc<ConsoleBridge>) {
        let store = MemoryStore::new();
        store.insert(paths::RTC_SETTINGS, json!({"iceServers": [{"urls": "stun:stun.example.org"}]}));
        store.insert(
            NODE,
            json!({"rtc": {"offer": {"type": "offer", "sdp": "v=0"}, "offerIceCandidates": offer_candidates}}),
        );
        let transport = Arc::new(FakeTransport::default());
        let bridge = ConsoleBridge::new(Arc::new(store.clone()), transport.clone(), NODE, &settings(), "bash");
        (store, transport, bridge)
    }

    fn node(store: &MemoryStore) -> Node {
        Node::from_document(&store.document(NODE).unwrap())
    }

    /// Like `eventually`, with room for a shell to start
    async fn settles(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        condition()
    }

    fn key(text: &str) -> PeerEvent {
        let frame = json!({"type": "key", "payload": text});
        PeerEvent::Message { label: "console".into(), text: frame.to_string() }
    }

    fn open(sink: &Arc<FakeSink>) -> PeerEvent {
        PeerEvent::ChannelOpen { label: "console".into(), sink: sink.clone() }
    }

    /// Ask the shell behind `sink` for its pid
    async fn shell_pid(events: &mpsc::UnboundedSender<PeerEvent>, sink: &FakeSink) -> u32 {
        events.send(key("echo pid-$$\n")).unwrap();
        let pid = || {
            let output = sink.output();
            output.match_indices("pid-").find_map(|(at, _)| {
                let digits: String = output[at + 4..].chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            })
        };
        assert!(settles(|| pid().is_some()).await);
        pid().unwrap()
    }

    /// Gone or a zombie waiting to be reaped
    fn is_dead(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_offer_is_answered_once() {
        let (store, transport, bridge) = setup(json!([]));
        let stale = node(&store);

        bridge.on_node_change(&stale);
        assert!(eventually(|| store.document(NODE).unwrap()["rtc"].get("answer").is_some()).await);

        let rtc = store.document(NODE).unwrap()["rtc"].clone();
        assert!(rtc.get("offer").is_none());
        assert_eq!(rtc["answer"]["sdp"], "answer to \"v=0\"");
        assert_eq!(transport.accepted.lock()[0].ice_servers[0].urls, vec!["stun:stun.example.org"]);

        // the same offer delivered again before the clear landed
        bridge.on_node_change(&stale);
        bridge.on_node_change(&node(&store));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(transport.count(), 1);
    }

    #[tokio::test]
    async fn test_candidates_are_relayed_both_ways() {
        let (store, transport, bridge) = setup(json!([{"candidate": "a"}]));
        bridge.on_node_change(&node(&store));
        assert!(eventually(|| transport.count() == 1).await);
        let (connection, events) = transport.last();
        assert!(eventually(|| connection.candidates.lock().len() == 1).await);

        store
            .update(NODE, Patch::new().array_union("rtc.offerIceCandidates", vec![json!({"candidate": "b"})]))
            .await
            .unwrap();
        bridge.on_node_change(&node(&store));
        bridge.on_node_change(&node(&store));
        assert!(eventually(|| connection.candidates.lock().len() == 2).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            *connection.candidates.lock(),
            vec![json!({"candidate": "a"}), json!({"candidate": "b"})]
        );

        events.send(PeerEvent::LocalCandidate(json!({"candidate": "local-1"}))).unwrap();
        events.send(PeerEvent::LocalCandidate(json!({"candidate": "local-2"}))).unwrap();
        assert!(eventually(|| {
            store.document(NODE).unwrap()["rtc"]["answerIceCandidates"]
                == json!([{"candidate": "local-1"}, {"candidate": "local-2"}])
        })
        .await);
    }

    #[tokio::test]
    async fn test_failed_connection_stops_relay() {
        let (store, transport, bridge) = setup(json!([]));
        bridge.on_node_change(&node(&store));
        assert!(eventually(|| transport.count() == 1).await);
        let (connection, events) = transport.last();

        events.send(PeerEvent::StateChanged(PeerState::Failed)).unwrap();
        assert!(eventually(|| connection.closed.load(Ordering::SeqCst)).await);

        store
            .update(NODE, Patch::new().array_union("rtc.offerIceCandidates", vec![json!({"candidate": "late"})]))
            .await
            .unwrap();
        bridge.on_node_change(&node(&store));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(connection.candidates.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_transport_consumes_offer() {
        let store = MemoryStore::new();
        store.insert(NODE, json!({"rtc": {"offer": {"type": "offer", "sdp": "v=0"}}}));
        let bridge = ConsoleBridge::new(
            Arc::new(store.clone()),
            Arc::new(UnsupportedTransport),
            NODE,
            &settings(),
            "bash",
        );

        bridge.on_node_change(&node(&store));
        assert!(eventually(|| store.document(NODE).unwrap()["rtc"].get("offer").is_none()).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(store.document(NODE).unwrap()["rtc"].get("answer").is_none());
    }

    #[tokio::test]
    async fn test_console_channel_runs_shell() {
        let (store, transport, bridge) = setup(json!([]));
        bridge.on_node_change(&node(&store));
        assert!(eventually(|| transport.count() == 1).await);
        let (_connection, events) = transport.last();

        let other = Arc::new(FakeSink::default());
        events
            .send(PeerEvent::ChannelOpen { label: "metrics".into(), sink: other.clone() })
            .unwrap();
        let sink = Arc::new(FakeSink::default());
        events
            .send(PeerEvent::ChannelOpen { label: "console".into(), sink: sink.clone() })
            .unwrap();
        let send = |frame: Value| {
            events
                .send(PeerEvent::Message { label: "console".into(), text: frame.to_string() })
                .unwrap()
        };
        send(json!({"type": "resize", "cols": 100, "rows": 40}));
        send(json!({"type": "bogus"}));
        send(json!({"type": "key", "payload": "echo bridge-$((1 + 1))\n"}));

        assert!(settles(|| sink.output().contains("bridge-2")).await);

        send(json!({"type": "key", "payload": "exit 5\n"}));
        assert!(settles(|| sink.frames().iter().any(|f| *f == json!({"type": "exit", "code": 5}))).await);
        assert!(other.frames().is_empty());
    }

    #[tokio::test]
    async fn test_reopened_channel_replaces_terminal() {
        let (store, transport, bridge) = setup(json!([]));
        bridge.on_node_change(&node(&store));
        assert!(eventually(|| transport.count() == 1).await);
        let (_connection, events) = transport.last();

        let first = Arc::new(FakeSink::default());
        events.send(open(&first)).unwrap();
        let first_pid = shell_pid(&events, &first).await;

        let second = Arc::new(FakeSink::default());
        events.send(open(&second)).unwrap();
        let second_pid = shell_pid(&events, &second).await;
        assert_ne!(first_pid, second_pid);
        assert!(settles(|| is_dead(first_pid)).await);

        events.send(key("echo second-$((2 + 2))\n")).unwrap();
        assert!(settles(|| second.output().contains("second-4")).await);
        events.send(key("exit 7\n")).unwrap();
        assert!(settles(|| second.frames().iter().any(|f| *f == json!({"type": "exit", "code": 7}))).await);

        // nothing from the replacement, not even the killed shell's exit
        assert!(!first.output().contains("second-4"));
        assert!(!first.output().contains(&format!("pid-{second_pid}")));
        assert!(first.frames().iter().all(|f| f["type"] == "data"));
    }

    #[tokio::test]
    async fn test_closed_channel_kills_shell_and_drops_keys() {
        let (store, transport, bridge) = setup(json!([]));
        bridge.on_node_change(&node(&store));
        assert!(eventually(|| transport.count() == 1).await);
        let (connection, events) = transport.last();

        let sink = Arc::new(FakeSink::default());
        events.send(open(&sink)).unwrap();
        let pid = shell_pid(&events, &sink).await;

        events.send(PeerEvent::ChannelClosed { label: "console".into() }).unwrap();
        assert!(settles(|| is_dead(pid)).await);

        let frames = sink.frames().len();
        events.send(key("echo late-$((3 + 3))\n")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(sink.frames().len(), frames);
        assert!(!sink.output().contains("late-6"));

        // the peer connection itself stays up
        assert!(!connection.closed.load(Ordering::SeqCst));
    }
}
