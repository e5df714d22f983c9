//! [`PeerTransport`] backed by webrtc-rs

use super::transport::{
    ChannelSink, PeerConnection, PeerEvent, PeerSession, PeerState, PeerTransport, TransportError,
};
use crate::model::IceServer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Default)]
pub struct WebRtcTransport;

impl WebRtcTransport {
    pub fn new() -> Self {
        Self
    }

    async fn negotiate(&self, offer: Value, ice_servers: &[IceServer]) -> Result<PeerSession> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("registering interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.context("creating peer connection")?);
        let (tx, events) = mpsc::unbounded_channel();
        observe(&pc, tx);

        let offer: RTCSessionDescription = serde_json::from_value(offer).context("decoding offer")?;
        pc.set_remote_description(offer).await.context("applying offer")?;
        let answer = pc.create_answer(None).await.context("creating answer")?;
        pc.set_local_description(answer).await.context("applying answer")?;
        let local = pc
            .local_description()
            .await
            .context("answer missing after negotiation")?;

        Ok(PeerSession {
            answer: serde_json::to_value(local).context("encoding answer")?,
            connection: Arc::new(WebRtcConnection { pc }),
            events,
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn accept(&self, offer: Value, ice_servers: &[IceServer]) -> Result<PeerSession, TransportError> {
        self.negotiate(offer, ice_servers)
            .await
            .map_err(|e| TransportError::Negotiation(format!("{:#}", e)))
    }
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

/// Forward every callback of the connection as a [`PeerEvent`]
fn observe(pc: &RTCPeerConnection, tx: mpsc::UnboundedSender<PeerEvent>) {
    let candidates = tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json().map(serde_json::to_value) {
                Ok(Ok(init)) => {
                    let _ = candidates.send(PeerEvent::LocalCandidate(init));
                }
                Ok(Err(e)) => warn!("Cannot encode local candidate: {}", e),
                Err(e) => warn!("Cannot encode local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let states = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!("Peer connection state: {}", state);
        if let Some(state) = peer_state(state) {
            let _ = states.send(PeerEvent::StateChanged(state));
        }
        Box::pin(async {})
    }));

    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move { observe_channel(channel, tx) })
    }));
}

fn observe_channel(channel: Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<PeerEvent>) {
    let label = channel.label().to_owned();
    debug!("Data channel offered: {}", label);

    let (open_tx, open_label, sink_channel) = (tx.clone(), label.clone(), Arc::clone(&channel));
    channel.on_open(Box::new(move || {
        let sink: Arc<dyn ChannelSink> = Arc::new(DataChannelSink { channel: sink_channel });
        let _ = open_tx.send(PeerEvent::ChannelOpen {
            label: open_label,
            sink,
        });
        Box::pin(async {})
    }));

    let (message_tx, message_label) = (tx.clone(), label.clone());
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let _ = message_tx.send(PeerEvent::Message {
            label: message_label.clone(),
            text: String::from_utf8_lossy(&message.data).to_string(),
        });
        Box::pin(async {})
    }));

    channel.on_close(Box::new(move || {
        let _ = tx.send(PeerEvent::ChannelClosed { label: label.clone() });
        Box::pin(async {})
    }));
}

struct DataChannelSink {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl ChannelSink for DataChannelSink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit =
            serde_json::from_value(candidate).map_err(|e| TransportError::Candidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Closing peer connection: {}", e);
        }
    }
}
