//! Peer session seam used by the console bridge
//!
//! Offers, answers and candidates are opaque JSON, exactly as they travel
//! through the node document. Everything a live session reports comes back
//! as [`PeerEvent`]s on one channel.

use crate::model::IceServer;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer sessions are not available in this build")]
    Unsupported,
    #[error("session negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid remote candidate: {0}")]
    Candidate(String),
    #[error("channel send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// The session cannot recover from this state
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

/// Outbound half of an open data channel
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
}

pub enum PeerEvent {
    /// Candidate gathered locally, to be published for the remote side
    LocalCandidate(Value),
    StateChanged(PeerState),
    ChannelOpen {
        label: String,
        sink: Arc<dyn ChannelSink>,
    },
    Message {
        label: String,
        text: String,
    },
    ChannelClosed {
        label: String,
    },
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransportError>;

    async fn close(&self);
}

/// An accepted session: the answer to publish plus its live handles
pub struct PeerSession {
    pub answer: Value,
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Answer a remote offer
    async fn accept(&self, offer: Value, ice_servers: &[IceServer]) -> Result<PeerSession, TransportError>;
}

/// Used when the binary is built without a peer transport
pub struct UnsupportedTransport;

#[async_trait]
impl PeerTransport for UnsupportedTransport {
    async fn accept(&self, _offer: Value, _ice_servers: &[IceServer]) -> Result<PeerSession, TransportError> {
        Err(TransportError::Unsupported)
    }
}
