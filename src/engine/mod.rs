//! Transport/codec engine seam
//!
//! The engine owns everything below the negotiation layer: ICE, DTLS, SRTP,
//! SCTP and the codecs. The core only drives its setup primitives through
//! [`PeerEngine`] and drains its notifications from an [`EngineEvents`]
//! stream; no callbacks run core code inline.
//!
//! ```text
//! NegotiationSession --- create/set descriptions, add candidates ---> PeerEngine
//!        ^                                                               |
//!        |  LocalCandidate                                               |
//! PeerSession <------------------- EngineEvent ---------------------------+
//!        |-- Track(FrameFeed) ------> FrameDispatcher
//!        '-- DataChannel(ProbeLink) -> Prober
//! ```

pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::dispatch::Frame;
use crate::error::Result;
use crate::signaling::{IceCandidate, SessionDescription};

pub use rtc::{OutboundVideo, RtcEngine};

/// Setup primitives of the peer connection
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description and return the description to announce to
    /// the peer. Engines that gather candidates before announcing return the
    /// completed description here.
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Release the connection and all its resources
    async fn close(&self) -> Result<()>;
}

/// Peer connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Notification from the engine
pub enum EngineEvent {
    /// Locally gathered candidate to trickle to the peer
    LocalCandidate(IceCandidate),
    /// Inbound media track
    Track(FrameFeed),
    /// Low-latency message channel is open
    DataChannel(ProbeLink),
    ConnectionState(ConnectionState),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            EngineEvent::Track(feed) => write!(f, "Track({})", feed.track_id),
            EngineEvent::DataChannel(link) => write!(f, "DataChannel({})", link.label),
            EngineEvent::ConnectionState(s) => write!(f, "ConnectionState({})", s),
        }
    }
}

/// Receiving end of the engine's notifications
pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

/// Inbound frames of one track.
///
/// Backed by a single slot: a new frame replaces one the consumer has not
/// taken yet, so a slow consumer always sees the newest frame.
pub struct FrameFeed {
    pub track_id: String,
    pub frames: watch::Receiver<Option<Frame>>,
}

/// Producing end of a [`FrameFeed`]. Assigns 1-based sequence numbers.
pub struct FrameFeedSender {
    tx: watch::Sender<Option<Frame>>,
    next_sequence: u64,
}

/// Create a connected frame feed pair for `track_id`
pub fn frame_feed(track_id: impl Into<String>) -> (FrameFeedSender, FrameFeed) {
    let (tx, rx) = watch::channel(None);
    (
        FrameFeedSender {
            tx,
            next_sequence: 1,
        },
        FrameFeed {
            track_id: track_id.into(),
            frames: rx,
        },
    )
}

impl FrameFeedSender {
    /// Publish a decoded pixel buffer; returns the sequence number it got
    pub fn push(&mut self, pixels: Bytes) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.tx.send_replace(Some(Frame::new(sequence, pixels)));
        sequence
    }

    /// Whether the consumer went away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Text message channel carried by the established connection
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;
}

/// Open data channel handed to the probe
pub struct ProbeLink {
    pub label: String,
    pub transport: Arc<dyn ProbeTransport>,
    pub inbound: mpsc::Receiver<Bytes>,
}
