//! Test doubles shared by unit tests

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::engine::{EngineEvent, EngineEvents, PeerEngine, ProbeLink, ProbeTransport};
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Engine that records every call and fabricates descriptions
pub struct MockEngine {
    calls: Mutex<Vec<EngineCall>>,
    fail_next: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    // Keeps the channel open when nobody took the receiver
    _events_rx: Mutex<Option<EngineEvents>>,
}

impl MockEngine {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            events: tx,
            _events_rx: Mutex::new(Some(rx)),
        }
    }

    /// Engine plus the stream of events it emits
    pub fn with_events() -> (Arc<Self>, EngineEvents) {
        let engine = Self::new();
        let rx = engine._events_rx.lock().take().expect("fresh engine");
        (Arc::new(engine), rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                EngineCall::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| **c == EngineCall::Close)
            .count()
    }

    /// Make the next call fail with a transport error
    pub fn fail_next(&self, reason: &str) {
        *self.fail_next.lock() = Some(reason.to_string());
    }

    fn record(&self, call: EngineCall) -> Result<()> {
        self.calls.lock().push(call);
        match self.fail_next.lock().take() {
            Some(reason) => Err(AppError::Transport(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(EngineCall::CreateOffer)?;
        Ok(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(EngineCall::CreateAnswer)?;
        Ok(SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription> {
        self.record(EngineCall::SetLocal(desc.kind))?;
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(EngineCall::SetRemote(desc.kind))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(EngineCall::AddCandidate(candidate.candidate))
    }

    async fn close(&self) -> Result<()> {
        self.record(EngineCall::Close)
    }
}

/// Probe transport that forwards into the other end's inbound queue
struct MemoryTransport {
    peer: mpsc::Sender<Bytes>,
}

#[async_trait]
impl ProbeTransport for MemoryTransport {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.peer
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .await
            .map_err(|_| AppError::Transport("probe peer gone".into()))
    }
}

/// Two probe links wired to each other
pub fn probe_link_pair(label: &str) -> (ProbeLink, ProbeLink) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        ProbeLink {
            label: label.to_string(),
            transport: Arc::new(MemoryTransport { peer: b_tx }),
            inbound: a_rx,
        },
        ProbeLink {
            label: label.to_string(),
            transport: Arc::new(MemoryTransport { peer: a_tx }),
            inbound: b_rx,
        },
    )
}

/// Probe transport that keeps what was sent
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ProbeTransport for RecordingTransport {
    async fn send_text(&self, text: &str) -> Result<()> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}

/// Probe link whose outbound side is recorded and whose inbound side is fed
/// by the returned sender
pub fn recording_link(
    label: &str,
) -> (ProbeLink, Arc<RecordingTransport>, mpsc::Sender<Bytes>) {
    let transport = Arc::new(RecordingTransport::default());
    let (tx, rx) = mpsc::channel(64);
    (
        ProbeLink {
            label: label.to_string(),
            transport: transport.clone(),
            inbound: rx,
        },
        transport,
        tx,
    )
}
