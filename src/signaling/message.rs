//! Signaling message types
//!
//! Messages use the JSON object shapes of the aiortc TCP signaling helper, so
//! peers built on either side can talk to each other:
//!
//! ```text
//! {"type": "offer",     "sdp": "v=0..."}
//! {"type": "answer",    "sdp": "v=0..."}
//! {"type": "candidate", "candidate": "candidate:...", "id": "0", "label": 0}
//! {"type": "bye"}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// Session description (opaque SDP text plus its type)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "label", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Minimum number of space-separated fields in a candidate attribute:
/// foundation, component, transport, priority, address, port, "typ", type
const MIN_CANDIDATE_FIELDS: usize = 8;

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }

    /// Check that the payload looks like an ICE candidate attribute.
    ///
    /// The content stays opaque to the negotiation layer; only its shape is
    /// checked so garbage is rejected before it is buffered.
    pub fn validate(&self) -> Result<()> {
        let body = self
            .candidate
            .trim()
            .strip_prefix("candidate:")
            .unwrap_or(self.candidate.trim());

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < MIN_CANDIDATE_FIELDS {
            return Err(AppError::Negotiation(format!(
                "Malformed ICE candidate ({} fields): {:?}",
                fields.len(),
                self.candidate
            )));
        }
        if fields[6] != "typ" {
            return Err(AppError::Negotiation(format!(
                "Malformed ICE candidate (missing typ): {:?}",
                self.candidate
            )));
        }
        Ok(())
    }
}

/// Message exchanged over the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireMessage", into = "WireMessage")]
pub enum SignalingMessage {
    SessionDescription(SessionDescription),
    Candidate(IceCandidate),
    /// Reserved sentinel ending the session
    Bye,
}

impl SignalingMessage {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SignalingMessage::SessionDescription(d) => match d.kind {
                SdpType::Offer => "offer",
                SdpType::Answer => "answer",
            },
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::Bye => "bye",
        }
    }

    /// Serialize to the JSON object sent on the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one complete JSON object
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| AppError::Signaling(format!("Malformed signaling message: {}", e)))
    }
}

/// Flat wire representation, tagged by `type`
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    Bye,
}

impl From<WireMessage> for SignalingMessage {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Offer { sdp } => {
                SignalingMessage::SessionDescription(SessionDescription::offer(sdp))
            }
            WireMessage::Answer { sdp } => {
                SignalingMessage::SessionDescription(SessionDescription::answer(sdp))
            }
            WireMessage::Candidate(c) => SignalingMessage::Candidate(c),
            WireMessage::Bye => SignalingMessage::Bye,
        }
    }
}

impl From<SignalingMessage> for WireMessage {
    fn from(msg: SignalingMessage) -> Self {
        match msg {
            SignalingMessage::SessionDescription(d) => match d.kind {
                SdpType::Offer => WireMessage::Offer { sdp: d.sdp },
                SdpType::Answer => WireMessage::Answer { sdp: d.sdp },
            },
            SignalingMessage::Candidate(c) => WireMessage::Candidate(c),
            SignalingMessage::Bye => WireMessage::Bye,
        }
    }
}
