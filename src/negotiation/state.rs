use serde::{Deserialize, Serialize};

/// Which side of the offer/answer exchange this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates and sends the offer
    Offerer,
    /// Waits for the offer and replies with an answer
    Answerer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

/// Coarse negotiation state
///
/// ```text
/// Idle -> SignalingReady -> LocalDescSet -> RemoteDescSet -> Established -> Closed
///                      \__________________________________________________/
///                                 any non-terminal state -> Errored
/// ```
///
/// The offerer goes `SignalingReady -> LocalDescSet -> Established`; the
/// answerer goes `SignalingReady -> RemoteDescSet -> LocalDescSet ->
/// Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    SignalingReady,
    LocalDescSet,
    RemoteDescSet,
    Established,
    Closed,
    Errored,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Errored)
    }

    /// Whether the signaling stream was ever up in this state
    pub fn is_connected(self) -> bool {
        !matches!(self, NegotiationState::Idle) && !self.is_terminal()
    }
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::SignalingReady => "signaling_ready",
            NegotiationState::LocalDescSet => "local_desc_set",
            NegotiationState::RemoteDescSet => "remote_desc_set",
            NegotiationState::Established => "established",
            NegotiationState::Closed => "closed",
            NegotiationState::Errored => "errored",
        };
        f.write_str(name)
    }
}
